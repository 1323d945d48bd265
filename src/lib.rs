//! txflood - transaction dispatch and confirmation core for blockchain load
//! generation
//!
//! Scenario code builds and signs transactions; this library paces them,
//! hands out nonces, submits with endpoint fallback and tracks them to
//! inclusion.

pub mod blob;
pub mod config;
pub mod confirmation;
pub mod endpoints;
pub mod metrics;
pub mod recovery;
pub mod scheduler;
pub mod structured_logging;
pub mod submitter;
pub mod throughput;
pub mod types;

// Component modules with non-standard paths (directories with spaces)
#[path = "nonce manager/mod.rs"]
pub mod nonce_manager;

#[path = "rpc manager/mod.rs"]
pub mod rpc_manager;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

// Re-export commonly used types
pub use confirmation::{ConfirmationEngine, EngineConfig};
pub use nonce_manager::{AccountLedger, NonceOutcome};
pub use rpc_manager::{EndpointPool, EndpointProvider, JsonRpcEndpoint, RpcEndpoint};
pub use scheduler::{run_scheduled_work, IterationContext, ScheduleConfig, ScheduleReport};
pub use submitter::{SendOptions, TxSubmitter};
pub use types::{Address, Receipt, SignedTransaction, TxHash};
