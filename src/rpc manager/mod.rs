//! RPC Manager Module
//!
//! Endpoint capability used by the dispatch core, a JSON-RPC client, and a
//! health-tracked pool that implements the capability over many nodes.

// Submodules
pub mod endpoint;
pub mod rpc_client;
pub mod rpc_errors;
pub mod rpc_pool;

// Re-exports for convenience
pub use endpoint::{rotation, EndpointProvider, RpcEndpoint, StaticEndpoints};
pub use rpc_client::JsonRpcEndpoint;
pub use rpc_errors::{RpcError, RpcResult};
pub use rpc_pool::{EndpointPool, HealthChangeEvent, HealthStatus, PoolStats};
