//! Nonce Manager Module
//!
//! Per-account nonce allocation, confirmation waits and the retry helper used
//! for authoritative chain reads.

// Submodules
pub mod nonce_errors;
pub mod nonce_ledger;
pub mod nonce_retry;

// Re-exports for convenience
pub use nonce_errors::{NonceError, NonceResult};
pub use nonce_ledger::{AccountLedger, NonceOutcome, NonceWaiter};
pub use nonce_retry::{retry_with_backoff, RetryConfig};
