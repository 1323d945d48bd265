use crate::rpc_manager::RpcError;
use crate::types::{Address, TxHash};
use thiserror::Error;

/// Account ledger errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NonceError {
    /// The governing cancellation token fired while waiting
    #[error("Wait for nonce {nonce} cancelled")]
    Cancelled { nonce: u64 },

    /// The waiter slot was discarded without a resolution
    #[error("Waiter for nonce {nonce} of {address} was dropped")]
    WaiterDropped { address: Address, nonce: u64 },

    /// Endpoint call failed
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Every endpoint answered but none knows the receipt yet
    #[error("Receipt for {0} not found")]
    ReceiptNotFound(TxHash),

    /// No endpoint could be obtained for an authoritative read
    #[error("No endpoint available for {0}")]
    NoEndpoint(&'static str),

    /// Retry loop ran out of attempts without recording an error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for ledger operations
pub type NonceResult<T> = Result<T, NonceError>;

impl NonceError {
    /// Check if error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            NonceError::Rpc(e) => e.is_retryable(),
            NonceError::NoEndpoint(_) => true,
            NonceError::ReceiptNotFound(_) => true,
            NonceError::Cancelled { .. } => false,
            NonceError::WaiterDropped { .. } => false,
            NonceError::Internal(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NonceError::Cancelled { .. })
    }
}
