//! Submission path
//!
//! Delivers signed transactions with endpoint fallback, schedules
//! rebroadcasts and reports the confirmation outcome exactly once.

pub mod sender;

pub use sender::TxSubmitter;

use crate::nonce_manager::NonceError;
use crate::rpc_manager::{RpcEndpoint, RpcError};
use crate::types::{Receipt, SignedTransaction};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Submission errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The provider had no endpoint to try
    #[error("No endpoints available")]
    NoEndpoints,

    /// Every endpoint in the rotation rejected the transaction
    #[error("All {attempts} endpoint attempts failed, last error: {last}")]
    AllEndpointsFailed { attempts: usize, last: RpcError },

    /// The governing context was cancelled
    #[error("Submission cancelled")]
    Cancelled,

    #[error("Ledger error: {0}")]
    Ledger(#[from] NonceError),
}

/// Result type for submissions
pub type SubmitResult<T> = Result<T, SubmitError>;

impl SubmitError {
    /// Cancellation means "don't report", not "report failure"
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SubmitError::Cancelled) || matches!(self, SubmitError::Ledger(e) if e.is_cancelled())
    }

    pub fn is_no_endpoints(&self) -> bool {
        matches!(self, SubmitError::NoEndpoints)
    }
}

/// Outcome handed to the confirm callback. `Ok(None)` means the nonce moved
/// past this transaction without its receipt being found.
pub type ConfirmResult = Result<Option<Receipt>, SubmitError>;

/// Called exactly once per confirmed-or-abandoned submission
pub type OnConfirm = Box<dyn FnOnce(&SignedTransaction, ConfirmResult) + Send + 'static>;

/// One delivery attempt to one endpoint
#[derive(Debug)]
pub struct SubmitAttempt<'a> {
    pub tx: &'a SignedTransaction,
    pub endpoint: &'a str,
    /// Position within this delivery round
    pub attempt: usize,
    /// 0 for the initial send, n for the n-th rebroadcast
    pub rebroadcast: u32,
    pub error: Option<&'a RpcError>,
}

/// Per-attempt logging hook
pub type SubmitLogFn = Arc<dyn Fn(&SubmitAttempt<'_>) + Send + Sync>;

/// Timed re-delivery of an accepted transaction until it confirms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebroadcastPolicy {
    pub count: u32,
    pub interval: Duration,
}

/// Per-send options
#[derive(Default)]
pub struct SendOptions {
    /// Tried before the provider rotation
    pub endpoint: Option<Arc<dyn RpcEndpoint>>,
    pub rebroadcast: Option<RebroadcastPolicy>,
    pub on_confirm: Option<OnConfirm>,
    pub log_fn: Option<SubmitLogFn>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: Arc<dyn RpcEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_rebroadcast(mut self, policy: RebroadcastPolicy) -> Self {
        self.rebroadcast = Some(policy);
        self
    }

    pub fn with_log_fn(mut self, log_fn: SubmitLogFn) -> Self {
        self.log_fn = Some(log_fn);
        self
    }

    pub fn on_confirm<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&SignedTransaction, ConfirmResult) + Send + 'static,
    {
        self.on_confirm = Some(Box::new(callback));
        self
    }

    fn wants_confirmation(&self) -> bool {
        self.on_confirm.is_some() || self.rebroadcast.is_some_and(|p| p.count > 0)
    }
}

impl std::fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOptions")
            .field("endpoint", &self.endpoint.as_ref().map(|e| e.name().to_string()))
            .field("rebroadcast", &self.rebroadcast)
            .field("on_confirm", &self.on_confirm.is_some())
            .field("log_fn", &self.log_fn.is_some())
            .finish()
    }
}
