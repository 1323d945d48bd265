//! Structured logging for runs and submissions

use crate::submitter::{ConfirmResult, SubmitAttempt, SubmitLogFn};
use crate::types::SignedTransaction;
use std::sync::Arc;
use uuid::Uuid;

/// Structured logger tagging every event with the run it belongs to
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    context_id: String,
}

impl StructuredLogger {
    pub fn new(context_id: String) -> Self {
        Self { context_id }
    }

    /// Logger with a fresh random run id
    pub fn new_run() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn log_submit_attempt(&self, attempt: &SubmitAttempt<'_>) {
        match attempt.error {
            None => tracing::debug!(
                context_id = %self.context_id,
                hash = %attempt.tx.hash,
                nonce = attempt.tx.nonce,
                endpoint = %attempt.endpoint,
                attempt = attempt.attempt,
                rebroadcast = attempt.rebroadcast,
                "Transaction accepted"
            ),
            Some(error) => tracing::warn!(
                context_id = %self.context_id,
                hash = %attempt.tx.hash,
                nonce = attempt.tx.nonce,
                endpoint = %attempt.endpoint,
                attempt = attempt.attempt,
                rebroadcast = attempt.rebroadcast,
                error = %error,
                "Transaction rejected"
            ),
        }
    }

    pub fn log_confirmation(&self, index: u64, tx: &SignedTransaction, result: &ConfirmResult) {
        match result {
            Ok(Some(receipt)) => tracing::info!(
                context_id = %self.context_id,
                iteration = index,
                hash = %tx.hash,
                nonce = tx.nonce,
                block = receipt.block_number,
                success = receipt.success,
                fee = %receipt.total_fee(),
                "Transaction confirmed"
            ),
            Ok(None) => tracing::info!(
                context_id = %self.context_id,
                iteration = index,
                hash = %tx.hash,
                nonce = tx.nonce,
                "Transaction superseded without receipt"
            ),
            // Cancellation means "don't report"
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!(
                context_id = %self.context_id,
                iteration = index,
                hash = %tx.hash,
                nonce = tx.nonce,
                error = %e,
                "Transaction confirmation failed"
            ),
        }
    }

    pub fn log_iteration_failed(&self, index: u64, error: &anyhow::Error) {
        tracing::warn!(
            context_id = %self.context_id,
            iteration = index,
            error = %error,
            "Iteration failed"
        );
    }

    pub fn log_iteration_panic(&self, index: u64, message: &str) {
        tracing::error!(
            context_id = %self.context_id,
            iteration = index,
            panic = %message,
            "Iteration panicked"
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_block_summary(
        &self,
        block: u64,
        submitted: u64,
        pending: u64,
        confirmed: u64,
        throughput_5b: f64,
        throughput_20b: f64,
        throughput_60b: f64,
    ) {
        tracing::info!(
            context_id = %self.context_id,
            block,
            submitted,
            pending,
            confirmed,
            throughput_5b = format_args!("{:.2}", throughput_5b),
            throughput_20b = format_args!("{:.2}", throughput_20b),
            throughput_60b = format_args!("{:.2}", throughput_60b),
            "Block summary"
        );
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(
            context_id = %self.context_id,
            message = %message,
            "Warning"
        );
    }

    /// Per-attempt hook for [`crate::submitter::SendOptions::with_log_fn`]
    pub fn submit_log_fn(&self) -> SubmitLogFn {
        let logger = self.clone();
        Arc::new(move |attempt: &SubmitAttempt<'_>| logger.log_submit_attempt(attempt))
    }
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new_run()
    }
}
