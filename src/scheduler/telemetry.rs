//! Per-block run statistics
//!
//! Purely observational: nothing here feeds back into scheduling.

use crate::confirmation::{BlockStats, ConfirmationEngine};
use crate::nonce_manager::AccountLedger;
use crate::structured_logging::StructuredLogger;
use crate::throughput::ThroughputTracker;
use crate::types::Address;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Summary logged for one block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockSummary {
    pub block: u64,
    pub submitted: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub throughput_5b: f64,
    pub throughput_20b: f64,
    pub throughput_60b: f64,
}

/// Folds block stats into a throughput history for one run's ledgers
#[derive(Debug)]
pub struct RunTelemetry {
    ledgers: Vec<Arc<AccountLedger>>,
    senders: Vec<Address>,
    tracker: ThroughputTracker,
    last_submitted: u64,
}

impl RunTelemetry {
    pub fn new(ledgers: Vec<Arc<AccountLedger>>) -> Self {
        let last_submitted = ledgers.iter().map(|l| l.submitted_count()).sum();
        Self {
            senders: ledgers.iter().map(|l| l.address()).collect(),
            ledgers,
            tracker: ThroughputTracker::default(),
            last_submitted,
        }
    }

    pub fn observe(&mut self, stats: &BlockStats) -> BlockSummary {
        let confirmed = if self.senders.is_empty() {
            stats.total_confirmed
        } else {
            stats.confirmed_for(&self.senders)
        };

        let submitted_total: u64 = self.ledgers.iter().map(|l| l.submitted_count()).sum();
        let submitted = submitted_total.saturating_sub(self.last_submitted);
        self.last_submitted = submitted_total;
        let pending = self.ledgers.iter().map(|l| l.pending_count()).sum();

        self.tracker.record_completion(stats.number, confirmed);

        BlockSummary {
            block: stats.number,
            submitted,
            pending,
            confirmed,
            throughput_5b: self.tracker.average_over(5, stats.number),
            throughput_20b: self.tracker.average_over(20, stats.number),
            throughput_60b: self.tracker.average_over(60, stats.number),
        }
    }
}

/// Log a summary for every block the engine processes until `cancel` fires
pub fn spawn_block_telemetry(
    engine: &ConfirmationEngine,
    ledgers: Vec<Arc<AccountLedger>>,
    logger: StructuredLogger,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut blocks = engine.subscribe_blocks();
    let mut telemetry = RunTelemetry::new(ledgers);

    tokio::spawn(async move {
        loop {
            let stats = tokio::select! {
                _ = cancel.cancelled() => break,
                stats = blocks.recv() => stats,
            };
            match stats {
                Ok(stats) => {
                    let s = telemetry.observe(&stats);
                    logger.log_block_summary(
                        s.block,
                        s.submitted,
                        s.pending,
                        s.confirmed,
                        s.throughput_5b,
                        s.throughput_20b,
                        s.throughput_60b,
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Block telemetry lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
