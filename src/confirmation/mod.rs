//! Confirmation engine
//!
//! Watches the chain for transactions sent by tracked ledgers, resolves their
//! nonce waits and force-releases waits that went stale.

pub mod engine;
mod stale;

pub use engine::ConfirmationEngine;

use crate::types::Address;
use std::collections::HashMap;
use std::time::Duration;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between highest-block polls
    pub poll_interval: Duration,
    /// Blocks without inclusion before an account's open waits are checked
    pub stale_blocks: u64,
    /// Recent blocks kept for parent-hash reorg detection
    pub reorg_depth: u64,
    /// Timeout of each endpoint's block height query
    pub height_timeout: Duration,
    /// Timeout for loading a block body plus receipts
    pub block_fetch_timeout: Duration,
    /// On the first poll, history below `height - 1` is skipped once the
    /// chain is taller than this
    pub skip_history_above: u64,
    /// Polls a block may fail on every endpoint before it is skipped
    pub max_block_attempts: u32,
    /// Attempts for the authoritative nonce read of the stale pass
    pub stale_nonce_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            stale_blocks: 10,
            reorg_depth: 10,
            height_timeout: Duration::from_secs(3),
            block_fetch_timeout: Duration::from_secs(5),
            skip_history_above: 10,
            max_block_attempts: 5,
            stale_nonce_attempts: 3,
        }
    }
}

/// Summary of one processed block, published to block subscribers
#[derive(Debug, Clone, Default)]
pub struct BlockStats {
    pub number: u64,
    /// Tracked transactions included in this block
    pub total_confirmed: u64,
    pub confirmed_by_sender: HashMap<Address, u64>,
    /// Fees paid by tracked senders in this block
    pub total_fees: u128,
}

impl BlockStats {
    /// Confirmations attributed to any of `senders`
    pub fn confirmed_for<'a, I>(&self, senders: I) -> u64
    where
        I: IntoIterator<Item = &'a Address>,
    {
        senders
            .into_iter()
            .filter_map(|a| self.confirmed_by_sender.get(a))
            .sum()
    }
}
