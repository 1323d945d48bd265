//! Token-bucket gate for iteration starts

use arc_swap::ArcSwapOption;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One iteration per this interval while endpoints are unavailable
pub const ERROR_MODE_INTERVAL: Duration = Duration::from_secs(2);

fn limiter_for(period: Duration) -> Option<Arc<DefaultDirectRateLimiter>> {
    Quota::with_period(period)
        .map(|q| q.allow_burst(NonZeroU32::MIN))
        .map(|q| Arc::new(RateLimiter::direct(q)))
}

/// Per-slot rate limiter that can be retargeted while waiters are blocked.
///
/// A throughput of 0 means unlimited.
pub struct RateGate {
    slot: Duration,
    throughput: AtomicU64,
    limiter: ArcSwapOption<DefaultDirectRateLimiter>,
    error_mode: AtomicBool,
    error_limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGate")
            .field("slot", &self.slot)
            .field("throughput", &self.throughput())
            .field("error_mode", &self.in_error_mode())
            .finish()
    }
}

impl RateGate {
    pub fn new(throughput: u64, slot: Duration) -> Self {
        let gate = Self {
            slot,
            throughput: AtomicU64::new(0),
            limiter: ArcSwapOption::empty(),
            error_mode: AtomicBool::new(false),
            error_limiter: limiter_for(ERROR_MODE_INTERVAL),
        };
        gate.set_throughput(throughput);
        gate
    }

    pub fn throughput(&self) -> u64 {
        self.throughput.load(Ordering::Acquire)
    }

    /// Replace the limiter with one admitting `throughput` starts per slot
    pub fn set_throughput(&self, throughput: u64) {
        self.throughput.store(throughput, Ordering::Release);
        let limiter = match u32::try_from(throughput) {
            Ok(0) => None,
            Ok(per_slot) => limiter_for(self.slot / per_slot),
            // Beyond u32 starts per slot the limiter is effectively off
            Err(_) => None,
        };
        self.limiter.store(limiter);
    }

    pub fn set_error_mode(&self, on: bool) {
        self.error_mode.store(on, Ordering::Release);
    }

    pub fn in_error_mode(&self) -> bool {
        self.error_mode.load(Ordering::Acquire)
    }

    /// Wait for a start token. Returns false if `cancel` fired first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        if let Some(limiter) = self.limiter.load_full() {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = limiter.until_ready() => {}
            }
        }
        if self.in_error_mode() {
            if let Some(limiter) = &self.error_limiter {
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = limiter.until_ready() => {}
                }
            }
        }
        !cancel.is_cancelled()
    }
}
