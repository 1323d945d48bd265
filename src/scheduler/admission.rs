//! In-flight ceiling for scheduled iterations

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Bounds the number of dispatched but not yet completed iterations.
///
/// A single admitting task calls [`AdmissionGate::admit`]; completions and
/// ceiling changes both wake it through the same `Notify`, whose stored
/// permit covers a release landing between the check and the wait.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    in_flight: AtomicI64,
    /// 0 disables the ceiling
    ceiling: AtomicU64,
    notify: Notify,
}

impl AdmissionGate {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling: AtomicU64::new(ceiling),
            ..Default::default()
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling.load(Ordering::Acquire)
    }

    fn has_room(&self) -> bool {
        let ceiling = self.ceiling();
        ceiling == 0 || self.in_flight() < ceiling as i64
    }

    /// Wait for room under the ceiling and take a slot. Returns false if
    /// `cancel` fired first; no slot is taken in that case.
    pub async fn admit(&self, cancel: &CancellationToken) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_room() {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                return true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
    }

    /// Give a slot back and wake the admitting task
    pub fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Change the ceiling; a raised ceiling wakes the admitting task
    pub fn set_ceiling(&self, ceiling: u64) {
        self.ceiling.store(ceiling, Ordering::Release);
        self.notify.notify_one();
    }
}
