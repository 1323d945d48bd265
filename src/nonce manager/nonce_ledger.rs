//! Per-account nonce ledger
//!
//! One ledger exists per signing key and is shared by every concurrent
//! submitter of that key. Allocation is a lock-free atomic increment; the
//! confirmed nonce, waiter map and stale-tracking mark live under the
//! ledger's own mutex so that "resolve and remove" is atomic with respect to
//! concurrent inclusions of adjacent nonces.
//!
//! Every write to the pending counter other than allocation happens under
//! the mutex, so the pending nonce never drops below the confirmed nonce.

use super::nonce_errors::{NonceError, NonceResult};
use crate::rpc_manager::RpcEndpoint;
use crate::types::{Address, Receipt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How a nonce wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonceOutcome {
    /// The transaction for this nonce was seen in a block
    Included(Receipt),
    /// A later nonce was included, or the stale pass released the wait
    Superseded,
    /// The nonce was already below the confirmed nonce when the wait started
    AlreadyConfirmed,
}

impl NonceOutcome {
    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            NonceOutcome::Included(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_receipt(self) -> Option<Receipt> {
        match self {
            NonceOutcome::Included(r) => Some(r),
            _ => None,
        }
    }
}

/// Pending wait on a single nonce
#[derive(Debug)]
pub struct NonceWaiter {
    address: Address,
    nonce: u64,
    rx: oneshot::Receiver<Option<Receipt>>,
}

impl NonceWaiter {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Wait until the ledger resolves this nonce or `cancel` fires
    pub async fn wait(self, cancel: &CancellationToken) -> NonceResult<NonceOutcome> {
        let NonceWaiter { address, nonce, rx } = self;
        tokio::select! {
            biased;
            resolved = rx => match resolved {
                Ok(Some(receipt)) => Ok(NonceOutcome::Included(receipt)),
                Ok(None) => Ok(NonceOutcome::Superseded),
                Err(_) => Err(NonceError::WaiterDropped { address, nonce }),
            },
            _ = cancel.cancelled() => Err(NonceError::Cancelled { nonce }),
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    confirmed_nonce: u64,
    waiters: BTreeMap<u64, Vec<oneshot::Sender<Option<Receipt>>>>,
    /// Block height of the last observed inclusion (or stale check)
    last_inclusion_block: u64,
    needs_resync: bool,
}

impl LedgerState {
    /// Resolve and remove every waiter below `bound`; `receipt` goes to `bound - 1`
    fn resolve_below(&mut self, bound: u64, receipt: Option<(u64, &Receipt)>) -> usize {
        let rest = self.waiters.split_off(&bound);
        let resolved = std::mem::replace(&mut self.waiters, rest);
        let mut count = 0;
        for (nonce, senders) in resolved {
            let value = match receipt {
                Some((n, r)) if n == nonce => Some(r.clone()),
                _ => None,
            };
            for sender in senders {
                let _ = sender.send(value.clone());
                count += 1;
            }
        }
        count
    }
}

/// Nonce and balance tracking for one signing key
#[derive(Debug)]
pub struct AccountLedger {
    address: Address,
    pending_nonce: AtomicU64,
    state: Mutex<LedgerState>,
    balance: Mutex<u128>,
    /// Chain height the cached balance was read at
    balance_height: AtomicU64,
    submitted: AtomicU64,
}

impl AccountLedger {
    pub fn new(address: Address) -> Self {
        Self::with_nonce(address, 0)
    }

    /// Ledger whose first allocation returns `nonce`
    pub fn with_nonce(address: Address, nonce: u64) -> Self {
        Self {
            address,
            pending_nonce: AtomicU64::new(nonce),
            state: Mutex::new(LedgerState {
                confirmed_nonce: nonce,
                ..Default::default()
            }),
            balance: Mutex::new(0),
            balance_height: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Hand out the next nonce. Never returns the same value twice unless an
    /// explicit resync moved the counter back.
    pub fn allocate_nonce(&self) -> u64 {
        self.pending_nonce.fetch_add(1, Ordering::AcqRel)
    }

    pub fn pending_nonce(&self) -> u64 {
        self.pending_nonce.load(Ordering::Acquire)
    }

    pub fn confirmed_nonce(&self) -> u64 {
        self.state.lock().confirmed_nonce
    }

    /// Allocated nonces not yet seen on chain
    pub fn pending_count(&self) -> u64 {
        let confirmed = self.confirmed_nonce();
        self.pending_nonce().saturating_sub(confirmed)
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.values().map(Vec::len).sum()
    }

    pub fn has_waiters(&self) -> bool {
        !self.state.lock().waiters.is_empty()
    }

    /// No waiters and every allocated nonce confirmed
    pub fn is_settled(&self) -> bool {
        let state = self.state.lock();
        state.waiters.is_empty() && self.pending_nonce() <= state.confirmed_nonce
    }

    pub fn last_inclusion_block(&self) -> u64 {
        self.state.lock().last_inclusion_block
    }

    /// Register interest in `nonce`; `None` means nothing to wait for
    pub fn subscribe_nonce(&self, nonce: u64) -> Option<NonceWaiter> {
        self.subscribe_at(nonce, None)
    }

    /// Register interest in `nonce`. When this is the first open waiter, the
    /// stale mark is moved up to `current_block - 1` so staleness is measured
    /// from registration rather than from the last inclusion.
    pub(crate) fn subscribe_at(&self, nonce: u64, current_block: Option<u64>) -> Option<NonceWaiter> {
        let mut state = self.state.lock();
        if state.confirmed_nonce > nonce {
            return None;
        }
        if state.waiters.is_empty() {
            if let Some(block) = current_block {
                let baseline = block.saturating_sub(1);
                if baseline > state.last_inclusion_block {
                    state.last_inclusion_block = baseline;
                }
            }
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.entry(nonce).or_default().push(tx);
        Some(NonceWaiter {
            address: self.address,
            nonce,
            rx,
        })
    }

    /// Wait for `nonce` to be resolved
    pub async fn await_nonce(
        &self,
        nonce: u64,
        cancel: &CancellationToken,
    ) -> NonceResult<NonceOutcome> {
        match self.subscribe_nonce(nonce) {
            Some(waiter) => waiter.wait(cancel).await,
            None => Ok(NonceOutcome::AlreadyConfirmed),
        }
    }

    /// Drop waiter slots for `nonce` whose receiving side is gone
    pub fn release_waiter(&self, nonce: u64) {
        let mut state = self.state.lock();
        if let Some(senders) = state.waiters.get_mut(&nonce) {
            senders.retain(|s| !s.is_closed());
            if senders.is_empty() {
                state.waiters.remove(&nonce);
            }
        }
    }

    /// Record that the transaction with `nonce` was included in `block`.
    ///
    /// Resolves the waiter for `nonce` with the receipt and every lower waiter
    /// without one. Returns the number of waiters resolved.
    pub fn mark_included(&self, nonce: u64, receipt: &Receipt, block: u64) -> usize {
        let next = nonce.saturating_add(1);
        let mut state = self.state.lock();
        self.pending_nonce.fetch_max(next, Ordering::AcqRel);
        let resolved = state.resolve_below(next, Some((nonce, receipt)));
        if next > state.confirmed_nonce {
            state.confirmed_nonce = next;
        }
        if block > state.last_inclusion_block {
            state.last_inclusion_block = block;
        }
        resolved
    }

    /// Force-resolve every waiter below the authoritative on-chain nonce and
    /// raise the confirmed nonce to it. Returns the number of waiters released.
    pub fn release_below(&self, on_chain_nonce: u64) -> usize {
        let mut state = self.state.lock();
        self.pending_nonce.fetch_max(on_chain_nonce, Ordering::AcqRel);
        let released = state.resolve_below(on_chain_nonce, None);
        if on_chain_nonce > state.confirmed_nonce {
            state.confirmed_nonce = on_chain_nonce;
        }
        released
    }

    /// Stale-pass gate: true when there are open waiters and no inclusion has
    /// been seen for more than `stale_blocks`. Passing the gate moves the mark
    /// to `current_block`.
    pub(crate) fn take_stale_check(&self, current_block: u64, stale_blocks: u64) -> bool {
        let mut state = self.state.lock();
        if state.waiters.is_empty() {
            return false;
        }
        if current_block <= state.last_inclusion_block.saturating_add(stale_blocks) {
            return false;
        }
        state.last_inclusion_block = current_block;
        true
    }

    /// Move the confirmed nonce back after a reorg removed an inclusion
    pub(crate) fn rewind_confirmed(&self, nonce: u64) {
        let mut state = self.state.lock();
        if state.confirmed_nonce > nonce {
            debug!(
                address = %self.address,
                from = state.confirmed_nonce,
                to = nonce,
                "Rewinding confirmed nonce after reorg"
            );
            state.confirmed_nonce = nonce;
        }
    }

    /// Align the pending nonce with an external value, never below the
    /// confirmed nonce
    pub fn resync(&self, external_nonce: u64) {
        let mut state = self.state.lock();
        let target = external_nonce.max(state.confirmed_nonce);
        let previous = self.pending_nonce.swap(target, Ordering::AcqRel);
        state.needs_resync = false;
        if previous != target {
            info!(
                address = %self.address,
                previous,
                pending = target,
                "Ledger pending nonce resynced"
            );
        }
    }

    /// Authoritative confirmed nonce from a chain read
    pub fn set_confirmed(&self, nonce: u64) {
        let mut state = self.state.lock();
        self.pending_nonce.fetch_max(nonce, Ordering::AcqRel);
        state.resolve_below(nonce, None);
        state.confirmed_nonce = nonce;
    }

    /// Give back a nonce that was allocated but never delivered.
    ///
    /// If it is still the latest allocation the counter steps back; otherwise
    /// later nonces are already out and the ledger is flagged for a resync.
    pub fn release_unsent(&self, nonce: u64) {
        let mut state = self.state.lock();
        if nonce >= state.confirmed_nonce
            && self
                .pending_nonce
                .compare_exchange(nonce + 1, nonce, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            debug!(address = %self.address, nonce, "Returned unsent nonce");
            return;
        }
        state.needs_resync = true;
    }

    pub fn needs_resync(&self) -> bool {
        self.state.lock().needs_resync
    }

    /// Resync from the endpoint if a send failure left a hole
    pub async fn resync_if_needed(&self, endpoint: &dyn RpcEndpoint) -> NonceResult<bool> {
        if !self.needs_resync() {
            return Ok(false);
        }
        let nonce = endpoint.nonce_at(self.address, None).await?;
        self.resync(nonce);
        Ok(true)
    }

    /// Read nonce and balance from the chain and overwrite the cached values.
    ///
    /// The balance already reflects every block up to the height read here,
    /// so later block processing must not apply those blocks again.
    pub async fn sync_from(&self, endpoint: &dyn RpcEndpoint) -> NonceResult<()> {
        let height = endpoint.block_number().await?;
        let nonce = endpoint.nonce_at(self.address, None).await?;
        let balance = endpoint.balance_at(self.address).await?;
        self.set_confirmed(nonce);
        {
            let mut cached = self.balance.lock();
            *cached = balance;
            self.balance_height.fetch_max(height, Ordering::AcqRel);
        }
        debug!(address = %self.address, nonce, balance, height, "Ledger synced from chain");
        Ok(())
    }

    /// True when the cached balance already includes the effects of `block`
    pub fn balance_covers(&self, block: u64) -> bool {
        block <= self.balance_height.load(Ordering::Acquire)
    }

    pub fn balance(&self) -> u128 {
        *self.balance.lock()
    }

    pub fn set_balance(&self, balance: u128) {
        *self.balance.lock() = balance;
    }

    pub fn add_balance(&self, amount: u128) {
        let mut balance = self.balance.lock();
        *balance = balance.saturating_add(amount);
    }

    pub fn sub_balance(&self, amount: u128) {
        let mut balance = self.balance.lock();
        *balance = balance.saturating_sub(amount);
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxHash;

    fn receipt(nonce: u64, block: u64) -> Receipt {
        Receipt {
            tx_hash: TxHash::new([nonce as u8; 32]),
            block_number: block,
            block_hash: TxHash::default(),
            success: true,
            gas_used: 21_000,
            effective_gas_price: 1,
            blob_gas_used: 0,
            blob_gas_price: 0,
            logs: 0,
        }
    }

    #[tokio::test]
    async fn test_await_already_confirmed_returns_immediately() {
        let ledger = AccountLedger::with_nonce(Address::new([1; 20]), 5);
        let outcome = ledger
            .await_nonce(3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, NonceOutcome::AlreadyConfirmed);
        assert_eq!(ledger.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_mark_included_resolves_lower_waiters() {
        let ledger = AccountLedger::new(Address::new([1; 20]));
        let waiters: Vec<_> = (0..4)
            .map(|_| ledger.allocate_nonce())
            .map(|n| ledger.subscribe_nonce(n).unwrap())
            .collect();

        let r = receipt(2, 10);
        assert_eq!(ledger.mark_included(2, &r, 10), 3);
        assert_eq!(ledger.confirmed_nonce(), 3);

        let cancel = CancellationToken::new();
        let mut outcomes = Vec::new();
        for w in waiters.into_iter().take(3) {
            outcomes.push(w.wait(&cancel).await.unwrap());
        }
        assert_eq!(outcomes[0], NonceOutcome::Superseded);
        assert_eq!(outcomes[1], NonceOutcome::Superseded);
        assert_eq!(outcomes[2], NonceOutcome::Included(r));
        // nonce 3 stays open
        assert_eq!(ledger.waiter_count(), 1);
    }

    #[test]
    fn test_mark_included_raises_pending() {
        let ledger = AccountLedger::new(Address::new([2; 20]));
        ledger.mark_included(9, &receipt(9, 1), 1);
        assert_eq!(ledger.pending_nonce(), 10);
        assert_eq!(ledger.confirmed_nonce(), 10);
        assert_eq!(ledger.allocate_nonce(), 10);
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_error() {
        let ledger = AccountLedger::new(Address::new([3; 20]));
        let nonce = ledger.allocate_nonce();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ledger.await_nonce(nonce, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_resync_never_goes_below_confirmed() {
        let ledger = AccountLedger::new(Address::new([4; 20]));
        for _ in 0..5 {
            ledger.allocate_nonce();
        }
        ledger.mark_included(2, &receipt(2, 1), 1);
        ledger.resync(1);
        assert_eq!(ledger.pending_nonce(), 3);
        ledger.resync(8);
        assert_eq!(ledger.pending_nonce(), 8);
    }

    #[test]
    fn test_release_unsent_steps_back_latest_allocation() {
        let ledger = AccountLedger::new(Address::new([5; 20]));
        let a = ledger.allocate_nonce();
        let b = ledger.allocate_nonce();
        ledger.release_unsent(b);
        assert_eq!(ledger.pending_nonce(), 1);
        assert!(!ledger.needs_resync());

        // Releasing an older nonce with later ones outstanding flags a resync
        let _c = ledger.allocate_nonce();
        ledger.release_unsent(a);
        assert!(ledger.needs_resync());
        ledger.resync(0);
        assert!(!ledger.needs_resync());
        assert_eq!(ledger.pending_nonce(), 0);
    }

    #[test]
    fn test_stale_gate_measures_from_registration() {
        let ledger = AccountLedger::new(Address::new([6; 20]));
        let nonce = ledger.allocate_nonce();
        let _w = ledger.subscribe_at(nonce, Some(100)).unwrap();
        assert_eq!(ledger.last_inclusion_block(), 99);

        assert!(!ledger.take_stale_check(105, 10));
        assert!(!ledger.take_stale_check(109, 10));
        assert!(ledger.take_stale_check(110, 10));
        // Mark moved to 110, so the next pass waits again
        assert!(!ledger.take_stale_check(111, 10));
    }

    #[test]
    fn test_release_waiter_prunes_dropped_handles() {
        let ledger = AccountLedger::new(Address::new([7; 20]));
        let nonce = ledger.allocate_nonce();
        let waiter = ledger.subscribe_nonce(nonce).unwrap();
        drop(waiter);
        ledger.release_waiter(nonce);
        assert!(!ledger.has_waiters());
    }

    #[test]
    fn test_balance_adjustments_saturate() {
        let ledger = AccountLedger::new(Address::new([8; 20]));
        ledger.set_balance(100);
        ledger.sub_balance(250);
        assert_eq!(ledger.balance(), 0);
        ledger.add_balance(u128::MAX);
        ledger.add_balance(1);
        assert_eq!(ledger.balance(), u128::MAX);
    }
}
