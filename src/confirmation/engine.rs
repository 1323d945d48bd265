use super::{BlockStats, EngineConfig};
use crate::metrics::metrics;
use crate::nonce_manager::{AccountLedger, NonceOutcome, NonceResult, NonceWaiter};
use crate::recovery::recover_panic;
use crate::rpc_manager::{rotation, EndpointProvider, RpcEndpoint, RpcError, RpcResult};
use crate::types::{Address, Block, Receipt, TxHash};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A processed block kept for reorg detection
#[derive(Debug)]
struct RecentBlock {
    number: u64,
    hash: TxHash,
    inclusions: Vec<(Address, u64)>,
}

/// Pool-wide confirmation tracking
pub struct ConfirmationEngine {
    pub(super) provider: Arc<dyn EndpointProvider>,
    pub(super) config: EngineConfig,
    pub(super) ledgers: RwLock<HashMap<Address, Arc<AccountLedger>>>,
    last_block: AtomicU64,
    /// (height, failed polls) of the block currently blocking progress
    block_failures: Mutex<(u64, u32)>,
    recent_blocks: Mutex<VecDeque<RecentBlock>>,
    block_tx: broadcast::Sender<Arc<BlockStats>>,
    stale_tx: watch::Sender<u64>,
    pub(super) cancel: CancellationToken,
}

impl std::fmt::Debug for ConfirmationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationEngine")
            .field("config", &self.config)
            .field("tracked_ledgers", &self.ledgers.read().len())
            .field("last_block", &self.last_block())
            .finish_non_exhaustive()
    }
}

impl ConfirmationEngine {
    pub fn new(
        provider: Arc<dyn EndpointProvider>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (block_tx, _) = broadcast::channel(256);
        let (stale_tx, _) = watch::channel(0);
        Arc::new(Self {
            provider,
            config,
            ledgers: RwLock::new(HashMap::new()),
            last_block: AtomicU64::new(0),
            block_failures: Mutex::new((0, 0)),
            recent_blocks: Mutex::new(VecDeque::new()),
            block_tx,
            stale_tx,
            cancel,
        })
    }

    /// Spawn the block loop and the stale-wait loop. Both run until the
    /// engine's cancellation token fires.
    pub fn start(self: &Arc<Self>) {
        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            stale_blocks = self.config.stale_blocks,
            "🔍 Starting confirmation engine"
        );

        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                recover_panic("block loop", engine.poll_once()).await;
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    _ = tokio::time::sleep(engine.config.poll_interval) => {}
                }
            }
            debug!("Block loop stopped");
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut heights = engine.stale_tx.subscribe();
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    changed = heights.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let height = *heights.borrow_and_update();
                recover_panic("stale loop", engine.run_stale_pass(height)).await;
            }
            debug!("Stale loop stopped");
        });
    }

    pub fn last_block(&self) -> u64 {
        self.last_block.load(Ordering::Acquire)
    }

    /// Per-block statistics feed
    pub fn subscribe_blocks(&self) -> broadcast::Receiver<Arc<BlockStats>> {
        self.block_tx.subscribe()
    }

    /// Start attributing block transactions to `ledger`
    pub fn track(&self, ledger: &Arc<AccountLedger>) {
        let mut ledgers = self.ledgers.write();
        if !ledgers.contains_key(&ledger.address()) {
            ledgers.insert(ledger.address(), ledger.clone());
            metrics().tracked_ledgers.set(ledgers.len() as i64);
            debug!(address = %ledger.address(), "Tracking ledger");
        }
    }

    pub fn untrack(&self, address: &Address) -> Option<Arc<AccountLedger>> {
        let mut ledgers = self.ledgers.write();
        let removed = ledgers.remove(address);
        metrics().tracked_ledgers.set(ledgers.len() as i64);
        removed
    }

    pub fn tracked(&self, address: &Address) -> Option<Arc<AccountLedger>> {
        self.ledgers.read().get(address).cloned()
    }

    pub fn tracked_count(&self) -> usize {
        self.ledgers.read().len()
    }

    /// Register a wait on `nonce` and make sure the ledger is tracked.
    /// `None` means the nonce is already confirmed.
    pub fn watch_nonce(&self, ledger: &Arc<AccountLedger>, nonce: u64) -> Option<NonceWaiter> {
        let current = self.last_block();
        let waiter = ledger.subscribe_at(nonce, (current > 0).then_some(current))?;
        self.track(ledger);
        Some(waiter)
    }

    /// Wait for `nonce` of `ledger` to be included, superseded or released
    pub async fn await_nonce(
        &self,
        ledger: &Arc<AccountLedger>,
        nonce: u64,
        cancel: &CancellationToken,
    ) -> NonceResult<NonceOutcome> {
        match self.watch_nonce(ledger, nonce) {
            Some(waiter) => waiter.wait(cancel).await,
            None => Ok(NonceOutcome::AlreadyConfirmed),
        }
    }

    /// Look up a receipt by hash across the provider rotation.
    ///
    /// An endpoint that does not know the receipt yet does not end the
    /// search. `Ok(None)` means at least one endpoint answered and none had
    /// it; `Err` means every endpoint failed.
    pub async fn load_receipt(&self, hash: TxHash) -> RpcResult<Option<Receipt>> {
        let mut last_err = RpcError::NoEndpoints;
        let mut answered = false;
        for endpoint in rotation(self.provider.as_ref(), 0) {
            match endpoint.transaction_receipt(hash).await {
                Ok(Some(receipt)) => return Ok(Some(receipt)),
                Ok(None) => answered = true,
                Err(e) => last_err = e,
            }
        }
        if answered {
            Ok(None)
        } else {
            Err(last_err)
        }
    }

    /// One tick of the block loop: find the chain head and process every
    /// block since the last processed one, in order.
    pub async fn poll_once(&self) {
        let Some((highest, endpoints)) = self.highest_block().await else {
            debug!("No endpoint reported a block height");
            return;
        };

        let mut last = self.last_block();
        if last == 0 && highest > self.config.skip_history_above {
            last = highest - 1;
            self.last_block.store(last, Ordering::Release);
            info!(start = highest, "Confirmation engine starting at chain head");
        }

        let mut number = last + 1;
        while number <= highest {
            if self.cancel.is_cancelled() {
                return;
            }
            if !self.process_block_with(number, &endpoints).await {
                metrics().block_failures.inc();
                if !self.note_block_failure(number) {
                    // Retry this height on the next tick
                    break;
                }
            }
            self.last_block.store(number, Ordering::Release);
            metrics().last_processed_block.set(number as i64);
            self.stale_tx.send_replace(number);
            number += 1;
        }
    }

    /// Returns true once `number` has failed often enough to be skipped
    fn note_block_failure(&self, number: u64) -> bool {
        let mut failures = self.block_failures.lock();
        if failures.0 != number {
            *failures = (number, 0);
        }
        failures.1 += 1;
        if failures.1 >= self.config.max_block_attempts {
            error!(
                block = number,
                attempts = failures.1,
                "Block failed on every endpoint, skipping"
            );
            *failures = (0, 0);
            return true;
        }
        warn!(block = number, attempts = failures.1, "Block processing failed, will retry");
        false
    }

    /// Highest block across the rotation plus the endpoints that reported it
    async fn highest_block(&self) -> Option<(u64, Vec<Arc<dyn RpcEndpoint>>)> {
        let endpoints: Vec<_> = rotation(self.provider.as_ref(), 0).collect();
        let queries = endpoints.iter().map(|ep| {
            let ep = ep.clone();
            let limit = self.config.height_timeout;
            async move {
                match timeout(limit, ep.block_number()).await {
                    Ok(Ok(height)) => Some((height, ep)),
                    Ok(Err(e)) => {
                        debug!(endpoint = %ep.name(), error = %e, "Block height query failed");
                        None
                    }
                    Err(_) => {
                        debug!(endpoint = %ep.name(), "Block height query timed out");
                        None
                    }
                }
            }
        });

        let results: Vec<_> = futures::future::join_all(queries)
            .await
            .into_iter()
            .flatten()
            .collect();
        let highest = results.iter().map(|(h, _)| *h).max()?;
        let at_highest = results
            .into_iter()
            .filter(|(h, _)| *h == highest)
            .map(|(_, ep)| ep)
            .collect();
        Some((highest, at_highest))
    }

    /// Process `number` using the provider rotation
    pub async fn process_block_height(&self, number: u64) -> bool {
        let endpoints: Vec<_> = rotation(self.provider.as_ref(), 0).collect();
        let processed = self.process_block_with(number, &endpoints).await;
        if processed && number > self.last_block() {
            self.last_block.store(number, Ordering::Release);
            self.stale_tx.send_replace(number);
        }
        processed
    }

    /// Load and apply one block. Without tracked ledgers only the header
    /// fields are needed, so receipts are not fetched; the block still feeds
    /// the reorg window and the stats subscribers.
    async fn process_block_with(&self, number: u64, endpoints: &[Arc<dyn RpcEndpoint>]) -> bool {
        let ledgers = self.ledgers.read().clone();
        let with_receipts = !ledgers.is_empty();

        for endpoint in endpoints {
            let load = load_block(endpoint.as_ref(), number, with_receipts);
            match timeout(self.config.block_fetch_timeout, load).await {
                Ok(Ok((block, receipts))) => {
                    self.apply_block(&block, &receipts, &ledgers);
                    return true;
                }
                Ok(Err(e)) => {
                    debug!(block = number, endpoint = %endpoint.name(), error = %e, "Failed to load block");
                }
                Err(_) => {
                    debug!(block = number, endpoint = %endpoint.name(), "Timed out loading block");
                }
            }
        }
        false
    }

    fn apply_block(
        &self,
        block: &Block,
        receipts: &[Receipt],
        ledgers: &HashMap<Address, Arc<AccountLedger>>,
    ) {
        self.check_reorg(block, ledgers);

        let mut stats = BlockStats {
            number: block.number,
            ..Default::default()
        };
        let mut inclusions = Vec::new();

        for (tx, receipt) in block.transactions.iter().zip(receipts) {
            if let Some(ledger) = ledgers.get(&tx.from) {
                let fee = receipt.total_fee();
                ledger.mark_included(tx.nonce, receipt, block.number);
                if !ledger.balance_covers(block.number) {
                    ledger.sub_balance(tx.value.saturating_add(fee));
                }

                *stats.confirmed_by_sender.entry(tx.from).or_default() += 1;
                stats.total_confirmed += 1;
                stats.total_fees = stats.total_fees.saturating_add(fee);
                inclusions.push((tx.from, tx.nonce));
            }
            if let Some(to) = tx.to {
                if let Some(ledger) = ledgers.get(&to) {
                    if !ledger.balance_covers(block.number) {
                        ledger.add_balance(tx.value);
                    }
                }
            }
        }

        {
            let mut recent = self.recent_blocks.lock();
            recent.push_back(RecentBlock {
                number: block.number,
                hash: block.hash,
                inclusions,
            });
            while recent.len() as u64 > self.config.reorg_depth {
                recent.pop_front();
            }
        }

        metrics().blocks_processed.inc();
        metrics().tx_confirmed.inc_by(stats.total_confirmed);
        debug!(
            block = block.number,
            transactions = block.transactions.len(),
            confirmed = stats.total_confirmed,
            "Processed block"
        );

        // Best effort send - don't block if no receivers
        let _ = self.block_tx.send(Arc::new(stats));
    }

    /// Compare the new block's parent with the previous processed block.
    /// On mismatch the previous block's inclusions are rewound; deeper reorgs
    /// are reconciled by the stale pass.
    fn check_reorg(&self, block: &Block, ledgers: &HashMap<Address, Arc<AccountLedger>>) {
        let mut recent = self.recent_blocks.lock();
        let Some(previous) = recent.back() else {
            return;
        };
        if previous.number + 1 != block.number || previous.hash == block.parent_hash {
            return;
        }

        warn!(
            block = block.number,
            expected_parent = %previous.hash,
            actual_parent = %block.parent_hash,
            "Reorg detected"
        );
        metrics().reorgs_detected.inc();

        if let Some(orphaned) = recent.pop_back() {
            let mut lowest: HashMap<Address, u64> = HashMap::new();
            for (address, nonce) in orphaned.inclusions {
                let entry = lowest.entry(address).or_insert(nonce);
                *entry = (*entry).min(nonce);
            }
            for (address, nonce) in lowest {
                if let Some(ledger) = ledgers.get(&address) {
                    ledger.rewind_confirmed(nonce);
                }
            }
        }
    }
}

/// Fetch a block body, with its receipts when `with_receipts` is set; body
/// and receipts must agree in length
async fn load_block(
    endpoint: &dyn RpcEndpoint,
    number: u64,
    with_receipts: bool,
) -> RpcResult<(Block, Vec<Receipt>)> {
    let (block, receipts) = if with_receipts {
        tokio::try_join!(
            endpoint.block_by_number(number),
            endpoint.block_receipts(number)
        )?
    } else {
        (endpoint.block_by_number(number).await?, Vec::new())
    };
    let block = block.ok_or_else(|| RpcError::Decode {
        endpoint: endpoint.name().to_string(),
        message: format!("block {} not found", number),
    })?;
    if with_receipts && block.transactions.len() != receipts.len() {
        return Err(RpcError::Decode {
            endpoint: endpoint.name().to_string(),
            message: format!(
                "block {} has {} transactions but {} receipts",
                number,
                block.transactions.len(),
                receipts.len()
            ),
        });
    }
    Ok((block, receipts))
}
