use super::{
    ConfirmResult, RebroadcastPolicy, SendOptions, SubmitAttempt, SubmitError, SubmitLogFn,
    SubmitResult,
};
use crate::confirmation::ConfirmationEngine;
use crate::metrics::metrics;
use crate::nonce_manager::{
    retry_with_backoff, AccountLedger, NonceError, NonceOutcome, NonceWaiter, RetryConfig,
};
use crate::rpc_manager::{rotation, EndpointProvider, RpcEndpoint};
use crate::types::{Receipt, SignedTransaction, TxHash};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Endpoints tried per rebroadcast round
const MAX_REBROADCAST_ENDPOINTS: usize = 5;
/// Receipt lookups after a wait resolved without one
const RECEIPT_LOOKUP_ATTEMPTS: u32 = 5;

/// Sends transactions and routes confirmations back to callers
#[derive(Clone)]
pub struct TxSubmitter {
    engine: Arc<ConfirmationEngine>,
    provider: Arc<dyn EndpointProvider>,
    cancel: CancellationToken,
    receipt_retry: RetryConfig,
}

impl TxSubmitter {
    pub fn new(
        engine: Arc<ConfirmationEngine>,
        provider: Arc<dyn EndpointProvider>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            provider,
            cancel,
            receipt_retry: RetryConfig::fixed(RECEIPT_LOOKUP_ATTEMPTS, Duration::from_secs(1)),
        }
    }

    pub fn engine(&self) -> &Arc<ConfirmationEngine> {
        &self.engine
    }

    /// Deliver `tx` and, if requested, track its confirmation.
    ///
    /// Returns once an endpoint accepted the transaction or every endpoint
    /// failed. The confirm callback fires later, exactly once.
    pub async fn send(
        &self,
        ledger: &Arc<AccountLedger>,
        tx: SignedTransaction,
        options: SendOptions,
    ) -> SubmitResult<()> {
        // Register before sending so an inclusion in the next block is not missed
        let wants_confirmation = options.wants_confirmation();
        let waiter = if wants_confirmation {
            self.engine.watch_nonce(ledger, tx.nonce)
        } else {
            None
        };

        let SendOptions {
            endpoint,
            rebroadcast,
            on_confirm,
            log_fn,
        } = options;

        let candidates = self.initial_candidates(endpoint.as_ref());
        if let Err(err) = self.deliver(&tx, candidates, 0, log_fn.as_ref()).await {
            if waiter.is_some() {
                drop(waiter);
                ledger.release_waiter(tx.nonce);
            }
            ledger.release_unsent(tx.nonce);
            metrics().tx_submit_failures.inc();
            return Err(err);
        }

        ledger.record_submitted();
        metrics().tx_submitted.inc();

        if !wants_confirmation {
            return Ok(());
        }

        let tx = Arc::new(tx);
        let resolved = self.cancel.child_token();

        if let Some(policy) = rebroadcast.filter(|p| p.count > 0) {
            let this = self.clone();
            let tx = tx.clone();
            let resolved = resolved.clone();
            let log_fn = log_fn.clone();
            tokio::spawn(async move {
                this.rebroadcast_loop(&tx, policy, &resolved, log_fn.as_ref())
                    .await;
            });
        }

        let this = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = this.await_confirmation(&tx, waiter).await;
            resolved.cancel();

            if let Ok(Some(_)) = &result {
                metrics()
                    .confirmation_latency
                    .observe(started.elapsed().as_secs_f64());
            }
            if let Some(callback) = on_confirm {
                callback(&tx, result);
            }
        });

        Ok(())
    }

    /// Send and wait for the confirmation outcome
    pub async fn send_and_await(
        &self,
        ledger: &Arc<AccountLedger>,
        tx: SignedTransaction,
        options: SendOptions,
    ) -> SubmitResult<Option<Receipt>> {
        let (done_tx, done_rx) = oneshot::channel();
        let options = options.on_confirm(move |_, result| {
            let _ = done_tx.send(result);
        });
        self.send(ledger, tx, options).await?;
        done_rx.await.unwrap_or(Err(SubmitError::Cancelled))
    }

    /// Send many transactions, keeping at most `pending_limit` unconfirmed at
    /// a time. Results come back in input order.
    pub async fn send_batch(
        &self,
        ledger: &Arc<AccountLedger>,
        txs: Vec<SignedTransaction>,
        pending_limit: usize,
        rebroadcast: Option<RebroadcastPolicy>,
        log_fn: Option<SubmitLogFn>,
    ) -> Vec<ConfirmResult> {
        let limit = Arc::new(Semaphore::new(pending_limit.max(1)));
        let mut outcomes = Vec::with_capacity(txs.len());

        for tx in txs {
            let (done_tx, done_rx) = oneshot::channel();
            outcomes.push(done_rx);

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = done_tx.send(Err(SubmitError::Cancelled));
                    continue;
                }
                permit = limit.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                let _ = done_tx.send(Err(SubmitError::Cancelled));
                continue;
            };

            let done_tx = Arc::new(parking_lot::Mutex::new(Some(done_tx)));
            let confirm_slot = done_tx.clone();
            let mut options = SendOptions::new().on_confirm(move |_, result| {
                drop(permit);
                if let Some(tx) = confirm_slot.lock().take() {
                    let _ = tx.send(result);
                }
            });
            options.rebroadcast = rebroadcast;
            options.log_fn = log_fn.clone();

            if let Err(err) = self.send(ledger, tx, options).await {
                if let Some(tx) = done_tx.lock().take() {
                    let _ = tx.send(Err(err));
                }
            }
        }

        let mut results = Vec::with_capacity(outcomes.len());
        for rx in outcomes {
            results.push(rx.await.unwrap_or(Err(SubmitError::Cancelled)));
        }
        results
    }

    fn initial_candidates(
        &self,
        preferred: Option<&Arc<dyn RpcEndpoint>>,
    ) -> Vec<Arc<dyn RpcEndpoint>> {
        let mut candidates: Vec<Arc<dyn RpcEndpoint>> = preferred.into_iter().cloned().collect();
        for endpoint in rotation(self.provider.as_ref(), 0) {
            if preferred.map_or(true, |p| p.name() != endpoint.name()) {
                candidates.push(endpoint);
            }
        }
        candidates
    }

    /// Rebroadcast rotation starts at index 1 so the resend prefers a
    /// different node than the initial send, wrapping to index 0 last
    fn rebroadcast_candidates(&self) -> Vec<Arc<dyn RpcEndpoint>> {
        rotation(self.provider.as_ref(), 1)
            .chain(self.provider.endpoint(0))
            .take(MAX_REBROADCAST_ENDPOINTS)
            .collect()
    }

    /// Try each candidate until one accepts
    async fn deliver(
        &self,
        tx: &SignedTransaction,
        candidates: Vec<Arc<dyn RpcEndpoint>>,
        rebroadcast: u32,
        log_fn: Option<&SubmitLogFn>,
    ) -> SubmitResult<()> {
        let mut last_err = None;
        let mut attempts = 0;

        for (attempt, endpoint) in candidates.iter().enumerate() {
            attempts += 1;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SubmitError::Cancelled),
                result = endpoint.send_raw_transaction(&tx.raw) => result,
            };
            let result = match result {
                Err(e) if e.is_already_known() => Ok(tx.hash),
                other => other,
            };

            if let Some(log) = log_fn {
                log(&SubmitAttempt {
                    tx,
                    endpoint: endpoint.name(),
                    attempt,
                    rebroadcast,
                    error: result.as_ref().err(),
                });
            }

            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!(
                        hash = %tx.hash,
                        nonce = tx.nonce,
                        endpoint = %endpoint.name(),
                        error = %e,
                        "Endpoint rejected transaction"
                    );
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(last) => Err(SubmitError::AllEndpointsFailed { attempts, last }),
            None => Err(SubmitError::NoEndpoints),
        }
    }

    async fn rebroadcast_loop(
        &self,
        tx: &SignedTransaction,
        policy: RebroadcastPolicy,
        resolved: &CancellationToken,
        log_fn: Option<&SubmitLogFn>,
    ) {
        for round in 1..=policy.count {
            tokio::select! {
                _ = resolved.cancelled() => return,
                _ = tokio::time::sleep(policy.interval) => {}
            }
            metrics().tx_rebroadcasts.inc();
            let candidates = self.rebroadcast_candidates();
            if let Err(e) = self.deliver(tx, candidates, round, log_fn).await {
                if e.is_cancelled() {
                    return;
                }
                warn!(hash = %tx.hash, nonce = tx.nonce, round, error = %e, "Rebroadcast failed");
            }
        }
    }

    async fn await_confirmation(
        &self,
        tx: &SignedTransaction,
        waiter: Option<NonceWaiter>,
    ) -> ConfirmResult {
        let outcome = match waiter {
            Some(waiter) => waiter.wait(&self.cancel).await,
            None => Ok(NonceOutcome::AlreadyConfirmed),
        };

        match outcome {
            // A different transaction with the same nonce made it in
            Ok(NonceOutcome::Included(receipt)) => {
                Ok((receipt.tx_hash == tx.hash).then_some(receipt))
            }
            Ok(_) => self.lookup_receipt(tx.hash).await,
            Err(e) if e.is_cancelled() => Err(SubmitError::Cancelled),
            Err(e) => Err(SubmitError::Ledger(e)),
        }
    }

    async fn lookup_receipt(&self, hash: TxHash) -> ConfirmResult {
        let engine = &self.engine;
        let lookup = retry_with_backoff("receipt_lookup", &self.receipt_retry, |_| async move {
            engine
                .load_receipt(hash)
                .await?
                .ok_or(NonceError::ReceiptNotFound(hash))
        });
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SubmitError::Cancelled),
            receipt = lookup => match receipt {
                Ok(receipt) => Ok(Some(receipt).filter(|r| r.tx_hash == hash)),
                Err(NonceError::ReceiptNotFound(_)) => {
                    debug!(hash = %hash, "No receipt after every lookup attempt");
                    Ok(None)
                }
                Err(e) => {
                    debug!(hash = %hash, error = %e, "Receipt lookup failed");
                    Ok(None)
                }
            },
        }
    }
}
