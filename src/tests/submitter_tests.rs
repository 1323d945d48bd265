//! Submission path tests
//!
//! - Endpoint fallback and attempt logging
//! - Failure rollback of waiters and nonces
//! - Rebroadcast rotation and its stop on confirmation
//! - Cancellation and replaced transactions

#[cfg(test)]
mod submitter_tests {
    use crate::confirmation::ConfirmationEngine;
    use crate::nonce_manager::AccountLedger;
    use crate::rpc_manager::StaticEndpoints;
    use crate::submitter::{
        ConfirmResult, RebroadcastPolicy, SendOptions, SubmitAttempt, SubmitError, SubmitLogFn,
        TxSubmitter,
    };
    use crate::test_utils::{mock_tx, mock_tx_salted, MockEndpoint};
    use crate::tests::test_helpers::{address, engine, eventually, provider};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    fn submitter(endpoints: &[Arc<MockEndpoint>], cancel: &CancellationToken) -> TxSubmitter {
        TxSubmitter::new(engine(endpoints, cancel), provider(endpoints), cancel.clone())
    }

    /// Records (endpoint, rebroadcast round, failed) per attempt
    fn attempt_log() -> (SubmitLogFn, Arc<Mutex<Vec<(String, u32, bool)>>>) {
        let entries = Arc::new(Mutex::new(Vec::new()));
        let sink = entries.clone();
        let log_fn: SubmitLogFn = Arc::new(move |attempt: &SubmitAttempt<'_>| {
            sink.lock().push((
                attempt.endpoint.to_string(),
                attempt.rebroadcast,
                attempt.error.is_some(),
            ));
        });
        (log_fn, entries)
    }

    fn confirm_channel() -> (SendOptions, oneshot::Receiver<ConfirmResult>) {
        let (tx, rx) = oneshot::channel();
        let options = SendOptions::new().on_confirm(move |_, result| {
            let _ = tx.send(result);
        });
        (options, rx)
    }

    /// Mine the mempool and process the new block until cancelled
    fn spawn_miner(
        node: Arc<MockEndpoint>,
        engine: Arc<ConfirmationEngine>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
                node.mine_pending();
                engine.poll_once().await;
            }
        })
    }

    #[tokio::test]
    async fn test_falls_back_to_next_endpoint_and_confirms() {
        let cancel = CancellationToken::new();
        let bad = MockEndpoint::new("bad");
        let good = bad.sibling("good");
        bad.fail_sends(true);
        let submitter = submitter(&[bad.clone(), good.clone()], &cancel);

        let from = address(1);
        let ledger = Arc::new(AccountLedger::new(from));
        let tx = mock_tx(from, ledger.allocate_nonce());
        let (log_fn, attempts) = attempt_log();
        let (options, confirmed) = confirm_channel();

        submitter
            .send(&ledger, tx.clone(), options.with_log_fn(log_fn))
            .await
            .unwrap();

        assert_eq!(
            *attempts.lock(),
            vec![("bad".to_string(), 0, true), ("good".to_string(), 0, false)]
        );
        assert_eq!(good.accepted(), vec![tx.hash]);
        assert_eq!(ledger.submitted_count(), 1);

        good.mine_pending();
        submitter.engine().poll_once().await;

        let receipt = timeout(Duration::from_secs(5), confirmed)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .expect("receipt");
        assert_eq!(receipt.tx_hash, tx.hash);
    }

    #[tokio::test]
    async fn test_preferred_endpoint_is_tried_first() {
        let cancel = CancellationToken::new();
        let a = MockEndpoint::new("a");
        let b = a.sibling("b");
        let submitter = submitter(&[a.clone(), b.clone()], &cancel);

        let ledger = Arc::new(AccountLedger::new(address(2)));
        let tx = mock_tx(address(2), ledger.allocate_nonce());
        submitter
            .send(&ledger, tx.clone(), SendOptions::new().with_endpoint(b.clone()))
            .await
            .unwrap();

        assert_eq!(b.accepted(), vec![tx.hash]);
        assert_eq!(a.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_all_endpoints_failing_rolls_back() {
        let cancel = CancellationToken::new();
        let a = MockEndpoint::new("a");
        let b = a.sibling("b");
        a.fail_sends(true);
        b.fail_sends(true);
        let submitter = submitter(&[a, b], &cancel);

        let ledger = Arc::new(AccountLedger::new(address(3)));
        let tx = mock_tx(address(3), ledger.allocate_nonce());
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let options = SendOptions::new().on_confirm(move |_, _| *flag.lock() = true);

        let err = submitter.send(&ledger, tx, options).await.unwrap_err();
        assert!(matches!(err, SubmitError::AllEndpointsFailed { attempts: 2, .. }));
        assert_eq!(ledger.waiter_count(), 0);
        assert_eq!(ledger.pending_nonce(), 0);
        assert_eq!(ledger.submitted_count(), 0);

        tokio::task::yield_now().await;
        assert!(!*called.lock());
    }

    #[tokio::test]
    async fn test_empty_provider_reports_no_endpoints() {
        let cancel = CancellationToken::new();
        let node = MockEndpoint::new("unused");
        let engine = engine(&[node], &cancel);
        let submitter = TxSubmitter::new(
            engine,
            Arc::new(StaticEndpoints::new(Vec::new())),
            cancel.clone(),
        );

        let ledger = Arc::new(AccountLedger::new(address(4)));
        let tx = mock_tx(address(4), ledger.allocate_nonce());
        let err = submitter
            .send(&ledger, tx, SendOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_no_endpoints());
    }

    #[tokio::test]
    async fn test_already_known_counts_as_accepted() {
        let cancel = CancellationToken::new();
        let node = MockEndpoint::new("node");
        node.answer_already_known(true);
        let submitter = submitter(&[node.clone()], &cancel);

        let ledger = Arc::new(AccountLedger::new(address(5)));
        let tx = mock_tx(address(5), ledger.allocate_nonce());
        let (log_fn, attempts) = attempt_log();
        submitter
            .send(&ledger, tx, SendOptions::new().with_log_fn(log_fn))
            .await
            .unwrap();

        assert_eq!(*attempts.lock(), vec![("node".to_string(), 0, false)]);
        assert_eq!(ledger.submitted_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebroadcast_rotates_and_stops_on_confirmation() {
        let cancel = CancellationToken::new();
        let a = MockEndpoint::new("a");
        let b = a.sibling("b");
        let submitter = submitter(&[a.clone(), b.clone()], &cancel);

        let from = address(6);
        let ledger = Arc::new(AccountLedger::new(from));
        let tx = mock_tx(from, ledger.allocate_nonce());
        let (log_fn, attempts) = attempt_log();
        let (options, confirmed) = confirm_channel();
        let options = options
            .with_log_fn(log_fn)
            .with_rebroadcast(RebroadcastPolicy {
                count: 5,
                interval: Duration::from_secs(1),
            });

        submitter.send(&ledger, tx.clone(), options).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        // Rebroadcasts start at rotation index 1
        assert_eq!(a.accepted().len(), 1);
        assert_eq!(b.accepted().len(), 2);

        a.mine_pending();
        submitter.engine().poll_once().await;
        let receipt = confirmed.await.unwrap().unwrap().expect("receipt");
        assert_eq!(receipt.tx_hash, tx.hash);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(b.accepted().len(), 2);
        let rounds: Vec<u32> = attempts.lock().iter().map(|(_, round, _)| *round).collect();
        assert_eq!(rounds, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_ends_wait_with_cancelled() {
        let cancel = CancellationToken::new();
        let node = MockEndpoint::new("node");
        let submitter = submitter(&[node], &cancel);

        let ledger = Arc::new(AccountLedger::new(address(7)));
        let tx = mock_tx(address(7), ledger.allocate_nonce());
        let pending = {
            let submitter = submitter.clone();
            let ledger = ledger.clone();
            tokio::spawn(async move { submitter.send_and_await(&ledger, tx, SendOptions::new()).await })
        };

        assert!(eventually(Duration::from_secs(2), || ledger.submitted_count() == 1).await);
        cancel.cancel();

        let result = timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_replaced_transaction_confirms_without_receipt() {
        let cancel = CancellationToken::new();
        let node = MockEndpoint::new("node");
        let submitter = submitter(&[node.clone()], &cancel);

        let from = address(8);
        let ledger = Arc::new(AccountLedger::new(from));
        let original = mock_tx(from, ledger.allocate_nonce());
        let (options, confirmed) = confirm_channel();
        submitter.send(&ledger, original, options).await.unwrap();

        // Another transaction with the same nonce wins the slot
        node.include(&[mock_tx_salted(from, 0, 1)]);
        submitter.engine().poll_once().await;

        let result = timeout(Duration::from_secs(5), confirmed).await.unwrap().unwrap();
        assert_eq!(result, Ok(None));
        assert_eq!(ledger.confirmed_nonce(), 1);
    }

    #[tokio::test]
    async fn test_send_without_callback_returns_after_delivery() {
        let cancel = CancellationToken::new();
        let node = MockEndpoint::new("node");
        let submitter = submitter(&[node.clone()], &cancel);

        let ledger = Arc::new(AccountLedger::new(address(9)));
        let tx = mock_tx(address(9), ledger.allocate_nonce());
        submitter.send(&ledger, tx, SendOptions::new()).await.unwrap();

        assert_eq!(ledger.waiter_count(), 0);
        assert_eq!(submitter.engine().tracked_count(), 0);
        assert_eq!(node.accepted().len(), 1);
    }

    #[tokio::test]
    async fn test_send_batch_returns_results_in_order() {
        let cancel = CancellationToken::new();
        let node = MockEndpoint::new("node");
        let submitter = submitter(&[node.clone()], &cancel);

        let from = address(10);
        let ledger = Arc::new(AccountLedger::new(from));
        let txs: Vec<_> = (0..6).map(|_| mock_tx(from, ledger.allocate_nonce())).collect();
        let hashes: Vec<_> = txs.iter().map(|t| t.hash).collect();

        let stop = cancel.child_token();
        let miner = spawn_miner(node.clone(), submitter.engine().clone(), stop.clone());

        let results = timeout(
            Duration::from_secs(10),
            submitter.send_batch(&ledger, txs, 2, None, None),
        )
        .await
        .expect("batch stalled");
        stop.cancel();
        miner.await.unwrap();

        assert_eq!(results.len(), 6);
        for (result, hash) in results.iter().zip(&hashes) {
            let receipt = result.as_ref().unwrap().as_ref().expect("receipt");
            assert_eq!(receipt.tx_hash, *hash);
        }
        assert_eq!(ledger.confirmed_nonce(), 6);
    }

    #[tokio::test]
    async fn test_send_batch_reports_delivery_failures() {
        let cancel = CancellationToken::new();
        let node = MockEndpoint::new("node");
        node.fail_sends(true);
        let submitter = submitter(&[node], &cancel);

        let from = address(11);
        let ledger = Arc::new(AccountLedger::new(from));
        let txs = vec![mock_tx(from, 0), mock_tx(from, 1)];

        let results = timeout(
            Duration::from_secs(5),
            submitter.send_batch(&ledger, txs, 1, None, None),
        )
        .await
        .expect("batch stalled");
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(SubmitError::AllEndpointsFailed { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_lookup_retries_until_node_has_it() {
        let cancel = CancellationToken::new();
        let node = MockEndpoint::new("node");
        let submitter = submitter(&[node.clone()], &cancel);

        let from = address(12);
        let ledger = Arc::new(AccountLedger::new(from));
        let tx = mock_tx(from, ledger.allocate_nonce());
        let (options, confirmed) = confirm_channel();
        submitter.send(&ledger, tx.clone(), options).await.unwrap();

        // The wait is released before any node can serve the receipt
        assert_eq!(ledger.release_below(1), 1);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(node.receipt_queries() >= 2);
        node.mine_pending();

        let receipt = timeout(Duration::from_secs(10), confirmed)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .expect("receipt");
        assert_eq!(receipt.tx_hash, tx.hash);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rebroadcast_policy_without_callback_is_untracked() {
        let cancel = CancellationToken::new();
        let node = MockEndpoint::new("node");
        let submitter = submitter(&[node.clone()], &cancel);

        let ledger = Arc::new(AccountLedger::new(address(13)));
        let tx = mock_tx(address(13), ledger.allocate_nonce());
        let options = SendOptions::new().with_rebroadcast(RebroadcastPolicy {
            count: 0,
            interval: Duration::from_secs(1),
        });
        submitter.send(&ledger, tx, options).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(node.accepted().len(), 1);
        assert_eq!(submitter.engine().tracked_count(), 0);
        assert_eq!(node.receipt_queries(), 0);
    }
}
