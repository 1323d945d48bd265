//! End-to-end dispatch tests
//!
//! Drives the scheduling loop, submission path and a running confirmation
//! engine against an in-process node that mines every few milliseconds.

mod common;

use common::{address, signed_tx, DevNode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use txflood::confirmation::EngineConfig;
use txflood::rpc_manager::{EndpointProvider, RpcEndpoint, StaticEndpoints};
use txflood::{
    run_scheduled_work, AccountLedger, ConfirmationEngine, ScheduleConfig, SendOptions,
    TxSubmitter,
};

fn spawn_miner(node: Arc<DevNode>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(15)) => {}
            }
            node.mine();
        }
    });
}

fn start_engine(node: &Arc<DevNode>, cancel: &CancellationToken) -> (Arc<ConfirmationEngine>, Arc<dyn EndpointProvider>) {
    let provider: Arc<dyn EndpointProvider> = Arc::new(StaticEndpoints::new(vec![
        node.clone() as Arc<dyn RpcEndpoint>,
    ]));
    let config = EngineConfig {
        poll_interval: Duration::from_millis(10),
        skip_history_above: u64::MAX,
        ..Default::default()
    };
    let engine = ConfirmationEngine::new(provider.clone(), config, cancel.clone());
    engine.start();
    (engine, provider)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scheduled_sends_are_confirmed_in_order() {
    const TOTAL: u64 = 30;

    let cancel = CancellationToken::new();
    let node = DevNode::new();
    spawn_miner(node.clone(), cancel.clone());
    let (engine, provider) = start_engine(&node, &cancel);
    let submitter = TxSubmitter::new(engine.clone(), provider, cancel.clone());

    let senders = [address(1), address(2), address(3)];
    let ledgers: HashMap<_, _> = senders
        .iter()
        .map(|a| (*a, Arc::new(AccountLedger::new(*a))))
        .collect();

    let confirmed = Arc::new(Mutex::new(Vec::new()));
    let logged = Arc::new(Mutex::new(Vec::new()));

    let config = ScheduleConfig {
        total_count: TOTAL,
        max_pending: 6,
        engine: Some(engine.clone()),
        ledgers: ledgers.values().cloned().collect(),
        ..Default::default()
    };

    let ledgers = Arc::new(ledgers);
    let work_confirmed = confirmed.clone();
    let work_logged = logged.clone();
    let report = timeout(
        Duration::from_secs(30),
        run_scheduled_work(config, cancel.clone(), move |ctx| {
            let ledgers = ledgers.clone();
            let submitter = submitter.clone();
            let confirmed = work_confirmed.clone();
            let logged = work_logged.clone();
            async move {
                let sender = senders[(ctx.index() % 3) as usize];
                let ledger = ledgers[&sender].clone();
                let tx = signed_tx(sender, ledger.allocate_nonce());

                let completion = ctx.detach_completion();
                let options = SendOptions::new().on_confirm(move |tx, result| {
                    confirmed.lock().push((tx.hash, result));
                    completion.complete();
                });
                submitter.send(&ledger, tx, options).await?;

                let index = ctx.index();
                ctx.ordered_log(move || logged.lock().push(index));
                ctx.notify_submitted();
                Ok(())
            }
        }),
    )
    .await
    .expect("run stalled")
    .unwrap();
    cancel.cancel();

    assert_eq!(report.counted, TOTAL);
    assert_eq!(report.failed, 0);
    assert!(!report.cancelled);

    let confirmed = confirmed.lock();
    assert_eq!(confirmed.len() as u64, TOTAL);
    for (hash, result) in confirmed.iter() {
        let receipt = result.as_ref().unwrap().as_ref().expect("receipt");
        assert_eq!(receipt.tx_hash, *hash);
    }
    assert_eq!(*logged.lock(), (0..TOTAL).collect::<Vec<_>>());
    for sender in senders {
        assert_eq!(node.nonce(&sender), TOTAL / 3);
    }
}

#[tokio::test]
async fn test_ledger_sync_then_send_and_await() {
    let cancel = CancellationToken::new();
    let node = DevNode::new();
    spawn_miner(node.clone(), cancel.clone());
    let (engine, provider) = start_engine(&node, &cancel);

    // Two transactions already on chain before the ledger exists
    let sender = address(9);
    node.send_raw_transaction(&signed_tx(sender, 0).raw).await.unwrap();
    node.send_raw_transaction(&signed_tx(sender, 1).raw).await.unwrap();
    node.mine();

    let ledger = Arc::new(AccountLedger::new(sender));
    ledger.sync_from(node.as_ref()).await.unwrap();
    assert_eq!(ledger.confirmed_nonce(), 2);
    assert_eq!(ledger.balance(), 1_000_000_000);

    let submitter = TxSubmitter::new(engine, provider, cancel.clone());
    let tx = signed_tx(sender, ledger.allocate_nonce());
    assert_eq!(tx.nonce, 2);

    let receipt = timeout(
        Duration::from_secs(10),
        submitter.send_and_await(&ledger, tx.clone(), SendOptions::new()),
    )
    .await
    .expect("confirmation stalled")
    .unwrap()
    .expect("receipt");
    assert_eq!(receipt.tx_hash, tx.hash);
    assert_eq!(ledger.confirmed_nonce(), 3);
    assert_eq!(ledger.balance(), 1_000_000_000 - 21_000);
    cancel.cancel();
}
