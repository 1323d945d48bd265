//! txflood command line
//!
//! - `replay`: push pre-signed transactions through the scheduling loop and
//!   submission path, following each one to inclusion
//! - `blob-encode`: print the KZG commitment, proof and versioned hash of a file

#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use txflood::blob::encode_blob;
use txflood::config::Config;
use txflood::endpoints;
use txflood::rpc_manager::{EndpointProvider, RpcEndpoint};
use txflood::structured_logging::StructuredLogger;
use txflood::{
    run_scheduled_work, AccountLedger, Address, ConfirmationEngine, EndpointPool,
    JsonRpcEndpoint, SendOptions, SignedTransaction, TxSubmitter,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "txflood.toml", env = "TXFLOOD_CONFIG")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay pre-signed transactions from a JSON-lines file
    Replay {
        /// One `{from, nonce, hash, raw}` object per line
        #[arg(short, long)]
        input: PathBuf,

        /// Override `[scheduler].throughput`
        #[arg(long)]
        throughput: Option<u64>,

        /// Override `[scheduler].max_pending`
        #[arg(long)]
        max_pending: Option<u64>,
    },
    /// Encode a file as a blob and print its commitment
    BlobEncode {
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.json_logs);

    match args.command {
        Command::BlobEncode { input } => blob_encode(&input),
        Command::Replay {
            input,
            throughput,
            max_pending,
        } => {
            let mut config = load_config(&args.config)?;
            if let Some(throughput) = throughput {
                config.scheduler.throughput = throughput;
            }
            if let Some(max_pending) = max_pending {
                config.scheduler.max_pending = max_pending;
            }
            replay(config, &input).await
        }
    }
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) {
    let env_filter = if verbose {
        "txflood=debug,info"
    } else {
        "txflood=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| env_filter.into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file_with_env(path).with_context(|| format!("Failed to load config from {}", path))
    } else {
        warn!("Config file '{}' not found, using defaults", path);
        Ok(Config::default())
    }
}

fn blob_encode(input: &PathBuf) -> Result<()> {
    let data = std::fs::read(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let blob = encode_blob(&data).context("Failed to encode blob")?;
    println!("data_length:    {}", blob.data_len);
    println!("commitment:     0x{}", hex::encode(blob.commitment));
    println!("proof:          0x{}", hex::encode(blob.proof));
    println!("versioned_hash: {}", blob.versioned_hash);
    Ok(())
}

fn read_transactions(input: &PathBuf) -> Result<Vec<SignedTransaction>> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid transaction on line {}", i + 1))
        })
        .collect()
}

async fn replay(config: Config, input: &PathBuf) -> Result<()> {
    let txs = Arc::new(read_transactions(input)?);
    if txs.is_empty() {
        warn!("No transactions to replay");
        return Ok(());
    }
    info!(transactions = txs.len(), "🚀 Replaying transactions");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 Received shutdown signal");
                cancel.cancel();
            }
        });
    }

    if config.monitoring.enable_metrics {
        let port = config.monitoring.metrics_port;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoints::metrics_server(port, cancel).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    info!(endpoints = config.rpc.endpoints.len(), "🌐 Initializing endpoint pool");
    let clients = config
        .rpc
        .endpoints
        .iter()
        .map(|url| {
            JsonRpcEndpoint::new(url.clone(), config.rpc_timeout())
                .map(|ep| Arc::new(ep) as Arc<dyn RpcEndpoint>)
                .with_context(|| format!("Invalid endpoint {}", url))
        })
        .collect::<Result<Vec<_>>>()?;
    let pool = Arc::new(EndpointPool::new(
        clients,
        std::time::Duration::from_secs(config.rpc.health_check_interval_secs),
        config.rpc.failure_threshold,
    ));
    pool.clone().start_health_checks(cancel.clone());
    let provider: Arc<dyn EndpointProvider> = pool.clone();

    let engine = ConfirmationEngine::new(provider.clone(), config.engine_config(), cancel.clone());
    engine.start();

    let ledgers = sync_ledgers(&txs, provider.as_ref()).await?;
    let submitter = TxSubmitter::new(engine.clone(), provider, cancel.clone());
    let logger = StructuredLogger::new_run();
    let rebroadcast = config.rebroadcast_policy();

    let mut schedule = config.schedule_config();
    schedule.total_count = txs.len() as u64;
    schedule.engine = Some(engine.clone());
    schedule.ledgers = ledgers.values().cloned().collect();

    let ledgers = Arc::new(ledgers);
    let report = run_scheduled_work(schedule, cancel.clone(), move |ctx| {
        let txs = txs.clone();
        let ledgers = ledgers.clone();
        let submitter = submitter.clone();
        let logger = logger.clone();
        async move {
            let Some(tx) = txs.get(ctx.index() as usize).cloned() else {
                return Ok(());
            };
            let ledger = ledgers
                .get(&tx.from)
                .cloned()
                .context("transaction sender has no ledger")?;

            let index = ctx.index();
            let completion = ctx.detach_completion();
            let confirm_logger = logger.clone();
            let mut options = SendOptions::new()
                .with_log_fn(logger.submit_log_fn())
                .on_confirm(move |tx, result| {
                    confirm_logger.log_confirmation(index, tx, &result);
                    completion.complete();
                });
            options.rebroadcast = rebroadcast;

            let (hash, nonce) = (tx.hash, tx.nonce);
            submitter.send(&ledger, tx, options).await?;
            ctx.ordered_log(move || info!(iteration = index, hash = %hash, nonce, "Transaction sent"));
            ctx.notify_submitted();
            Ok(())
        }
    })
    .await?;

    info!(
        started = report.started,
        counted = report.counted,
        failed = report.failed,
        cancelled = report.cancelled,
        "👋 Replay finished"
    );
    cancel.cancel();
    Ok(())
}

/// One ledger per sender, aligned with the chain and with the nonces in
/// the replay file
async fn sync_ledgers(
    txs: &[SignedTransaction],
    provider: &dyn EndpointProvider,
) -> Result<HashMap<Address, Arc<AccountLedger>>> {
    let mut next_nonces: HashMap<Address, u64> = HashMap::new();
    for tx in txs {
        let next = next_nonces.entry(tx.from).or_default();
        *next = (*next).max(tx.nonce + 1);
    }

    let endpoint = provider
        .random_endpoint()
        .context("No endpoint available for ledger sync")?;
    let mut ledgers = HashMap::with_capacity(next_nonces.len());
    for (address, next) in next_nonces {
        let ledger = Arc::new(AccountLedger::new(address));
        ledger
            .sync_from(endpoint.as_ref())
            .await
            .with_context(|| format!("Failed to sync ledger for {}", address))?;
        ledger.resync(next);
        info!(
            address = %address,
            confirmed = ledger.confirmed_nonce(),
            pending = ledger.pending_nonce(),
            balance = %ledger.balance(),
            "💼 Ledger ready"
        );
        ledgers.insert(address, ledger);
    }
    Ok(ledgers)
}
