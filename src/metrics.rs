//! Metrics collection and export module

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Scheduling loop
    pub iterations_started: IntCounter,
    pub iterations_failed: IntCounter,
    pub iteration_panics: IntCounter,
    pub iterations_in_flight: IntGauge,
    pub throughput_target: IntGauge,

    // Submission path
    pub tx_submitted: IntCounter,
    pub tx_submit_failures: IntCounter,
    pub tx_rebroadcasts: IntCounter,

    // Confirmation engine
    pub blocks_processed: IntCounter,
    pub block_failures: IntCounter,
    pub tx_confirmed: IntCounter,
    pub stale_releases: IntCounter,
    pub reorgs_detected: IntCounter,
    pub tracked_ledgers: IntGauge,
    pub last_processed_block: IntGauge,

    // Endpoints
    pub healthy_endpoints: IntGauge,

    // Histograms
    pub rpc_latency: Histogram,
    pub confirmation_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let iterations_started = IntCounter::with_opts(Opts::new(
            "iterations_started_total",
            "Scheduled iterations dispatched",
        ))?;
        let iterations_failed = IntCounter::with_opts(Opts::new(
            "iterations_failed_total",
            "Iterations whose work returned an error",
        ))?;
        let iteration_panics = IntCounter::with_opts(Opts::new(
            "iteration_panics_total",
            "Iterations recovered from a panic",
        ))?;
        let iterations_in_flight = IntGauge::with_opts(Opts::new(
            "iterations_in_flight",
            "Iterations dispatched but not yet completed",
        ))?;
        let throughput_target = IntGauge::with_opts(Opts::new(
            "throughput_target",
            "Current target transactions per slot",
        ))?;

        let tx_submitted = IntCounter::with_opts(Opts::new(
            "tx_submitted_total",
            "Transactions accepted by at least one endpoint",
        ))?;
        let tx_submit_failures = IntCounter::with_opts(Opts::new(
            "tx_submit_failures_total",
            "Transactions rejected by every endpoint",
        ))?;
        let tx_rebroadcasts = IntCounter::with_opts(Opts::new(
            "tx_rebroadcasts_total",
            "Rebroadcast rounds performed",
        ))?;

        let blocks_processed = IntCounter::with_opts(Opts::new(
            "blocks_processed_total",
            "Blocks scanned for tracked transactions",
        ))?;
        let block_failures = IntCounter::with_opts(Opts::new(
            "block_failures_total",
            "Block fetches that failed on every endpoint",
        ))?;
        let tx_confirmed = IntCounter::with_opts(Opts::new(
            "tx_confirmed_total",
            "Tracked transactions observed in blocks",
        ))?;
        let stale_releases = IntCounter::with_opts(Opts::new(
            "stale_releases_total",
            "Waiters force-released by the stale pass",
        ))?;
        let reorgs_detected = IntCounter::with_opts(Opts::new(
            "reorgs_detected_total",
            "Parent hash mismatches within the reorg window",
        ))?;
        let tracked_ledgers = IntGauge::with_opts(Opts::new(
            "tracked_ledgers",
            "Ledgers registered with the confirmation engine",
        ))?;
        let last_processed_block = IntGauge::with_opts(Opts::new(
            "last_processed_block",
            "Highest block processed by the confirmation engine",
        ))?;

        let healthy_endpoints = IntGauge::with_opts(Opts::new(
            "healthy_endpoints",
            "Endpoints currently usable",
        ))?;

        let rpc_latency = Histogram::with_opts(
            HistogramOpts::new("rpc_latency_seconds", "RPC call latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let confirmation_latency = Histogram::with_opts(
            HistogramOpts::new(
                "confirmation_latency_seconds",
                "Time from submission to confirmation",
            )
            .buckets(vec![1.0, 2.0, 6.0, 12.0, 24.0, 48.0, 96.0, 192.0]),
        )?;

        registry.register(Box::new(iterations_started.clone()))?;
        registry.register(Box::new(iterations_failed.clone()))?;
        registry.register(Box::new(iteration_panics.clone()))?;
        registry.register(Box::new(iterations_in_flight.clone()))?;
        registry.register(Box::new(throughput_target.clone()))?;
        registry.register(Box::new(tx_submitted.clone()))?;
        registry.register(Box::new(tx_submit_failures.clone()))?;
        registry.register(Box::new(tx_rebroadcasts.clone()))?;
        registry.register(Box::new(blocks_processed.clone()))?;
        registry.register(Box::new(block_failures.clone()))?;
        registry.register(Box::new(tx_confirmed.clone()))?;
        registry.register(Box::new(stale_releases.clone()))?;
        registry.register(Box::new(reorgs_detected.clone()))?;
        registry.register(Box::new(tracked_ledgers.clone()))?;
        registry.register(Box::new(last_processed_block.clone()))?;
        registry.register(Box::new(healthy_endpoints.clone()))?;
        registry.register(Box::new(rpc_latency.clone()))?;
        registry.register(Box::new(confirmation_latency.clone()))?;

        Ok(Self {
            registry,
            iterations_started,
            iterations_failed,
            iteration_panics,
            iterations_in_flight,
            throughput_target,
            tx_submitted,
            tx_submit_failures,
            tx_rebroadcasts,
            blocks_processed,
            block_failures,
            tx_confirmed,
            stale_releases,
            reorgs_detected,
            tracked_ledgers,
            last_processed_block,
            healthy_endpoints,
            rpc_latency,
            confirmation_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}
