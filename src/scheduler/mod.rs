//! Scheduling loop
//!
//! Drives a caller-supplied per-iteration future at a target rate while
//! bounding the number of in-flight iterations. Ordered log output, ramp-up,
//! error mode, panic containment and block telemetry hang off the loop.

pub mod admission;
pub mod ordered_log;
pub mod rate;
pub mod telemetry;

pub use admission::AdmissionGate;
pub use ordered_log::{LogFn, OrderedChain, OrderedLink};
pub use rate::RateGate;

use crate::confirmation::ConfirmationEngine;
use crate::metrics::metrics;
use crate::nonce_manager::AccountLedger;
use crate::recovery::panic_message;
use crate::structured_logging::StructuredLogger;
use crate::submitter::SubmitError;
use futures::FutureExt;
use scopeguard::ScopeGuard;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default slot length; throughput is expressed per slot
pub const DEFAULT_SLOT_DURATION: Duration = Duration::from_secs(12);

/// Hook receiving per-iteration errors
pub type ErrorHook = Arc<dyn Fn(u64, &anyhow::Error) + Send + Sync>;

/// Scheduling loop errors. Only raised before the first iteration starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid schedule configuration: {0}")]
    InvalidConfig(String),
}

/// Loop parameters
#[derive(Clone)]
pub struct ScheduleConfig {
    /// Iterations to run, 0 for unbounded
    pub total_count: u64,
    /// Iterations per slot, 0 for unlimited
    pub throughput: u64,
    pub slot_duration: Duration,
    /// In-flight ceiling, 0 for none
    pub max_pending: u64,
    /// Raise throughput by one per tick, scaling the ceiling with it
    pub throughput_increment_interval: Option<Duration>,
    pub timeout: Option<Duration>,
    /// Wait for every in-flight iteration before returning
    pub await_in_flight: bool,
    /// Keep draining in-flight iterations after cancellation
    pub drain_on_cancel: bool,
    /// Source of per-block telemetry
    pub engine: Option<Arc<ConfirmationEngine>>,
    /// Ledgers whose confirmations the telemetry attributes to this run
    pub ledgers: Vec<Arc<AccountLedger>>,
    pub on_error: Option<ErrorHook>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            total_count: 0,
            throughput: 0,
            slot_duration: DEFAULT_SLOT_DURATION,
            max_pending: 0,
            throughput_increment_interval: None,
            timeout: None,
            await_in_flight: true,
            drain_on_cancel: false,
            engine: None,
            ledgers: Vec::new(),
            on_error: None,
        }
    }
}

impl std::fmt::Debug for ScheduleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleConfig")
            .field("total_count", &self.total_count)
            .field("throughput", &self.throughput)
            .field("slot_duration", &self.slot_duration)
            .field("max_pending", &self.max_pending)
            .field("throughput_increment_interval", &self.throughput_increment_interval)
            .field("timeout", &self.timeout)
            .field("await_in_flight", &self.await_in_flight)
            .field("drain_on_cancel", &self.drain_on_cancel)
            .field("engine", &self.engine.is_some())
            .field("ledgers", &self.ledgers.len())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.timeout == Some(Duration::ZERO) {
            return Err(ScheduleError::InvalidConfig(
                "timeout must be greater than zero".into(),
            ));
        }
        if self.slot_duration.is_zero() {
            return Err(ScheduleError::InvalidConfig(
                "slot duration must be greater than zero".into(),
            ));
        }
        if let Some(interval) = self.throughput_increment_interval {
            if interval.is_zero() {
                return Err(ScheduleError::InvalidConfig(
                    "throughput increment interval must be greater than zero".into(),
                ));
            }
            if self.throughput == 0 {
                return Err(ScheduleError::InvalidConfig(
                    "throughput ramp-up needs a non-zero starting throughput".into(),
                ));
            }
        }
        Ok(())
    }
}

/// What a finished run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub run_id: String,
    pub started: u64,
    /// Iterations counted toward the total
    pub counted: u64,
    pub failed: u64,
    pub panicked: u64,
    /// The run stopped on cancellation or timeout
    pub cancelled: bool,
}

#[derive(Debug)]
struct RunState {
    rate: RateGate,
    gate: AdmissionGate,
    idle: Notify,
    started: AtomicU64,
    /// Started iterations minus those that finished without counting
    committed: AtomicU64,
    counted: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

impl RunState {
    fn finish_one(&self) {
        self.gate.release();
        let in_flight = self.gate.in_flight();
        metrics().iterations_in_flight.set(in_flight);
        if in_flight <= 0 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until nothing is in flight. Returns false if `cancel` fired first.
    async fn wait_idle(&self, cancel: Option<&CancellationToken>) -> bool {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.gate.in_flight() <= 0 {
                return true;
            }
            match cancel {
                Some(cancel) => tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = &mut notified => {}
                },
                None => notified.await,
            }
        }
    }
}

#[derive(Debug)]
struct IterationState {
    index: u64,
    link: Arc<OrderedLink>,
    submitted: AtomicBool,
    detached: AtomicBool,
    done: AtomicBool,
    run: Arc<RunState>,
}

impl IterationState {
    fn notify_submitted(&self) {
        if !self.submitted.swap(true, Ordering::AcqRel) {
            self.link.mark_submitted();
        }
    }

    fn complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        // Unblocks ordered logging for iterations that never submitted
        self.link.mark_submitted();
        self.run.finish_one();
    }
}

/// Completes its iteration exactly once, on [`Completion::complete`] or drop
#[derive(Debug)]
pub struct Completion {
    state: Option<Arc<IterationState>>,
}

impl Completion {
    pub fn complete(mut self) {
        if let Some(state) = self.state.take() {
            state.complete();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state
            .as_ref()
            .map_or(true, |s| s.done.load(Ordering::Acquire))
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.complete();
        }
    }
}

/// Handle given to each iteration
#[derive(Debug)]
pub struct IterationContext {
    state: Arc<IterationState>,
    cancel: CancellationToken,
}

impl IterationContext {
    /// Dense, strictly increasing iteration index
    pub fn index(&self) -> u64 {
        self.state.index
    }

    /// Fires on run cancellation or timeout
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Queue a log side effect to be emitted in iteration order
    pub fn ordered_log<F>(&self, log: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.link.log(Box::new(log));
    }

    /// The transaction went out: count this iteration and let its ordered
    /// logs flush once earlier iterations have
    pub fn notify_submitted(&self) {
        self.state.notify_submitted();
    }

    /// Take over completion of this iteration, e.g. to complete it from a
    /// confirm callback. The iteration then stays in flight after the work
    /// future returns until the handle completes or drops.
    pub fn detach_completion(&self) -> Completion {
        self.state.detached.store(true, Ordering::Release);
        Completion {
            state: Some(self.state.clone()),
        }
    }
}

/// Run `work` once per admitted iteration until `total_count` is reached or
/// `cancel` fires.
///
/// Iteration errors go to the configured error hook and never stop the
/// loop; only an invalid configuration does.
pub async fn run_scheduled_work<F, Fut>(
    config: ScheduleConfig,
    cancel: CancellationToken,
    work: F,
) -> Result<ScheduleReport, ScheduleError>
where
    F: Fn(IterationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    config.validate()?;

    let logger = StructuredLogger::new_run();
    let run_cancel = cancel.child_token();
    let loop_done = CancellationToken::new();
    let work = Arc::new(work);

    let run = Arc::new(RunState {
        rate: RateGate::new(config.throughput, config.slot_duration),
        gate: AdmissionGate::new(config.max_pending),
        idle: Notify::new(),
        started: AtomicU64::new(0),
        committed: AtomicU64::new(0),
        counted: AtomicU64::new(0),
        failed: AtomicU64::new(0),
        panicked: AtomicU64::new(0),
    });
    metrics().throughput_target.set(config.throughput as i64);

    info!(
        run_id = %logger.context_id(),
        total = config.total_count,
        throughput = config.throughput,
        max_pending = config.max_pending,
        "Starting scheduled run"
    );

    if let Some(timeout) = config.timeout {
        info!(timeout_secs = timeout.as_secs_f64(), "Run will time out");
        let run_cancel = run_cancel.clone();
        let loop_done = loop_done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = loop_done.cancelled() => {}
                _ = tokio::time::sleep(timeout) => run_cancel.cancel(),
            }
        });
    }

    if let Some(interval) = config.throughput_increment_interval {
        spawn_ramp(run.clone(), &config, interval, loop_done.clone());
    }

    if let Some(engine) = &config.engine {
        telemetry::spawn_block_telemetry(
            engine,
            config.ledgers.clone(),
            logger.clone(),
            loop_done.child_token(),
        );
    }

    let mut chain = OrderedChain::new();
    let mut reached = false;

    loop {
        if !run.rate.acquire(&run_cancel).await {
            break;
        }
        if !run.gate.admit(&run_cancel).await {
            break;
        }
        metrics().iterations_in_flight.set(run.gate.in_flight());

        let state = Arc::new(IterationState {
            index: run.started.fetch_add(1, Ordering::AcqRel),
            link: chain.next_link(),
            submitted: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            done: AtomicBool::new(false),
            run: run.clone(),
        });
        let committed = run.committed.fetch_add(1, Ordering::AcqRel) + 1;
        metrics().iterations_started.inc();

        tokio::spawn(run_iteration(
            state,
            run_cancel.clone(),
            work.clone(),
            config.on_error.clone(),
            logger.clone(),
        ));

        if config.total_count > 0 && committed >= config.total_count {
            reached = true;
            break;
        }
    }

    let cancelled = !reached;
    let wait_on = (!config.drain_on_cancel).then_some(&run_cancel);

    if reached || config.drain_on_cancel {
        let drained = match wait_on {
            Some(token) => tokio::select! {
                _ = token.cancelled() => false,
                _ = chain.drain() => true,
            },
            None => {
                chain.drain().await;
                true
            }
        };
        if drained && config.await_in_flight {
            run.wait_idle(wait_on).await;
        }
    }
    loop_done.cancel();

    let report = ScheduleReport {
        run_id: logger.context_id().to_string(),
        started: run.started.load(Ordering::Acquire),
        counted: run.counted.load(Ordering::Acquire),
        failed: run.failed.load(Ordering::Acquire),
        panicked: run.panicked.load(Ordering::Acquire),
        cancelled: cancelled || run_cancel.is_cancelled(),
    };
    info!(
        run_id = %report.run_id,
        started = report.started,
        counted = report.counted,
        failed = report.failed,
        panicked = report.panicked,
        cancelled = report.cancelled,
        "Scheduled run finished"
    );
    Ok(report)
}

async fn run_iteration<F, Fut>(
    state: Arc<IterationState>,
    cancel: CancellationToken,
    work: Arc<F>,
    on_error: Option<ErrorHook>,
    logger: StructuredLogger,
) where
    F: Fn(IterationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let run = state.run.clone();
    let index = state.index;
    let uncounted = scopeguard::guard((), |_| {
        run.committed.fetch_sub(1, Ordering::AcqRel);
    });

    let ctx = IterationContext {
        state: state.clone(),
        cancel,
    };
    let outcome = AssertUnwindSafe(async move { work(ctx).await })
        .catch_unwind()
        .await;

    let (counts, complete_now) = match outcome {
        Ok(Ok(())) => {
            run.rate.set_error_mode(false);
            (
                state.submitted.load(Ordering::Acquire),
                !state.detached.load(Ordering::Acquire),
            )
        }
        Ok(Err(err)) => {
            let no_endpoints = err
                .downcast_ref::<SubmitError>()
                .is_some_and(SubmitError::is_no_endpoints);
            if no_endpoints && !run.rate.in_error_mode() {
                debug!(iteration = index, "No endpoints available, entering error mode");
            }
            run.rate.set_error_mode(no_endpoints);

            run.failed.fetch_add(1, Ordering::AcqRel);
            metrics().iterations_failed.inc();
            match &on_error {
                Some(hook) => hook(index, &err),
                None => logger.log_iteration_failed(index, &err),
            }
            (true, !state.detached.load(Ordering::Acquire))
        }
        Err(payload) => {
            run.panicked.fetch_add(1, Ordering::AcqRel);
            metrics().iteration_panics.inc();
            logger.log_iteration_panic(index, &panic_message(payload.as_ref()));
            (true, true)
        }
    };

    // Counters settle before the admission slot is released
    if counts {
        run.counted.fetch_add(1, Ordering::AcqRel);
        ScopeGuard::into_inner(uncounted);
    } else {
        drop(uncounted);
    }
    if complete_now {
        state.complete();
    }
}

/// Raise throughput by one per tick, keeping the in-flight ceiling at the
/// configured ratio
fn spawn_ramp(
    run: Arc<RunState>,
    config: &ScheduleConfig,
    interval: Duration,
    stop: CancellationToken,
) {
    let ratio = config.max_pending as f64 / config.throughput as f64;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let throughput = run.rate.throughput();
            let next = throughput + 1;
            let ceiling = (next as f64 * ratio) as u64;
            info!(
                from = throughput,
                to = next,
                max_pending_from = run.gate.ceiling(),
                max_pending_to = ceiling,
                "Increasing throughput"
            );
            run.rate.set_throughput(next);
            run.gate.set_ceiling(ceiling);
            metrics().throughput_target.set(next as i64);
        }
    });
}
