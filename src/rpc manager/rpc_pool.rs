//! Health-tracked endpoint pool
//!
//! Every endpoint handed out by the pool is wrapped so that each call feeds
//! its latency and outcome back into the endpoint's health record. The
//! rotation order is "healthy first, then by smoothed latency".

use super::endpoint::{EndpointProvider, RpcEndpoint};
use super::rpc_errors::{RpcError, RpcResult};
use crate::metrics::metrics;
use crate::types::{Address, Block, Receipt, TxHash};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health status of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health change event for propagation
#[derive(Debug, Clone)]
pub struct HealthChangeEvent {
    pub endpoint: String,
    pub old_status: HealthStatus,
    pub new_status: HealthStatus,
    pub timestamp: Instant,
}

/// EWMA-based latency tracker
#[derive(Debug)]
struct LatencyTracker {
    ewma_latency_ms: RwLock<f64>,
    alpha: f64,
}

impl LatencyTracker {
    fn new(alpha: f64) -> Self {
        Self {
            ewma_latency_ms: RwLock::new(0.0),
            alpha: alpha.clamp(0.01, 0.99),
        }
    }

    fn update(&self, latency_ms: f64) {
        let mut ewma = self.ewma_latency_ms.write();
        if *ewma == 0.0 {
            *ewma = latency_ms;
        } else {
            *ewma = self.alpha * latency_ms + (1.0 - self.alpha) * *ewma;
        }
    }

    fn get(&self) -> f64 {
        *self.ewma_latency_ms.read()
    }
}

/// Endpoint wrapper recording call outcomes
#[derive(Debug)]
pub struct HealthTrackedEndpoint {
    inner: Arc<dyn RpcEndpoint>,
    status: RwLock<HealthStatus>,
    consecutive_failures: AtomicU64,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    latency: LatencyTracker,
    failure_threshold: u64,
    events: broadcast::Sender<HealthChangeEvent>,
}

impl HealthTrackedEndpoint {
    fn new(
        inner: Arc<dyn RpcEndpoint>,
        failure_threshold: u64,
        events: broadcast::Sender<HealthChangeEvent>,
    ) -> Self {
        Self {
            inner,
            status: RwLock::new(HealthStatus::Healthy),
            consecutive_failures: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            latency: LatencyTracker::new(0.2),
            failure_threshold: failure_threshold.max(1),
            events,
        }
    }

    pub fn status(&self) -> HealthStatus {
        *self.status.read()
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.get()
    }

    /// Calculate success rate
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        self.successful_requests.load(Ordering::Relaxed) as f64 / total as f64
    }

    fn record(&self, success: bool, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let failures = if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            0
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
        };
        self.latency.update(latency.as_secs_f64() * 1000.0);

        let new_status = if failures == 0 {
            HealthStatus::Healthy
        } else if failures < self.failure_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        let old_status = {
            let mut status = self.status.write();
            std::mem::replace(&mut *status, new_status)
        };
        if old_status != new_status {
            // Best effort send - don't block if no receivers
            let _ = self.events.send(HealthChangeEvent {
                endpoint: self.inner.name().to_string(),
                old_status,
                new_status,
                timestamp: Instant::now(),
            });
            info!(
                endpoint = %self.inner.name(),
                old = ?old_status,
                new = ?new_status,
                "Health status changed"
            );
        }
    }

    async fn observe<T, F>(&self, fut: F) -> RpcResult<T>
    where
        F: Future<Output = RpcResult<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        // A node rejecting a transaction it already holds is still a healthy node
        let healthy = match &result {
            Ok(_) => true,
            Err(RpcError::AlreadyKnown { .. }) | Err(RpcError::Response { .. }) => true,
            Err(_) => false,
        };
        self.record(healthy, start.elapsed());
        result
    }
}

#[async_trait]
impl RpcEndpoint for HealthTrackedEndpoint {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn block_number(&self) -> RpcResult<u64> {
        self.observe(self.inner.block_number()).await
    }

    async fn block_by_number(&self, number: u64) -> RpcResult<Option<Block>> {
        self.observe(self.inner.block_by_number(number)).await
    }

    async fn block_receipts(&self, number: u64) -> RpcResult<Vec<Receipt>> {
        self.observe(self.inner.block_receipts(number)).await
    }

    async fn transaction_receipt(&self, hash: TxHash) -> RpcResult<Option<Receipt>> {
        self.observe(self.inner.transaction_receipt(hash)).await
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> RpcResult<TxHash> {
        self.observe(self.inner.send_raw_transaction(raw)).await
    }

    async fn nonce_at(&self, address: Address, block: Option<u64>) -> RpcResult<u64> {
        self.observe(self.inner.nonce_at(address, block)).await
    }

    async fn balance_at(&self, address: Address) -> RpcResult<u128> {
        self.observe(self.inner.balance_at(address)).await
    }

    async fn chain_id(&self) -> RpcResult<u64> {
        self.observe(self.inner.chain_id()).await
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    pub degraded_endpoints: usize,
    pub unhealthy_endpoints: usize,
}

/// Endpoint pool with health checks and latency-ranked rotation
pub struct EndpointPool {
    endpoints: Vec<Arc<HealthTrackedEndpoint>>,
    health_check_interval: Duration,
    health_event_tx: broadcast::Sender<HealthChangeEvent>,
}

impl EndpointPool {
    pub fn new(
        endpoints: Vec<Arc<dyn RpcEndpoint>>,
        health_check_interval: Duration,
        failure_threshold: u64,
    ) -> Self {
        let (health_event_tx, _) = broadcast::channel(100);
        let endpoints = endpoints
            .into_iter()
            .map(|inner| {
                Arc::new(HealthTrackedEndpoint::new(
                    inner,
                    failure_threshold,
                    health_event_tx.clone(),
                ))
            })
            .collect();

        Self {
            endpoints,
            health_check_interval,
            health_event_tx,
        }
    }

    /// Subscribe to health change events
    pub fn subscribe_health_events(&self) -> broadcast::Receiver<HealthChangeEvent> {
        self.health_event_tx.subscribe()
    }

    /// Start background health checking until `cancel` fires
    pub fn start_health_checks(self: Arc<Self>, cancel: CancellationToken) {
        let pool = self.clone();
        tokio::spawn(async move {
            info!(
                endpoints = pool.endpoints.len(),
                interval_ms = pool.health_check_interval.as_millis() as u64,
                "Starting endpoint health checks"
            );
            loop {
                pool.check_all_endpoints_health().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pool.health_check_interval) => {}
                }
            }
            debug!("Endpoint health checks stopped");
        });
    }

    async fn check_all_endpoints_health(&self) {
        let checks = self.endpoints.iter().map(|ep| {
            let ep = ep.clone();
            async move {
                if let Err(e) = ep.block_number().await {
                    warn!(endpoint = %ep.name(), error = %e, "Health check failed");
                }
            }
        });
        futures::future::join_all(checks).await;

        let stats = self.stats();
        metrics()
            .healthy_endpoints
            .set(stats.healthy_endpoints as i64 + stats.degraded_endpoints as i64);
    }

    /// Endpoints ordered by health, then smoothed latency
    fn ranked(&self) -> Vec<Arc<HealthTrackedEndpoint>> {
        let mut usable: Vec<_> = self
            .endpoints
            .iter()
            .filter(|ep| ep.status() != HealthStatus::Unhealthy)
            .cloned()
            .collect();
        if usable.is_empty() {
            // Everything is failing; still hand out endpoints so callers can retry
            usable = self.endpoints.clone();
        }
        usable.sort_by(|a, b| {
            a.status()
                .cmp(&b.status())
                .then_with(|| a.latency_ms().total_cmp(&b.latency_ms()))
        });
        usable
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total_endpoints: self.endpoints.len(),
            healthy_endpoints: 0,
            degraded_endpoints: 0,
            unhealthy_endpoints: 0,
        };
        for ep in &self.endpoints {
            match ep.status() {
                HealthStatus::Healthy => stats.healthy_endpoints += 1,
                HealthStatus::Degraded => stats.degraded_endpoints += 1,
                HealthStatus::Unhealthy => stats.unhealthy_endpoints += 1,
            }
        }
        stats
    }
}

impl EndpointProvider for EndpointPool {
    fn endpoint(&self, index: usize) -> Option<Arc<dyn RpcEndpoint>> {
        self.ranked()
            .get(index)
            .map(|ep| ep.clone() as Arc<dyn RpcEndpoint>)
    }

    fn random_endpoint(&self) -> Option<Arc<dyn RpcEndpoint>> {
        let ranked = self.ranked();
        if ranked.is_empty() {
            return None;
        }
        let idx = fastrand::usize(..ranked.len());
        ranked.get(idx).map(|ep| ep.clone() as Arc<dyn RpcEndpoint>)
    }
}
