//! Shared fixtures for the dispatch-core tests

use crate::confirmation::{ConfirmationEngine, EngineConfig};
use crate::rpc_manager::{EndpointProvider, RpcEndpoint, StaticEndpoints};
use crate::test_utils::MockEndpoint;
use crate::types::Address;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub fn address(seed: u8) -> Address {
    Address::new([seed; 20])
}

/// Provider whose rotation is `endpoints` in the given order
pub fn provider(endpoints: &[Arc<MockEndpoint>]) -> Arc<dyn EndpointProvider> {
    Arc::new(StaticEndpoints::new(
        endpoints
            .iter()
            .map(|ep| ep.clone() as Arc<dyn RpcEndpoint>)
            .collect(),
    ))
}

/// Engine settings for tests that drive polls by hand
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(20),
        stale_blocks: 3,
        skip_history_above: u64::MAX,
        max_block_attempts: 2,
        stale_nonce_attempts: 1,
        ..Default::default()
    }
}

pub fn engine(
    endpoints: &[Arc<MockEndpoint>],
    cancel: &CancellationToken,
) -> Arc<ConfirmationEngine> {
    ConfirmationEngine::new(provider(endpoints), test_engine_config(), cancel.clone())
}

/// Poll `condition` every 5ms until it holds or `limit` passes
pub async fn eventually<F>(limit: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let started = Instant::now();
    while started.elapsed() < limit {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
