//! Configuration module
//!
//! Loads TOML configuration (after `.env`), fills every omitted field with a
//! default and converts sections into component configs.

use crate::confirmation::EngineConfig;
use crate::scheduler::ScheduleConfig;
use crate::submitter::RebroadcastPolicy;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub rebroadcast: RebroadcastSection,

    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// List of JSON-RPC endpoint URLs
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Consecutive failures before an endpoint is moved out of rotation
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Blocks without inclusion before open waits are checked against chain
    #[serde(default = "default_stale_blocks")]
    pub stale_blocks: u64,

    #[serde(default = "default_reorg_depth")]
    pub reorg_depth: u64,

    #[serde(default = "default_height_timeout_ms")]
    pub height_timeout_ms: u64,

    #[serde(default = "default_block_fetch_timeout_ms")]
    pub block_fetch_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Iterations to run, 0 for unbounded
    #[serde(default)]
    pub total_count: u64,

    /// Transactions per slot, 0 for unlimited
    #[serde(default)]
    pub throughput: u64,

    #[serde(default = "default_slot_secs")]
    pub slot_secs: u64,

    /// In-flight ceiling, 0 for none
    #[serde(default)]
    pub max_pending: u64,

    /// Raise throughput by one every N seconds, 0 to disable
    #[serde(default)]
    pub throughput_increment_interval_secs: u64,

    /// Wall-clock limit, 0 for none
    #[serde(default)]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub await_in_flight: bool,

    #[serde(default)]
    pub drain_on_cancel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebroadcastSection {
    #[serde(default)]
    pub count: u32,

    #[serde(default = "default_rebroadcast_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

// Default value functions
fn default_endpoints() -> Vec<String> { vec!["http://127.0.0.1:8545".to_string()] }
fn default_rpc_timeout_ms() -> u64 { 5_000 }
fn default_health_check_interval() -> u64 { 15 }
fn default_failure_threshold() -> u64 { 3 }
fn default_poll_interval_ms() -> u64 { 3_000 }
fn default_stale_blocks() -> u64 { 10 }
fn default_reorg_depth() -> u64 { 10 }
fn default_height_timeout_ms() -> u64 { 3_000 }
fn default_block_fetch_timeout_ms() -> u64 { 5_000 }
fn default_slot_secs() -> u64 { 12 }
fn default_rebroadcast_interval() -> u64 { 30 }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            timeout_ms: default_rpc_timeout_ms(),
            health_check_interval_secs: default_health_check_interval(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stale_blocks: default_stale_blocks(),
            reorg_depth: default_reorg_depth(),
            height_timeout_ms: default_height_timeout_ms(),
            block_fetch_timeout_ms: default_block_fetch_timeout_ms(),
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            total_count: 0,
            throughput: 0,
            slot_secs: default_slot_secs(),
            max_pending: 0,
            throughput_increment_interval_secs: 0,
            timeout_secs: 0,
            await_in_flight: true,
            drain_on_cancel: false,
        }
    }
}

impl Default for RebroadcastSection {
    fn default() -> Self {
        Self {
            count: 0,
            interval_secs: default_rebroadcast_interval(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_port: default_metrics_port(),
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration after applying `.env` to the process environment
    pub fn from_file_with_env(path: &str) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_file(path)
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rpc.endpoints.is_empty() {
            anyhow::bail!("rpc.endpoints must list at least one endpoint");
        }
        if self.rpc.timeout_ms == 0 {
            anyhow::bail!("rpc.timeout_ms must be greater than zero");
        }
        if self.engine.poll_interval_ms == 0 {
            anyhow::bail!("engine.poll_interval_ms must be greater than zero");
        }
        if self.scheduler.slot_secs == 0 {
            anyhow::bail!("scheduler.slot_secs must be greater than zero");
        }
        if self.rebroadcast.count > 0 && self.rebroadcast.interval_secs == 0 {
            anyhow::bail!("rebroadcast.interval_secs must be greater than zero when count is set");
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.timeout_ms)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            stale_blocks: self.engine.stale_blocks,
            reorg_depth: self.engine.reorg_depth,
            height_timeout: Duration::from_millis(self.engine.height_timeout_ms),
            block_fetch_timeout: Duration::from_millis(self.engine.block_fetch_timeout_ms),
            ..EngineConfig::default()
        }
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        let s = &self.scheduler;
        ScheduleConfig {
            total_count: s.total_count,
            throughput: s.throughput,
            slot_duration: Duration::from_secs(s.slot_secs),
            max_pending: s.max_pending,
            throughput_increment_interval: non_zero_secs(s.throughput_increment_interval_secs),
            timeout: non_zero_secs(s.timeout_secs),
            await_in_flight: s.await_in_flight,
            drain_on_cancel: s.drain_on_cancel,
            ..ScheduleConfig::default()
        }
    }

    pub fn rebroadcast_policy(&self) -> Option<RebroadcastPolicy> {
        (self.rebroadcast.count > 0).then(|| RebroadcastPolicy {
            count: self.rebroadcast.count,
            interval: Duration::from_secs(self.rebroadcast.interval_secs),
        })
    }
}
