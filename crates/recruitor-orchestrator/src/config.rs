use crate::scoring::ScoringStrategy;
use recruitor_core::{RecruitorError, RecruitorResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, usually loaded from `recruitor.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecruitorConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Workers the entry point spawns at startup.
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl Default for RecruitorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bus: BusConfig::default(),
            registry: RegistryConfig::default(),
            monitor: MonitorConfig::default(),
            balancer: BalancerConfig::default(),
            workflow: WorkflowConfig::default(),
            workers: Vec::new(),
        }
    }
}

impl RecruitorConfig {
    /// Parses a TOML document.
    pub fn from_toml(source: &str) -> RecruitorResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| RecruitorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the services cannot run with. Periodic loops need a
    /// non-zero period.
    pub fn validate(&self) -> RecruitorResult<()> {
        let periods = [
            ("registry.heartbeat_interval_secs", self.registry.heartbeat_interval_secs),
            ("registry.sweep_interval_secs", self.registry.sweep_interval_secs),
            ("monitor.health_check_interval_secs", self.monitor.health_check_interval_secs),
            ("balancer.rebalance_interval_secs", self.balancer.rebalance_interval_secs),
            ("bus.default_timeout_ms", self.bus.default_timeout_ms),
            ("workflow.step_timeout_ms", self.workflow.step_timeout_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(RecruitorError::Config(format!("{name} must be greater than zero")));
        }
        if self.workflow.retry.max_attempts == 0 {
            return Err(RecruitorError::Config(
                "workflow.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads and parses a config file.
    pub async fn load(path: &Path) -> RecruitorResult<Self> {
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            RecruitorError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&source)
    }

    /// Reads the file if it exists, otherwise falls back to defaults.
    pub async fn load_or_default(path: &Path) -> RecruitorResult<Self> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Timeout applied to requests that carry no `timeout_ms`.
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_secs(),
            sweep_interval_secs: default_sweep_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_health_check_secs")]
    pub health_check_interval_secs: u64,
    /// Heartbeat age beyond which a worker is degraded.
    #[serde(default = "default_heartbeat_grace_secs")]
    pub heartbeat_grace_secs: u64,
    /// Average duration above which a worker is degraded.
    #[serde(default = "default_latency_ceiling_ms")]
    pub latency_ceiling_ms: f64,
    /// Minimum requests before error rates are trusted.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    #[serde(default = "default_degraded_error_rate")]
    pub degraded_error_rate: f64,
    #[serde(default = "default_unhealthy_error_rate")]
    pub unhealthy_error_rate: f64,
    /// Aggregate error count that raises `alert:error-threshold`.
    #[serde(default = "default_alert_error_count")]
    pub alert_error_count: u64,
    /// System average response time that raises `alert:latency-threshold`.
    #[serde(default = "default_alert_latency_ms")]
    pub alert_latency_ms: f64,
}

impl MonitorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_secs(),
            heartbeat_grace_secs: default_heartbeat_grace_secs(),
            latency_ceiling_ms: default_latency_ceiling_ms(),
            min_samples: default_min_samples(),
            degraded_error_rate: default_degraded_error_rate(),
            unhealthy_error_rate: default_unhealthy_error_rate(),
            alert_error_count: default_alert_error_count(),
            alert_latency_ms: default_alert_latency_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub strategy: ScoringStrategy,
    /// Workers at or above this load are not eligible for new tasks.
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold: f64,
    /// Distance from the mean that marks a worker over- or underloaded.
    #[serde(default = "default_rebalance_margin")]
    pub rebalance_margin: f64,
    /// Excess load that justifies moving one task.
    #[serde(default = "default_rebalance_step")]
    pub rebalance_step: f64,
    /// Load contributed by one assigned, unfinished task.
    #[serde(default = "default_load_per_task")]
    pub load_per_task: f64,
    #[serde(default = "default_rebalance_secs")]
    pub rebalance_interval_secs: u64,
}

impl BalancerConfig {
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs.max(1))
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: ScoringStrategy::default(),
            overload_threshold: default_overload_threshold(),
            rebalance_margin: default_rebalance_margin(),
            rebalance_step: default_rebalance_step(),
            load_per_task: default_load_per_task(),
            rebalance_interval_secs: default_rebalance_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Per-step request timeout.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_snapshots: default_max_snapshots(),
            step_timeout_ms: default_step_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

/// Spacing of repeated attempts when a retried step fails again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Delay before attempt number `attempt` (1-based). The first attempt has no delay.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let ms = self.backoff_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(ms.min(u64::MAX as f64) as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// A worker the CLI spawns from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_worker_type")]
    pub agent_type: String,
    pub actions: Vec<String>,
    #[serde(default)]
    pub specializations: Vec<String>,
    /// Artificial processing delay, useful for exercising timeouts.
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_sweep_secs() -> u64 {
    30
}
fn default_liveness_timeout_secs() -> u64 {
    60
}
fn default_health_check_secs() -> u64 {
    30
}
fn default_heartbeat_grace_secs() -> u64 {
    90
}
fn default_latency_ceiling_ms() -> f64 {
    5_000.0
}
fn default_min_samples() -> u64 {
    10
}
fn default_degraded_error_rate() -> f64 {
    0.2
}
fn default_unhealthy_error_rate() -> f64 {
    0.5
}
fn default_alert_error_count() -> u64 {
    50
}
fn default_alert_latency_ms() -> f64 {
    3_000.0
}
fn default_overload_threshold() -> f64 {
    90.0
}
fn default_rebalance_margin() -> f64 {
    20.0
}
fn default_rebalance_step() -> f64 {
    20.0
}
fn default_load_per_task() -> f64 {
    20.0
}
fn default_rebalance_secs() -> u64 {
    60
}
fn default_max_snapshots() -> usize {
    50
}
fn default_step_timeout_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_worker_type() -> String {
    "generic".to_string()
}
