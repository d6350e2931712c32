use crate::config::MonitorConfig;
use crate::registry::AgentRegistry;
use chrono::{DateTime, Utc};
use recruitor_core::{Alert, AlertKind, AgentStatus, EventHub, OrchestrationEvent};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

const MAX_RECENT_ISSUES: usize = 5;
const MAX_ALERT_HISTORY: usize = 100;

/// Health classification of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Multiplier applied to a worker's score by the hybrid scorer.
    pub fn factor(self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.75,
            HealthStatus::Unhealthy => 0.4,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Counters and derived health for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub agent_id: String,
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub error_rate: f64,
    /// Requests per minute since the monitor started.
    pub throughput_per_min: f64,
    pub status: HealthStatus,
    pub recent_issues: VecDeque<String>,
    pub last_checked: Option<DateTime<Utc>>,
    /// Set when the monitor itself moved the worker to `error` in the registry.
    #[serde(default)]
    pub flagged_error: bool,
}

impl HealthRecord {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            requests: 0,
            successes: 0,
            errors: 0,
            total_duration_ms: 0,
            avg_duration_ms: 0.0,
            error_rate: 0.0,
            throughput_per_min: 0.0,
            status: HealthStatus::Healthy,
            recent_issues: VecDeque::new(),
            last_checked: None,
            flagged_error: false,
        }
    }

    fn push_issue(&mut self, issue: String) {
        if self.recent_issues.len() == MAX_RECENT_ISSUES {
            self.recent_issues.pop_front();
        }
        self.recent_issues.push_back(issue);
    }
}

/// Aggregate view across every tracked worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_agents: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_response_ms: f64,
    pub error_rate: f64,
}

/// Watches worker behaviour and turns raw counters into health and alerts.
pub struct HealthMonitor {
    records: RwLock<HashMap<String, HealthRecord>>,
    alerts: RwLock<VecDeque<Alert>>,
    registry: Arc<AgentRegistry>,
    events: EventHub,
    config: MonitorConfig,
    started: Instant,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AgentRegistry>, events: EventHub, config: MonitorConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            alerts: RwLock::new(VecDeque::new()),
            registry,
            events,
            config,
            started: Instant::now(),
        }
    }

    /// Records the outcome of one handled request.
    pub async fn record_request(
        &self,
        agent_id: &str,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        let mut records = self.records.write().await;
        let record = records
            .entry(agent_id.to_string())
            .or_insert_with(|| HealthRecord::new(agent_id));

        record.requests += 1;
        record.total_duration_ms += duration_ms;
        if success {
            record.successes += 1;
        } else {
            record.errors += 1;
            record.push_issue(error.unwrap_or("unknown error").to_string());
        }
        record.avg_duration_ms = record.total_duration_ms as f64 / record.requests as f64;
        record.error_rate = record.errors as f64 / record.requests as f64;
        record.throughput_per_min = self.throughput(record.requests);
    }

    /// Requests per minute over the monitor's lifetime, counted from at least
    /// one second so a first request does not divide by zero.
    fn throughput(&self, requests: u64) -> f64 {
        let minutes = (self.started.elapsed().as_secs_f64() / 60.0).max(1.0 / 60.0);
        requests as f64 / minutes
    }

    fn refreshed(&self, record: &HealthRecord) -> HealthRecord {
        let mut record = record.clone();
        record.throughput_per_min = self.throughput(record.requests);
        record
    }

    /// Classifies one record. Registry state wins over counters.
    fn classify(
        &self,
        record: &HealthRecord,
        registry_status: AgentStatus,
        heartbeat_age_secs: i64,
    ) -> HealthStatus {
        let trusted = record.requests >= self.config.min_samples;
        if registry_status == AgentStatus::Offline
            || (registry_status == AgentStatus::Error && !record.flagged_error)
            || (trusted && record.error_rate > self.config.unhealthy_error_rate)
        {
            return HealthStatus::Unhealthy;
        }
        if heartbeat_age_secs > self.config.heartbeat_grace_secs as i64
            || (trusted && record.error_rate >= self.config.degraded_error_rate)
            || record.avg_duration_ms > self.config.latency_ceiling_ms
        {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }

    /// Re-classifies every registered worker and evaluates alert thresholds.
    ///
    /// Returns the alerts raised by this pass. Workers classified unhealthy
    /// by their error rate are moved to `error` in the registry and restored
    /// to `idle` once they recover.
    pub async fn check_health(&self) -> Vec<Alert> {
        let now = Utc::now();
        let agents = self.registry.list_agents().await;
        let mut raised = Vec::new();
        let mut flag = Vec::new();
        let mut unflag = Vec::new();

        {
            let mut records = self.records.write().await;
            for agent in &agents {
                let record = records
                    .entry(agent.id.clone())
                    .or_insert_with(|| HealthRecord::new(&agent.id));
                let age = (now - agent.last_heartbeat).num_seconds();
                let previous = record.status;
                let status = self.classify(record, agent.status, age);
                record.status = status;
                record.last_checked = Some(now);
                record.throughput_per_min = self.throughput(record.requests);

                let trusted = record.requests >= self.config.min_samples;
                let rate_unhealthy = trusted && record.error_rate > self.config.unhealthy_error_rate;
                if rate_unhealthy {
                    raised.push(self.alert(
                        AlertKind::AgentErrorRate,
                        Some(&agent.id),
                        format!(
                            "Worker '{}' error rate {:.0}%",
                            agent.id,
                            record.error_rate * 100.0
                        ),
                        record.error_rate,
                        self.config.unhealthy_error_rate,
                    ));
                    if agent.status.is_reachable() && !record.flagged_error {
                        record.flagged_error = true;
                        flag.push(agent.id.clone());
                    }
                } else if record.flagged_error {
                    record.flagged_error = false;
                    unflag.push(agent.id.clone());
                }

                if status == HealthStatus::Unhealthy && previous != HealthStatus::Unhealthy {
                    raised.push(self.alert(
                        AlertKind::AgentUnhealthy,
                        Some(&agent.id),
                        format!("Worker '{}' is unhealthy", agent.id),
                        record.error_rate,
                        self.config.unhealthy_error_rate,
                    ));
                }
            }
        }

        for agent_id in &flag {
            self.registry.set_status(agent_id, AgentStatus::Error).await;
        }
        for agent_id in &unflag {
            self.registry
                .transition(agent_id, AgentStatus::Error, AgentStatus::Idle)
                .await;
        }

        let system = self.system_metrics().await;
        if system.total_errors >= self.config.alert_error_count {
            raised.push(self.alert(
                AlertKind::ErrorThreshold,
                None,
                format!("{} errors across all workers", system.total_errors),
                system.total_errors as f64,
                self.config.alert_error_count as f64,
            ));
        }
        if system.avg_response_ms > self.config.alert_latency_ms {
            raised.push(self.alert(
                AlertKind::LatencyThreshold,
                None,
                format!("Average response time {:.0}ms", system.avg_response_ms),
                system.avg_response_ms,
                self.config.alert_latency_ms,
            ));
        }

        if !raised.is_empty() {
            let mut alerts = self.alerts.write().await;
            for alert in &raised {
                warn!(kind = alert.kind.as_str(), agent_id = ?alert.agent_id, "{}", alert.message);
                self.events.emit(OrchestrationEvent::Alert(alert.clone()));
                if alerts.len() == MAX_ALERT_HISTORY {
                    alerts.pop_front();
                }
                alerts.push_back(alert.clone());
            }
        }
        raised
    }

    fn alert(
        &self,
        kind: AlertKind,
        agent_id: Option<&str>,
        message: String,
        value: f64,
        threshold: f64,
    ) -> Alert {
        Alert {
            kind,
            agent_id: agent_id.map(str::to_string),
            message,
            value,
            threshold,
            timestamp: Utc::now(),
        }
    }

    /// Health record of a single worker.
    pub async fn get(&self, agent_id: &str) -> Option<HealthRecord> {
        self.records
            .read()
            .await
            .get(agent_id)
            .map(|record| self.refreshed(record))
    }

    /// Every record, sorted by worker id.
    pub async fn snapshot(&self) -> Vec<HealthRecord> {
        let records = self.records.read().await;
        let mut all: Vec<HealthRecord> = records.values().map(|r| self.refreshed(r)).collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    /// Most recent alerts, oldest first.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.iter().cloned().collect()
    }

    pub async fn system_metrics(&self) -> SystemMetrics {
        let records = self.records.read().await;
        let mut metrics = SystemMetrics {
            total_agents: records.len(),
            ..SystemMetrics::default()
        };
        let mut total_duration = 0u64;
        for record in records.values() {
            match record.status {
                HealthStatus::Healthy => metrics.healthy += 1,
                HealthStatus::Degraded => metrics.degraded += 1,
                HealthStatus::Unhealthy => metrics.unhealthy += 1,
            }
            metrics.total_requests += record.requests;
            metrics.total_errors += record.errors;
            total_duration += record.total_duration_ms;
        }
        if metrics.total_requests > 0 {
            metrics.avg_response_ms = total_duration as f64 / metrics.total_requests as f64;
            metrics.error_rate = metrics.total_errors as f64 / metrics.total_requests as f64;
        }
        metrics
    }

    /// Serialize the current state as JSON (for the dashboard).
    pub async fn to_json(&self) -> serde_json::Value {
        let agents = self.snapshot().await;
        let system = self.system_metrics().await;
        let alerts = self.alerts().await;
        serde_json::json!({
            "agents": agents,
            "system": system,
            "alerts": alerts,
        })
    }

    /// Spawns the periodic health check.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let alerts = self.check_health().await;
                info!(alerts = alerts.len(), "Health check complete");
            }
        })
    }
}
