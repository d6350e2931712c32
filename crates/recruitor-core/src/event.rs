use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kind of advisory alert raised by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    /// Aggregate error count crossed the system threshold.
    ErrorThreshold,
    /// System average response time crossed the latency threshold.
    LatencyThreshold,
    /// A single worker's error rate is excessive.
    AgentErrorRate,
    /// A worker was classified unhealthy.
    AgentUnhealthy,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::ErrorThreshold => "error-threshold",
            AlertKind::LatencyThreshold => "latency-threshold",
            AlertKind::AgentErrorRate => "agent-error-rate",
            AlertKind::AgentUnhealthy => "agent-unhealthy",
        }
    }
}

/// An advisory signal for operators and other components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub agent_id: Option<String>,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// Named lifecycle events emitted by the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    WorkerRegistered {
        agent_id: String,
        agent_type: String,
        capabilities: Vec<String>,
    },
    WorkerUnregistered {
        agent_id: String,
    },
    /// The liveness sweep found a stale heartbeat.
    WorkerOffline {
        agent_id: String,
        last_heartbeat: DateTime<Utc>,
    },
    /// The bus could not reach a recipient.
    DeliveryFailed {
        message_id: Uuid,
        kind: String,
        recipient: Option<String>,
        reason: String,
    },
    TaskAssigned {
        task_id: Uuid,
        agent_id: String,
        score: f64,
    },
    TaskRebalanced {
        task_id: Uuid,
        from_agent: String,
        to_agent: String,
    },
    RebalanceComplete {
        tasks_moved: usize,
        sources: Vec<String>,
        targets: Vec<String>,
    },
    WorkflowStarted {
        workflow_id: Uuid,
        name: String,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
        duration_ms: u64,
    },
    WorkflowFailed {
        workflow_id: Uuid,
        error: String,
    },
    WorkflowCancelled {
        workflow_id: Uuid,
    },
    StepStarted {
        workflow_id: Uuid,
        step_id: String,
        agent_id: String,
    },
    StepCompleted {
        workflow_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },
    StepFailed {
        workflow_id: Uuid,
        step_id: String,
        error: String,
    },
    StepSkipped {
        workflow_id: Uuid,
        step_id: String,
        reason: String,
    },
    Alert(Alert),
}

impl OrchestrationEvent {
    /// Stable event name used by subscribers (`task:assigned`, `alert:error-threshold`, ...).
    pub fn name(&self) -> String {
        let name = match self {
            OrchestrationEvent::WorkerRegistered { .. } => "worker-registered",
            OrchestrationEvent::WorkerUnregistered { .. } => "worker-unregistered",
            OrchestrationEvent::WorkerOffline { .. } => "worker-offline",
            OrchestrationEvent::DeliveryFailed { .. } => "delivery-failed",
            OrchestrationEvent::TaskAssigned { .. } => "task:assigned",
            OrchestrationEvent::TaskRebalanced { .. } => "task:rebalanced",
            OrchestrationEvent::RebalanceComplete { .. } => "rebalance:complete",
            OrchestrationEvent::WorkflowStarted { .. } => "workflow:started",
            OrchestrationEvent::WorkflowCompleted { .. } => "workflow:completed",
            OrchestrationEvent::WorkflowFailed { .. } => "workflow:failed",
            OrchestrationEvent::WorkflowCancelled { .. } => "workflow:cancelled",
            OrchestrationEvent::StepStarted { .. } => "step:started",
            OrchestrationEvent::StepCompleted { .. } => "step:completed",
            OrchestrationEvent::StepFailed { .. } => "step:failed",
            OrchestrationEvent::StepSkipped { .. } => "step:skipped",
            OrchestrationEvent::Alert(alert) => return format!("alert:{}", alert.kind.as_str()),
        };
        name.to_string()
    }
}

/// Fan-out point for [`OrchestrationEvent`]s.
///
/// Cloning the hub yields another handle to the same channel. Emitting with
/// no subscribers is not an error; slow subscribers lag and lose the oldest
/// events rather than blocking emitters.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<OrchestrationEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to every current subscriber.
    pub fn emit(&self, event: OrchestrationEvent) {
        tracing::debug!(event = %event.name(), "Emitting orchestration event");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let ev = OrchestrationEvent::TaskAssigned {
            task_id: Uuid::new_v4(),
            agent_id: "w1".into(),
            score: 80.0,
        };
        assert_eq!(ev.name(), "task:assigned");

        let alert = OrchestrationEvent::Alert(Alert {
            kind: AlertKind::LatencyThreshold,
            agent_id: None,
            message: "slow".into(),
            value: 4000.0,
            threshold: 3000.0,
            timestamp: Utc::now(),
        });
        assert_eq!(alert.name(), "alert:latency-threshold");
    }

    #[tokio::test]
    async fn test_hub_fan_out() {
        let hub = EventHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.clone().subscribe();
        hub.emit(OrchestrationEvent::WorkflowCancelled {
            workflow_id: Uuid::new_v4(),
        });
        assert_eq!(a.recv().await.unwrap().name(), "workflow:cancelled");
        assert_eq!(b.recv().await.unwrap().name(), "workflow:cancelled");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let hub = EventHub::default();
        assert_eq!(hub.subscriber_count(), 0);
        hub.emit(OrchestrationEvent::WorkerUnregistered {
            agent_id: "w1".into(),
        });
    }

    #[test]
    fn test_event_serialization() {
        let ev = OrchestrationEvent::WorkerOffline {
            agent_id: "w1".into(),
            last_heartbeat: Utc::now(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "worker_offline");
        assert_eq!(json["agent_id"], "w1");
    }
}
