use crate::balancer::WorkloadBalancer;
use crate::monitor::HealthMonitor;
use crate::registry::AgentRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Owns the periodic service loops: liveness sweep, health checks and
/// workload rebalancing.
///
/// Each loop is a tokio task started by [`start`](Self::start) and aborted by
/// [`stop`](Self::stop). Dropping the scheduler stops them too.
pub struct ServiceScheduler {
    registry: Arc<AgentRegistry>,
    monitor: Arc<HealthMonitor>,
    balancer: Arc<WorkloadBalancer>,
    sweep_interval: Duration,
    loops: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ServiceScheduler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        monitor: Arc<HealthMonitor>,
        balancer: Arc<WorkloadBalancer>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            registry,
            monitor,
            balancer,
            sweep_interval,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Starts every loop. Returns `false` if they were already running.
    pub fn start(&self) -> bool {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return false;
        }
        loops.push((
            "liveness-sweep",
            Arc::clone(&self.registry).start_liveness_sweep(self.sweep_interval),
        ));
        loops.push(("health-check", Arc::clone(&self.monitor).start()));
        loops.push(("rebalance", Arc::clone(&self.balancer).start()));
        info!(
            loops = loops.len(),
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            "Service loops started"
        );
        true
    }

    /// Aborts every loop. Returns `false` if nothing was running.
    pub fn stop(&self) -> bool {
        let loops = std::mem::take(&mut *self.loops.lock());
        if loops.is_empty() {
            return false;
        }
        for (name, handle) in loops {
            handle.abort();
            info!(service = name, "Service loop stopped");
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.loops.lock().iter().any(|(_, h)| !h.is_finished())
    }

    /// Names of the loops currently owned.
    pub fn loop_names(&self) -> Vec<&'static str> {
        self.loops.lock().iter().map(|(name, _)| *name).collect()
    }
}

impl Drop for ServiceScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.loops.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{BalancerConfig, MonitorConfig};
    use chrono::Utc;
    use recruitor_core::{AgentDescriptor, AgentInfo, AgentStatus, EventHub, OrchestrationEvent};

    fn scheduler(events: &EventHub) -> (ServiceScheduler, Arc<AgentRegistry>) {
        let registry = Arc::new(AgentRegistry::new(events.clone()));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            events.clone(),
            MonitorConfig::default(),
        ));
        let balancer = Arc::new(WorkloadBalancer::new(
            Arc::clone(&registry),
            events.clone(),
            BalancerConfig::default(),
        ));
        let scheduler = ServiceScheduler::new(
            Arc::clone(&registry),
            monitor,
            balancer,
            Duration::from_secs(1),
        );
        (scheduler, registry)
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (scheduler, _) = scheduler(&EventHub::default());
        assert!(!scheduler.is_running());
        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());
        assert_eq!(
            scheduler.loop_names(),
            vec!["liveness-sweep", "health-check", "rebalance"]
        );

        assert!(scheduler.stop());
        assert!(!scheduler.stop());
        assert!(!scheduler.is_running());
        assert!(scheduler.start());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_loop_marks_stale_workers_offline() {
        let events = EventHub::default();
        let mut rx = events.subscribe();
        let (scheduler, registry) = scheduler(&events);

        let mut stale = AgentInfo::new(&AgentDescriptor::new("w1", "Stale", "scraper"), vec![])
            .with_status(AgentStatus::Idle);
        stale.last_heartbeat = Utc::now() - chrono::Duration::minutes(10);
        registry.register(stale).await;

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(
            registry.get_agent("w1").await.unwrap().status,
            AgentStatus::Offline
        );
        let mut saw_offline = false;
        while let Ok(event) = rx.try_recv() {
            if let OrchestrationEvent::WorkerOffline { agent_id, .. } = event {
                saw_offline = agent_id == "w1";
            }
        }
        assert!(saw_offline);
        scheduler.stop();
    }
}
