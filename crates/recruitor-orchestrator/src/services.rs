use crate::balancer::WorkloadBalancer;
use crate::bus::MessageBus;
use crate::config::RecruitorConfig;
use crate::engine::WorkflowEngine;
use crate::monitor::HealthMonitor;
use crate::registry::AgentRegistry;
use crate::runtime::{Agent, AgentRuntime};
use crate::scheduler::ServiceScheduler;
use crate::store::{
    FileWorkflowStore, InMemoryTaskStore, InMemoryWorkflowStore, TaskStore, WorkflowStore,
};
use recruitor_core::{EventHub, RecruitorResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Every orchestration service, wired from one [`RecruitorConfig`].
pub struct Orchestrator {
    config: RecruitorConfig,
    events: EventHub,
    registry: Arc<AgentRegistry>,
    bus: Arc<MessageBus>,
    monitor: Arc<HealthMonitor>,
    balancer: Arc<WorkloadBalancer>,
    engine: Arc<WorkflowEngine>,
    tasks: Arc<dyn TaskStore>,
    scheduler: ServiceScheduler,
}

impl Orchestrator {
    /// Task bindings are kept in memory.
    pub fn new(config: RecruitorConfig, store: Arc<dyn WorkflowStore>) -> Self {
        Self::with_stores(config, store, Arc::new(InMemoryTaskStore::new()))
    }

    /// Wires the services over caller-provided workflow and task stores.
    pub fn with_stores(
        config: RecruitorConfig,
        store: Arc<dyn WorkflowStore>,
        tasks: Arc<dyn TaskStore>,
    ) -> Self {
        let events = EventHub::default();
        let registry = Arc::new(
            AgentRegistry::new(events.clone())
                .with_liveness_timeout(config.registry.liveness_timeout()),
        );
        let bus = Arc::new(
            MessageBus::new(events.clone())
                .with_registry(Arc::clone(&registry))
                .with_default_timeout(Duration::from_millis(config.bus.default_timeout_ms)),
        );
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            events.clone(),
            config.monitor.clone(),
        ));
        let balancer = Arc::new(
            WorkloadBalancer::new(Arc::clone(&registry), events.clone(), config.balancer.clone())
                .with_task_store(Arc::clone(&tasks)),
        );
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&bus),
            Arc::clone(&registry),
            store,
            events.clone(),
            config.workflow.clone(),
        ));
        let scheduler = ServiceScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&monitor),
            Arc::clone(&balancer),
            config.registry.sweep_interval(),
        );

        Self {
            config,
            events,
            registry,
            bus,
            monitor,
            balancer,
            engine,
            tasks,
            scheduler,
        }
    }

    /// Workflows are kept in memory only.
    pub fn in_memory(config: RecruitorConfig) -> Self {
        Self::new(config, Arc::new(InMemoryWorkflowStore::new()))
    }

    /// Workflows are archived under `data_dir`.
    pub async fn from_config(config: RecruitorConfig) -> RecruitorResult<Self> {
        let store = FileWorkflowStore::new(config.data_dir.clone()).await?;
        info!(data_dir = %config.data_dir.display(), "Using file workflow store");
        Ok(Self::new(config, Arc::new(store)))
    }

    /// Wraps `agent` in a runtime attached to these services and initializes it.
    pub async fn spawn_worker(&self, agent: Arc<dyn Agent>) -> RecruitorResult<AgentRuntime> {
        let runtime = AgentRuntime::new(agent, Arc::clone(&self.bus), Arc::clone(&self.registry))
            .with_monitor(Arc::clone(&self.monitor))
            .with_heartbeat_interval(self.config.registry.heartbeat_interval());
        runtime.initialize().await?;
        Ok(runtime)
    }

    /// Starts the periodic loops.
    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    pub fn stop(&self) -> bool {
        self.scheduler.stop()
    }

    pub fn config(&self) -> &RecruitorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn balancer(&self) -> &Arc<WorkloadBalancer> {
        &self.balancer
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Where the balancer persists task bindings.
    pub fn task_store(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    pub fn scheduler(&self) -> &ServiceScheduler {
        &self.scheduler
    }
}
