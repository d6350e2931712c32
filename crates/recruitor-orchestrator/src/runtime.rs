use crate::bus::{Inbox, MessageBus};
use crate::monitor::HealthMonitor;
use crate::registry::AgentRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use recruitor_core::{
    ActionSet, AgentDescriptor, AgentInfo, AgentStatus, EventMessage, Message, RecruitorError,
    RecruitorResult, RequestMessage, ResponseMessage,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A worker implementation: its identity, its actions and optional hooks.
#[async_trait]
pub trait Agent: Send + Sync {
    fn descriptor(&self) -> AgentDescriptor;

    /// The actions this worker serves. Called once, at runtime construction.
    fn actions(&self) -> ActionSet;

    /// Worker-specific setup, run after the worker is reachable.
    async fn on_initialize(&self) -> RecruitorResult<()> {
        Ok(())
    }

    /// Worker-specific teardown.
    async fn on_shutdown(&self) -> RecruitorResult<()> {
        Ok(())
    }

    /// Called for every inbound event.
    async fn on_event(&self, _event: &EventMessage) {}
}

/// Everything the consumer loop needs, shared with the runtime handle.
struct WorkerCore {
    id: String,
    agent: Arc<dyn Agent>,
    actions: ActionSet,
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    monitor: Option<Arc<HealthMonitor>>,
}

impl WorkerCore {
    async fn consume(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(message) = inbox.recv().await {
            match message {
                Message::Request(request) => self.handle_request(request).await,
                Message::Event(event) => self.agent.on_event(&event).await,
                Message::Response(response) => {
                    debug!(agent_id = %self.id, correlation_id = %response.correlation_id, "Ignoring response routed to worker");
                }
            }
        }
        debug!(agent_id = %self.id, "Inbox closed, consumer loop exiting");
    }

    async fn handle_request(&self, request: RequestMessage) {
        let started = Instant::now();
        self.registry
            .transition(&self.id, AgentStatus::Idle, AgentStatus::Busy)
            .await;

        let outcome = self.execute(&request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let response = match &outcome {
            Ok(data) => ResponseMessage::success(&request, data.clone()),
            Err(RecruitorError::RequestTimeout { timeout_ms, .. }) => {
                ResponseMessage::timeout(&request, *timeout_ms)
            }
            Err(e) => ResponseMessage::failure(&request, e.to_string()),
        };

        match &outcome {
            Ok(_) => debug!(agent_id = %self.id, action = %request.action, duration_ms, "Request handled"),
            Err(e) => warn!(agent_id = %self.id, action = %request.action, duration_ms, error = %e, "Request failed"),
        }

        if let Some(monitor) = &self.monitor {
            let error = outcome.as_ref().err().map(ToString::to_string);
            monitor
                .record_request(&self.id, outcome.is_ok(), duration_ms, error.as_deref())
                .await;
        }
        self.registry
            .transition(&self.id, AgentStatus::Busy, AgentStatus::Idle)
            .await;

        self.bus.send(Message::Response(response)).await;
    }

    async fn execute(&self, request: &RequestMessage) -> RecruitorResult<serde_json::Value> {
        let action = self.actions.require(&request.action)?;
        let payload = request.payload.clone();
        match request.timeout_ms {
            Some(timeout_ms) => {
                tokio::time::timeout(Duration::from_millis(timeout_ms), action.invoke(payload))
                    .await
                    .map_err(|_| RecruitorError::RequestTimeout {
                        request_id: request.id,
                        timeout_ms,
                    })?
            }
            None => action.invoke(payload).await,
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    shut_down: bool,
    consumer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

/// Runs an [`Agent`]: registers it, drains its inbox one message at a time,
/// keeps its heartbeat fresh and turns requests into responses.
pub struct AgentRuntime {
    core: Arc<WorkerCore>,
    descriptor: AgentDescriptor,
    heartbeat_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
}

impl AgentRuntime {
    pub fn new(agent: Arc<dyn Agent>, bus: Arc<MessageBus>, registry: Arc<AgentRegistry>) -> Self {
        let descriptor = agent.descriptor();
        let actions = agent.actions();
        Self {
            core: Arc::new(WorkerCore {
                id: descriptor.id.clone(),
                agent,
                actions,
                bus,
                registry,
                monitor: None,
            }),
            descriptor,
            heartbeat_interval: Duration::from_secs(30),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Record per-request metrics with `monitor`. Must be called before [`Self::initialize`].
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.monitor = Some(monitor);
        }
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn actions(&self) -> &ActionSet {
        &self.core.actions
    }

    /// Current status as the registry sees it.
    pub async fn status(&self) -> Option<AgentStatus> {
        self.core
            .registry
            .get_agent(&self.core.id)
            .await
            .map(|a| a.status)
    }

    /// Registers, subscribes, starts the consumer and heartbeat, runs the
    /// worker's setup hook and moves to `idle`.
    pub async fn initialize(&self) -> RecruitorResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.initialized {
                return Err(RecruitorError::Registry(format!(
                    "Worker '{}' is already initialized",
                    self.core.id
                )));
            }
            lifecycle.initialized = true;
        }

        let core = &self.core;
        let info = AgentInfo::new(&self.descriptor, core.actions.names())
            .with_status(AgentStatus::Busy);
        core.registry.register(info).await;

        let inbox = core.bus.subscribe(&core.id);
        let consumer = tokio::spawn(Arc::clone(core).consume(inbox));
        let heartbeat = self.spawn_heartbeat();
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.consumer = Some(consumer);
            lifecycle.heartbeat = Some(heartbeat);
        }

        if let Err(e) = core.agent.on_initialize().await {
            error!(agent_id = %core.id, error = %e, "Worker setup failed");
            self.shutdown().await?;
            return Err(e);
        }

        core.registry.set_status(&core.id, AgentStatus::Idle).await;
        info!(agent_id = %core.id, actions = ?core.actions.names(), "Worker initialized");
        Ok(())
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.core.registry);
        let id = self.core.id.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.update_heartbeat(&id).await;
            }
        })
    }

    /// Goes offline, stops the heartbeat and the consumer loop, runs the
    /// teardown hook, then unsubscribes and unregisters. Idempotent.
    pub async fn shutdown(&self) -> RecruitorResult<()> {
        let (consumer, heartbeat) = {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.initialized || lifecycle.shut_down {
                return Ok(());
            }
            lifecycle.shut_down = true;
            (lifecycle.consumer.take(), lifecycle.heartbeat.take())
        };

        let core = &self.core;
        core.registry.set_status(&core.id, AgentStatus::Offline).await;
        if let Some(handle) = heartbeat {
            handle.abort();
        }
        if let Some(handle) = consumer {
            handle.abort();
        }

        let teardown = core.agent.on_shutdown().await;
        if let Err(e) = &teardown {
            warn!(agent_id = %core.id, error = %e, "Worker teardown failed");
        }

        core.bus.unsubscribe(&core.id);
        core.registry.unregister(&core.id).await;
        info!(agent_id = %core.id, "Worker shut down");
        teardown
    }

    /// Sends a request to another worker with this worker as the sender.
    pub async fn send_request(
        &self,
        to: &str,
        action: &str,
        payload: serde_json::Value,
        timeout_ms: Option<u64>,
    ) -> RecruitorResult<ResponseMessage> {
        let mut request = RequestMessage::new(&self.core.id, to, action, payload);
        request.timeout_ms = timeout_ms;
        self.core.bus.send_request(request).await
    }

    /// Broadcasts an event with this worker as the sender.
    pub async fn broadcast(&self, name: &str, data: serde_json::Value) -> usize {
        self.core
            .bus
            .broadcast(EventMessage::new(&self.core.id, name, data))
            .await
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        let mut lifecycle = self.lifecycle.lock();
        if let Some(handle) = lifecycle.consumer.take() {
            handle.abort();
        }
        if let Some(handle) = lifecycle.heartbeat.take() {
            handle.abort();
        }
    }
}
