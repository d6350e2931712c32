use chrono::{DateTime, Utc};
use recruitor_core::{AgentInfo, AgentStatus, EventHub, OrchestrationEvent};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentInfo>,
    by_capability: HashMap<String, HashSet<String>>,
    by_type: HashMap<String, HashSet<String>>,
}

impl RegistryState {
    fn index(&mut self, info: &AgentInfo) {
        for cap in &info.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(info.id.clone());
        }
        self.by_type
            .entry(info.agent_type.clone())
            .or_default()
            .insert(info.id.clone());
    }

    fn unindex(&mut self, info: &AgentInfo) {
        for cap in &info.capabilities {
            if let Some(ids) = self.by_capability.get_mut(cap) {
                ids.remove(&info.id);
                if ids.is_empty() {
                    self.by_capability.remove(cap);
                }
            }
        }
        if let Some(ids) = self.by_type.get_mut(&info.agent_type) {
            ids.remove(&info.id);
            if ids.is_empty() {
                self.by_type.remove(&info.agent_type);
            }
        }
    }

    /// Resolves a set of ids to records in registration order.
    fn collect(&self, ids: Option<&HashSet<String>>) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = ids
            .into_iter()
            .flatten()
            .filter_map(|id| self.agents.get(id).cloned())
            .collect();
        agents.sort_by_key(|a| a.registration_seq);
        agents
    }
}

/// Tracks which workers exist, what they can do and whether they are alive.
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
    next_seq: AtomicU64,
    liveness_timeout: Duration,
    events: EventHub,
}

impl AgentRegistry {
    /// Creates an empty registry that reports membership changes to `events`.
    pub fn new(events: EventHub) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            next_seq: AtomicU64::new(1),
            liveness_timeout: Duration::from_secs(60),
            events,
        }
    }

    /// Sets how old a heartbeat may get before the sweep marks the worker offline.
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// Event hub shared with the rest of the services.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Adds or replaces a worker record.
    ///
    /// Re-registering an id keeps its original registration order. The stored
    /// record is returned with its sequence number filled in.
    pub async fn register(&self, mut info: AgentInfo) -> AgentInfo {
        let mut state = self.state.write().await;
        match state.agents.remove(&info.id) {
            Some(previous) => {
                state.unindex(&previous);
                info.registration_seq = previous.registration_seq;
            }
            None => {
                info.registration_seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            }
        }
        state.index(&info);
        state.agents.insert(info.id.clone(), info.clone());
        drop(state);

        info!(
            agent_id = %info.id,
            agent_type = %info.agent_type,
            capabilities = info.capabilities.len(),
            "Worker registered"
        );
        self.events.emit(OrchestrationEvent::WorkerRegistered {
            agent_id: info.id.clone(),
            agent_type: info.agent_type.clone(),
            capabilities: info.capabilities.clone(),
        });
        info
    }

    /// Removes a worker and returns its last record.
    pub async fn unregister(&self, agent_id: &str) -> Option<AgentInfo> {
        let mut state = self.state.write().await;
        let removed = state.agents.remove(agent_id);
        if let Some(info) = &removed {
            state.unindex(info);
        }
        drop(state);

        if removed.is_some() {
            info!(agent_id = %agent_id, "Worker unregistered");
            self.events.emit(OrchestrationEvent::WorkerUnregistered {
                agent_id: agent_id.to_string(),
            });
        }
        removed
    }

    /// Refreshes a worker's liveness timestamp. An offline worker comes back as idle.
    pub async fn update_heartbeat(&self, agent_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(info) = state.agents.get_mut(agent_id) else {
            return false;
        };
        info.last_heartbeat = Utc::now();
        if info.status == AgentStatus::Offline {
            info.status = AgentStatus::Idle;
            info!(agent_id = %agent_id, "Worker back online");
        }
        true
    }

    /// Sets a worker's status. Returns false for unknown ids.
    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        let mut state = self.state.write().await;
        match state.agents.get_mut(agent_id) {
            Some(info) => {
                if info.status != status {
                    debug!(agent_id = %agent_id, from = %info.status, to = %status, "Worker status change");
                    info.status = status;
                }
                true
            }
            None => false,
        }
    }

    /// Moves a worker to `to` only if it is currently in `from`.
    pub async fn transition(&self, agent_id: &str, from: AgentStatus, to: AgentStatus) -> bool {
        let mut state = self.state.write().await;
        match state.agents.get_mut(agent_id) {
            Some(info) if info.status == from => {
                info.status = to;
                true
            }
            _ => false,
        }
    }

    /// Looks up one worker.
    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentInfo> {
        self.state.read().await.agents.get(agent_id).cloned()
    }

    /// Every worker, in registration order.
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let state = self.state.read().await;
        let mut agents: Vec<AgentInfo> = state.agents.values().cloned().collect();
        agents.sort_by_key(|a| a.registration_seq);
        agents
    }

    /// Workers of the given type, in registration order.
    pub async fn get_agents_by_type(&self, agent_type: &str) -> Vec<AgentInfo> {
        let state = self.state.read().await;
        state.collect(state.by_type.get(agent_type))
    }

    /// Workers offering `action`, offline ones included, in registration order.
    pub async fn find_agents_by_capability(&self, action: &str) -> Vec<AgentInfo> {
        let state = self.state.read().await;
        state.collect(state.by_capability.get(action))
    }

    /// Picks the reachable worker with the best status for `action`.
    ///
    /// Status priority is idle, busy, error; ties go to the earliest
    /// registration. Offline workers are never returned.
    pub async fn get_best_agent_for_capability(&self, action: &str) -> Option<AgentInfo> {
        self.find_agents_by_capability(action)
            .await
            .into_iter()
            .filter(|a| a.status.is_reachable())
            .min_by_key(|a| (a.status.priority(), a.registration_seq))
    }

    /// Number of registered workers.
    pub async fn len(&self) -> usize {
        self.state.read().await.agents.len()
    }

    /// Whether no worker is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Marks every worker whose heartbeat is older than the liveness timeout as
    /// offline and returns their ids. Workers stay registered.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.liveness_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut stale = Vec::new();
        {
            let mut state = self.state.write().await;
            for info in state.agents.values_mut() {
                if info.status != AgentStatus::Offline && now - info.last_heartbeat > timeout {
                    info.status = AgentStatus::Offline;
                    stale.push((info.id.clone(), info.last_heartbeat));
                }
            }
        }

        for (agent_id, last_heartbeat) in &stale {
            warn!(agent_id = %agent_id, last_heartbeat = %last_heartbeat, "Worker missed heartbeats, marking offline");
            self.events.emit(OrchestrationEvent::WorkerOffline {
                agent_id: agent_id.clone(),
                last_heartbeat: *last_heartbeat,
            });
        }
        stale.into_iter().map(|(id, _)| id).collect()
    }

    /// Spawns the periodic liveness sweep. A zero period is raised to one
    /// millisecond.
    pub fn start_liveness_sweep(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_once(Utc::now()).await;
            }
        })
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(EventHub::default())
    }
}
