use crate::config::BalancerConfig;
use crate::monitor::HealthStatus;
use crate::registry::AgentRegistry;
use crate::scoring::{self, Candidate, HybridScorer, TaskScorer};
use crate::store::{InMemoryTaskStore, TaskStore};
use chrono::{DateTime, Utc};
use recruitor_core::{AgentInfo, EventHub, OrchestrationEvent, RecruitorError, RecruitorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reason reported when no worker passes the eligibility filter.
pub const NO_AVAILABLE_AGENTS: &str = "No available agents found";

/// Lifecycle of a balanced task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A unit of work to place on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadTask {
    pub id: Uuid,
    pub task_type: String,
    /// 0.0 (lowest) to 1.0 (highest).
    pub priority: f64,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Worker the task is currently bound to.
    #[serde(default)]
    pub assigned_agent: Option<String>,
}

impl WorkloadTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            priority: 0.5,
            estimated_duration_ms: None,
            required_capabilities: Vec::new(),
            payload,
            created_at: Utc::now(),
            due_at: None,
            status: TaskStatus::Pending,
            assigned_agent: None,
        }
    }

    /// Sets the priority, clamped to `0.0..=1.0`.
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = if priority.is_nan() {
            0.0
        } else {
            priority.clamp(0.0, 1.0)
        };
        self
    }

    pub fn with_required_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_estimated_duration(mut self, duration_ms: u64) -> Self {
        self.estimated_duration_ms = Some(duration_ms);
        self
    }

    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

/// Balancer bookkeeping for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoad {
    pub agent_id: String,
    /// 0 to 100.
    pub current_load: f64,
    pub active_tasks: usize,
    pub completed: u64,
    pub failed: u64,
    pub total_duration_ms: u64,
    pub health: HealthStatus,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub latency_ms: Option<f64>,
}

impl AgentLoad {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            current_load: 0.0,
            active_tasks: 0,
            completed: 0,
            failed: 0,
            total_duration_ms: 0,
            health: HealthStatus::Healthy,
            cpu: None,
            memory: None,
            latency_ms: None,
        }
    }

    /// Share of finished tasks that succeeded; 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            1.0
        } else {
            self.completed as f64 / finished as f64
        }
    }

    fn add_load(&mut self, amount: f64) {
        self.current_load = (self.current_load + amount).clamp(0.0, 100.0);
    }
}

/// Resource sample reported for a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthSample {
    pub cpu: f64,
    pub memory: f64,
    #[serde(default)]
    pub latency_ms: Option<f64>,
}

impl HealthSample {
    pub fn classify(&self) -> HealthStatus {
        let worst = self.cpu.max(self.memory);
        if worst > 90.0 {
            HealthStatus::Unhealthy
        } else if worst >= 70.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Outcome of one assignment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentResult {
    pub task_id: Uuid,
    pub success: bool,
    pub agent_id: Option<String>,
    pub score: Option<f64>,
    pub reason: Option<String>,
}

impl AssignmentResult {
    fn assigned(task_id: Uuid, agent_id: String, score: f64) -> Self {
        Self {
            task_id,
            success: true,
            agent_id: Some(agent_id),
            score: Some(score),
            reason: None,
        }
    }

    fn rejected(task_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            agent_id: None,
            score: None,
            reason: Some(reason.into()),
        }
    }
}

/// A task together with the worker that currently owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task: WorkloadTask,
    pub agent_id: String,
    pub assigned_at: DateTime<Utc>,
}

/// Summary of one rebalancing pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub tasks_moved: usize,
    pub sources: Vec<String>,
    pub targets: Vec<String>,
}

#[derive(Default)]
struct BalancerState {
    loads: HashMap<String, AgentLoad>,
    assignments: HashMap<Uuid, TaskAssignment>,
}

impl BalancerState {
    fn load_mut(&mut self, agent_id: &str) -> &mut AgentLoad {
        self.loads
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentLoad::new(agent_id))
    }

    fn load_of(&self, agent_id: &str) -> f64 {
        self.loads.get(agent_id).map_or(0.0, |l| l.current_load)
    }
}

/// The stored task behind a successful assignment.
fn bound_task(state: &BalancerState, result: &AssignmentResult) -> Option<WorkloadTask> {
    if !result.success {
        return None;
    }
    state
        .assignments
        .get(&result.task_id)
        .map(|a| a.task.clone())
}

/// Places tasks on the best current worker and corrects load skew.
pub struct WorkloadBalancer {
    registry: Arc<AgentRegistry>,
    events: EventHub,
    config: BalancerConfig,
    scorer: Arc<dyn TaskScorer>,
    tasks: Arc<dyn TaskStore>,
    state: RwLock<BalancerState>,
}

impl WorkloadBalancer {
    pub fn new(registry: Arc<AgentRegistry>, events: EventHub, config: BalancerConfig) -> Self {
        Self {
            registry,
            events,
            config,
            scorer: Arc::new(HybridScorer::default()),
            tasks: Arc::new(InMemoryTaskStore::new()),
            state: RwLock::new(BalancerState::default()),
        }
    }

    /// Persists task bindings to `store` instead of the default in-memory one.
    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.tasks = store;
        self
    }

    /// Store holding the persisted bindings.
    pub fn task_store(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    /// Writes the current binding of each task through the task store.
    /// Store failures are logged; the in-memory binding stays authoritative.
    async fn persist(&self, tasks: &[WorkloadTask]) {
        for task in tasks {
            if let Err(e) = self.tasks.save(task).await {
                warn!(task_id = %task.id, error = %e, "Failed to persist task binding");
            }
        }
    }

    /// Replaces the scorer used by the `hybrid` strategy.
    pub fn with_scorer(mut self, scorer: Arc<dyn TaskScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    fn eligible(&self, info: &AgentInfo, load: f64, task: &WorkloadTask) -> bool {
        info.status.is_reachable()
            && load < self.config.overload_threshold
            && info.supports_all(&task.required_capabilities)
    }

    /// Assigns one task to the highest-scoring eligible worker.
    pub async fn assign_task(&self, task: WorkloadTask) -> AssignmentResult {
        let agents = self.registry.list_agents().await;
        let mut state = self.state.write().await;
        let result = self.assign_locked(&mut state, &agents, task);
        let bound = bound_task(&state, &result);
        drop(state);
        self.persist(bound.as_slice()).await;
        result
    }

    /// Assigns a batch, highest priority first. Equal priorities keep their order.
    pub async fn assign_tasks(&self, mut tasks: Vec<WorkloadTask>) -> Vec<AssignmentResult> {
        tasks.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        let agents = self.registry.list_agents().await;
        let mut state = self.state.write().await;
        let results: Vec<AssignmentResult> = tasks
            .into_iter()
            .map(|task| self.assign_locked(&mut state, &agents, task))
            .collect();
        let bound: Vec<WorkloadTask> = results
            .iter()
            .flat_map(|r| bound_task(&state, r))
            .collect();
        drop(state);
        self.persist(&bound).await;
        results
    }

    fn assign_locked(
        &self,
        state: &mut BalancerState,
        agents: &[AgentInfo],
        mut task: WorkloadTask,
    ) -> AssignmentResult {
        let task_id = task.id;
        if let Some(previous) = state.assignments.remove(&task_id) {
            if !previous.task.status.is_terminal() {
                let load = state.load_mut(&previous.agent_id);
                load.add_load(-self.config.load_per_task);
                load.active_tasks = load.active_tasks.saturating_sub(1);
            }
        }

        let mut best: Option<(&AgentInfo, f64)> = None;
        for info in agents {
            let load = state
                .loads
                .get(&info.id)
                .cloned()
                .unwrap_or_else(|| AgentLoad::new(&info.id));
            if !self.eligible(info, load.current_load, &task) {
                continue;
            }
            let score = scoring::score(
                self.config.strategy,
                self.scorer.as_ref(),
                &task,
                Candidate { info, load: &load },
            );
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((info, score));
            }
        }

        let Some((info, score)) = best else {
            debug!(task_id = %task_id, task_type = %task.task_type, "No eligible worker for task");
            return AssignmentResult::rejected(task_id, NO_AVAILABLE_AGENTS);
        };

        let agent_id = info.id.clone();
        let load = state.load_mut(&agent_id);
        load.add_load(self.config.load_per_task);
        load.active_tasks += 1;

        task.status = TaskStatus::Pending;
        task.assigned_agent = Some(agent_id.clone());
        state.assignments.insert(
            task_id,
            TaskAssignment {
                task,
                agent_id: agent_id.clone(),
                assigned_at: Utc::now(),
            },
        );

        info!(task_id = %task_id, agent_id = %agent_id, score, "Task assigned");
        self.events.emit(OrchestrationEvent::TaskAssigned {
            task_id,
            agent_id: agent_id.clone(),
            score,
        });
        AssignmentResult::assigned(task_id, agent_id, score)
    }

    pub async fn start_task(&self, task_id: Uuid) -> RecruitorResult<()> {
        let mut state = self.state.write().await;
        let assignment = state
            .assignments
            .get_mut(&task_id)
            .ok_or(RecruitorError::TaskNotFound(task_id))?;
        if assignment.task.status != TaskStatus::Pending {
            return Err(RecruitorError::Workflow(format!(
                "Task {task_id} cannot start from status {:?}",
                assignment.task.status
            )));
        }
        assignment.task.status = TaskStatus::Running;
        let task = assignment.task.clone();
        drop(state);
        self.persist(&[task]).await;
        Ok(())
    }

    /// Marks a task finished and releases its load.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        success: bool,
        duration_ms: u64,
    ) -> RecruitorResult<()> {
        let mut state = self.state.write().await;
        let assignment = state
            .assignments
            .get_mut(&task_id)
            .ok_or(RecruitorError::TaskNotFound(task_id))?;
        if assignment.task.status.is_terminal() {
            return Ok(());
        }
        assignment.task.status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let agent_id = assignment.agent_id.clone();
        let task = assignment.task.clone();

        let per_task = self.config.load_per_task;
        let load = state.load_mut(&agent_id);
        load.add_load(-per_task);
        load.active_tasks = load.active_tasks.saturating_sub(1);
        load.total_duration_ms += duration_ms;
        if success {
            load.completed += 1;
        } else {
            load.failed += 1;
        }
        debug!(task_id = %task_id, agent_id = %agent_id, success, duration_ms, "Task finished");
        drop(state);
        self.persist(&[task]).await;
        Ok(())
    }

    pub async fn task_for(&self, task_id: Uuid) -> Option<TaskAssignment> {
        self.state.read().await.assignments.get(&task_id).cloned()
    }

    /// Tasks currently bound to `agent_id`, oldest first.
    pub async fn tasks_for_agent(&self, agent_id: &str) -> Vec<WorkloadTask> {
        let state = self.state.read().await;
        let mut tasks: Vec<WorkloadTask> = state
            .assignments
            .values()
            .filter(|a| a.agent_id == agent_id)
            .map(|a| a.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub async fn agent_load(&self, agent_id: &str) -> Option<AgentLoad> {
        self.state.read().await.loads.get(agent_id).cloned()
    }

    /// Overrides a worker's load with an external sample.
    pub async fn update_agent_load(&self, agent_id: &str, load: f64) {
        let mut state = self.state.write().await;
        state.load_mut(agent_id).current_load = load.clamp(0.0, 100.0);
    }

    /// Classifies a resource sample and stores it for future scoring.
    pub async fn update_agent_health(&self, agent_id: &str, sample: HealthSample) -> HealthStatus {
        let status = sample.classify();
        let mut state = self.state.write().await;
        let load = state.load_mut(agent_id);
        load.cpu = Some(sample.cpu);
        load.memory = Some(sample.memory);
        load.latency_ms = sample.latency_ms;
        if load.health != status {
            info!(agent_id = %agent_id, from = %load.health, to = %status, "Worker health changed");
        }
        load.health = status;
        status
    }

    /// Moves pending tasks from overloaded to underloaded workers.
    ///
    /// A move never lifts a target above the mean load nor drops a source
    /// below it, so the spread between the busiest worker and the mean never grows.
    pub async fn rebalance_workload(&self) -> RebalanceReport {
        let agents: Vec<AgentInfo> = self
            .registry
            .list_agents()
            .await
            .into_iter()
            .filter(|a| a.status.is_reachable())
            .collect();
        if agents.len() < 2 {
            return RebalanceReport::default();
        }

        let mut state = self.state.write().await;
        let per_task = self.config.load_per_task;
        let mean =
            agents.iter().map(|a| state.load_of(&a.id)).sum::<f64>() / agents.len() as f64;

        let mut overloaded: Vec<&AgentInfo> = agents
            .iter()
            .filter(|a| state.load_of(&a.id) > mean + self.config.rebalance_margin)
            .collect();
        overloaded.sort_by(|a, b| state.load_of(&b.id).total_cmp(&state.load_of(&a.id)));
        let underloaded: Vec<&AgentInfo> = agents
            .iter()
            .filter(|a| state.load_of(&a.id) < mean - self.config.rebalance_margin)
            .collect();

        let mut report = RebalanceReport::default();
        if overloaded.is_empty() || underloaded.is_empty() {
            return report;
        }
        let mut moved = Vec::new();

        for source in overloaded {
            let excess = state.load_of(&source.id) - mean;
            let budget = (excess / self.config.rebalance_step.max(f64::EPSILON)).floor() as usize;

            let mut movable: Vec<WorkloadTask> = state
                .assignments
                .values()
                .filter(|a| a.agent_id == source.id && a.task.status == TaskStatus::Pending)
                .map(|a| a.task.clone())
                .collect();
            movable.sort_by(|a, b| a.priority.total_cmp(&b.priority));

            let mut moved_here = 0;
            for task in movable {
                if moved_here >= budget || state.load_of(&source.id) - per_task < mean {
                    break;
                }
                let target = underloaded
                    .iter()
                    .filter(|t| t.supports_all(&task.required_capabilities))
                    .filter(|t| state.load_of(&t.id) + per_task <= mean)
                    .min_by(|a, b| state.load_of(&a.id).total_cmp(&state.load_of(&b.id)));
                let Some(target) = target else {
                    continue;
                };

                if let Some(assignment) = state.assignments.get_mut(&task.id) {
                    assignment.agent_id = target.id.clone();
                    assignment.assigned_at = Utc::now();
                    assignment.task.assigned_agent = Some(target.id.clone());
                    moved.push(assignment.task.clone());
                }
                let from = state.load_mut(&source.id);
                from.add_load(-per_task);
                from.active_tasks = from.active_tasks.saturating_sub(1);
                let to = state.load_mut(&target.id);
                to.add_load(per_task);
                to.active_tasks += 1;

                moved_here += 1;
                report.tasks_moved += 1;
                if !report.sources.contains(&source.id) {
                    report.sources.push(source.id.clone());
                }
                if !report.targets.contains(&target.id) {
                    report.targets.push(target.id.clone());
                }
                info!(task_id = %task.id, from = %source.id, to = %target.id, "Task rebalanced");
                self.events.emit(OrchestrationEvent::TaskRebalanced {
                    task_id: task.id,
                    from_agent: source.id.clone(),
                    to_agent: target.id.clone(),
                });
            }
        }
        drop(state);
        self.persist(&moved).await;

        if report.tasks_moved > 0 {
            self.events.emit(OrchestrationEvent::RebalanceComplete {
                tasks_moved: report.tasks_moved,
                sources: report.sources.clone(),
                targets: report.targets.clone(),
            });
        }
        report
    }

    /// Spawns the periodic rebalancing loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.rebalance_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = self.rebalance_workload().await;
                if report.tasks_moved > 0 {
                    info!(moved = report.tasks_moved, "Periodic rebalance moved tasks");
                } else {
                    debug!("Periodic rebalance: nothing to move");
                }
            }
        })
    }
}

impl std::fmt::Debug for WorkloadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadBalancer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
