use crate::bus::MessageBus;
use crate::config::{RetryConfig, WorkflowConfig};
use crate::registry::AgentRegistry;
use crate::step_graph::StepGraph;
use crate::store::{HistoryEntry, WorkflowFilter, WorkflowStore};
use crate::template::{resolve_input, ConditionExpr, ConditionScope};
use crate::types::{
    StepCondition, StepStatus, WorkflowDefinition, WorkflowSnapshot, WorkflowState,
    WorkflowStatus, WorkflowStep,
};
use chrono::Utc;
use parking_lot::Mutex;
use recruitor_core::{
    EventHub, OrchestrationEvent, RecruitorError, RecruitorResult, RequestMessage,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sender identity the engine stamps on every step request.
pub const ENGINE_ID: &str = "workflow-engine";

/// Bounded, oldest-first history of deep copies for one workflow.
#[derive(Debug, Default)]
struct SnapshotRing {
    next_sequence: u64,
    items: VecDeque<WorkflowSnapshot>,
}

impl SnapshotRing {
    fn push(&mut self, reason: &str, state: &WorkflowState, cap: usize) {
        self.next_sequence += 1;
        self.items.push_back(WorkflowSnapshot {
            sequence: self.next_sequence,
            taken_at: Utc::now(),
            reason: reason.to_string(),
            state: state.clone(),
        });
        while self.items.len() > cap {
            self.items.pop_front();
        }
    }
}

struct ActiveWorkflow {
    state: WorkflowState,
    graph: StepGraph,
    conditions: HashMap<String, ConditionExpr>,
    cancel: watch::Sender<bool>,
    executing: bool,
}

impl ActiveWorkflow {
    fn new(state: WorkflowState, graph: StepGraph, conditions: HashMap<String, ConditionExpr>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            state,
            graph,
            conditions,
            cancel,
            executing: false,
        }
    }

    fn ensure_idle(&self, operation: &str) -> RecruitorResult<()> {
        if self.executing {
            return Err(RecruitorError::Workflow(format!(
                "Cannot {operation} workflow {} while it is executing",
                self.state.id
            )));
        }
        Ok(())
    }

    /// Most recent step error, by completion time.
    fn last_error(&self) -> Option<&str> {
        self.state
            .steps
            .iter()
            .filter(|s| s.error.is_some())
            .max_by_key(|s| s.completed_at)
            .and_then(|s| s.error.as_deref())
    }
}

#[derive(Default)]
struct EngineState {
    active: HashMap<Uuid, ActiveWorkflow>,
    snapshots: HashMap<Uuid, SnapshotRing>,
}

impl EngineState {
    fn snapshot(&mut self, id: Uuid, reason: &str, cap: usize) {
        if let Some(entry) = self.active.get(&id) {
            self.snapshots
                .entry(id)
                .or_default()
                .push(reason, &entry.state, cap);
        }
    }

    fn entry(&mut self, id: Uuid) -> RecruitorResult<&mut ActiveWorkflow> {
        self.active
            .get_mut(&id)
            .ok_or(RecruitorError::WorkflowNotFound(id))
    }
}

/// Whether a ready step runs, given its condition and its dependencies.
#[derive(Debug, PartialEq, Eq)]
enum Gate {
    Run,
    Skip(&'static str),
}

fn gate(
    condition: Option<&StepCondition>,
    expr: Option<&ConditionExpr>,
    scope: &ConditionScope<'_>,
) -> Gate {
    match condition {
        None | Some(StepCondition::OnSuccess) if scope.failed => Gate::Skip("dependency failed"),
        None | Some(StepCondition::OnSuccess) | Some(StepCondition::Always) => Gate::Run,
        Some(StepCondition::OnFailure) if scope.failed => Gate::Run,
        Some(StepCondition::OnFailure) => Gate::Skip("no dependency failed"),
        Some(StepCondition::Custom(_)) => {
            if expr.is_some_and(|e| e.evaluate(scope)) {
                Gate::Run
            } else {
                Gate::Skip("condition not met")
            }
        }
    }
}

fn parse_conditions(steps: &[WorkflowStep]) -> RecruitorResult<HashMap<String, ConditionExpr>> {
    let mut parsed = HashMap::new();
    for step in steps {
        if let Some(StepCondition::Custom(source)) = &step.condition {
            parsed.insert(step.id.clone(), ConditionExpr::parse(source)?);
        }
    }
    Ok(parsed)
}

fn failure_message(err: &RecruitorError) -> String {
    match err {
        RecruitorError::ActionFailed(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// A ready step, prepared for dispatch.
struct StepPlan {
    index: usize,
    step_id: String,
    action: String,
    pinned: Option<String>,
    input: Result<Value, String>,
}

enum Next {
    Done,
    Skipped,
    Run(StepPlan),
}

enum Outcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drives workflows step by step over the message bus.
///
/// Active workflows live in memory. Terminal ones are archived to the
/// [`WorkflowStore`] and come back into the active set on retry, rollback or
/// restore.
pub struct WorkflowEngine {
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    store: Arc<dyn WorkflowStore>,
    events: EventHub,
    config: WorkflowConfig,
    state: Mutex<EngineState>,
}

impl WorkflowEngine {
    pub fn new(
        bus: Arc<MessageBus>,
        registry: Arc<AgentRegistry>,
        store: Arc<dyn WorkflowStore>,
        events: EventHub,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            store,
            events,
            config,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    fn snapshot_cap(&self) -> usize {
        self.config.max_snapshots.max(1)
    }

    /// Validates a definition and stores it as a pending workflow.
    pub async fn submit(&self, definition: WorkflowDefinition) -> RecruitorResult<Uuid> {
        let graph = StepGraph::from_definitions(&definition.steps)?;
        let steps: Vec<WorkflowStep> = definition
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, def)| WorkflowStep::from_definition(def, graph.dependency_ids(i)))
            .collect();
        let conditions = parse_conditions(&steps)?;

        let state = WorkflowState {
            id: Uuid::new_v4(),
            name: definition.name,
            steps,
            context: definition.context,
            status: WorkflowStatus::Pending,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            due_at: definition.due_at,
        };
        let id = state.id;
        self.store.save(&state).await?;

        let mut inner = self.state.lock();
        inner
            .active
            .insert(id, ActiveWorkflow::new(state, graph, conditions));
        inner.snapshot(id, "submitted", self.snapshot_cap());
        drop(inner);

        info!(workflow_id = %id, "Workflow submitted");
        Ok(id)
    }

    /// Runs a submitted workflow until it completes, fails or is cancelled.
    pub async fn execute(&self, id: Uuid) -> RecruitorResult<WorkflowState> {
        self.drive(id, None).await
    }

    /// Submits and executes in one call.
    pub async fn run(&self, definition: WorkflowDefinition) -> RecruitorResult<WorkflowState> {
        let id = self.submit(definition).await?;
        self.execute(id).await
    }

    /// Looks in the active set first, then in the store.
    pub async fn get_workflow(&self, id: Uuid) -> RecruitorResult<WorkflowState> {
        if let Some(entry) = self.state.lock().active.get(&id) {
            return Ok(entry.state.clone());
        }
        self.store
            .get(id)
            .await?
            .ok_or(RecruitorError::WorkflowNotFound(id))
    }

    /// Non-archived workflows, oldest first.
    pub fn list_active(&self) -> Vec<WorkflowState> {
        let mut states: Vec<WorkflowState> = self
            .state
            .lock()
            .active
            .values()
            .map(|e| e.state.clone())
            .collect();
        states.sort_by_key(|s| s.created_at);
        states
    }

    /// Stored workflows matching `filter`.
    pub async fn history(&self, filter: &WorkflowFilter) -> RecruitorResult<Vec<WorkflowState>> {
        self.store.list(filter).await
    }

    /// Persistence history of one workflow.
    pub async fn workflow_history(&self, id: Uuid) -> RecruitorResult<Vec<HistoryEntry>> {
        self.store.history(id).await
    }

    pub fn snapshots(&self, id: Uuid) -> Vec<WorkflowSnapshot> {
        self.state
            .lock()
            .snapshots
            .get(&id)
            .map(|ring| ring.items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Resets one step and everything downstream of it, then re-drives the
    /// workflow, retrying that step with backoff.
    pub async fn retry_step(
        &self,
        id: Uuid,
        step_id: &str,
        config: Option<RetryConfig>,
    ) -> RecruitorResult<WorkflowState> {
        self.reactivate(id).await?;
        {
            let mut inner = self.state.lock();
            let entry = inner.entry(id)?;
            entry.ensure_idle("retry")?;
            let index = entry
                .state
                .step_index(step_id)
                .ok_or_else(|| RecruitorError::StepNotFound(step_id.to_string()))?;
            let reset = std::iter::once(index).chain(entry.graph.downstream(index));
            let state = &mut entry.state;
            for i in reset {
                let step = &mut state.steps[i];
                step.reset();
                state.context.remove(&step.id);
            }
            state.completed_at = None;
            state.status = WorkflowStatus::Pending;
            state.error = None;
            inner.snapshot(id, "retry:step", self.snapshot_cap());
        }
        info!(workflow_id = %id, step_id, "Retrying step");
        let retry = config.unwrap_or_else(|| self.config.retry.clone());
        self.drive(id, Some(retry)).await
    }

    /// Resets every failed and skipped step, plus whatever depends on them,
    /// and re-drives the workflow.
    /// A fully completed workflow is returned untouched.
    pub async fn retry_workflow(
        &self,
        id: Uuid,
        config: Option<RetryConfig>,
    ) -> RecruitorResult<WorkflowState> {
        let current = self.get_workflow(id).await?;
        if current
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Completed)
        {
            debug!(workflow_id = %id, "Retry skipped, every step completed");
            return Ok(current);
        }

        self.reactivate(id).await?;
        {
            let mut inner = self.state.lock();
            let entry = inner.entry(id)?;
            entry.ensure_idle("retry")?;
            let mut reset = vec![false; entry.state.steps.len()];
            for (i, step) in entry.state.steps.iter().enumerate() {
                if matches!(step.status, StepStatus::Failed | StepStatus::Skipped) {
                    reset[i] = true;
                    for d in entry.graph.downstream(i) {
                        reset[d] = true;
                    }
                }
            }
            let state = &mut entry.state;
            for (step, _) in state.steps.iter_mut().zip(&reset).filter(|(_, r)| **r) {
                step.reset();
                state.context.remove(&step.id);
            }
            state.completed_at = None;
            state.status = WorkflowStatus::Pending;
            state.error = None;
            inner.snapshot(id, "retry:workflow", self.snapshot_cap());
        }
        info!(workflow_id = %id, "Retrying workflow");
        let retry = config.unwrap_or_else(|| self.config.retry.clone());
        self.drive(id, Some(retry)).await
    }

    /// Resets every step declared after the rollback point and returns the
    /// point's id (the workflow id when nothing had completed).
    pub async fn rollback_workflow(
        &self,
        id: Uuid,
        to_step: Option<&str>,
        preserve_state: bool,
    ) -> RecruitorResult<String> {
        self.reactivate(id).await?;
        let mut inner = self.state.lock();
        let entry = inner.entry(id)?;
        entry.ensure_idle("roll back")?;
        let state = &mut entry.state;

        let point = match to_step {
            Some(step_id) => Some(
                state
                    .step_index(step_id)
                    .ok_or_else(|| RecruitorError::StepNotFound(step_id.to_string()))?,
            ),
            None => state
                .steps
                .iter()
                .rposition(|s| s.status == StepStatus::Completed),
        };
        let first_reset = point.map_or(0, |p| p + 1);
        for step in state.steps.iter_mut().skip(first_reset) {
            step.reset();
            state.context.remove(&step.id);
        }
        if !preserve_state {
            state.context.clear();
        }
        state.status = WorkflowStatus::Pending;
        state.error = None;
        state.completed_at = None;

        let point_id = match point {
            Some(p) => state.steps[p].id.clone(),
            None => id.to_string(),
        };
        inner.snapshot(id, "rollback", self.snapshot_cap());
        drop(inner);

        info!(workflow_id = %id, rollback_point = %point_id, preserve_state, "Workflow rolled back");
        Ok(point_id)
    }

    /// Replaces the live state with a snapshot copy. A copy taken while
    /// running comes back as pending.
    pub async fn restore_snapshot(&self, id: Uuid, sequence: u64) -> RecruitorResult<WorkflowState> {
        let snapshot = self
            .snapshots(id)
            .into_iter()
            .find(|s| s.sequence == sequence)
            .ok_or_else(|| {
                RecruitorError::Workflow(format!(
                    "Snapshot {sequence} not found for workflow {id}"
                ))
            })?;
        self.reactivate(id).await?;

        let mut inner = self.state.lock();
        let entry = inner.entry(id)?;
        entry.ensure_idle("restore")?;
        let mut state = snapshot.state;
        if state.status == WorkflowStatus::Running {
            state.status = WorkflowStatus::Pending;
        }
        for step in &mut state.steps {
            if step.status == StepStatus::Running {
                step.reset();
            }
        }
        entry.state = state.clone();
        inner.snapshot(id, &format!("restored:{sequence}"), self.snapshot_cap());
        drop(inner);

        info!(workflow_id = %id, sequence, "Workflow restored from snapshot");
        Ok(state)
    }

    /// Signals an executing workflow to stop before its next step, or
    /// cancels a pending one on the spot.
    pub async fn cancel_workflow(&self, id: Uuid) -> RecruitorResult<()> {
        let executing = self.state.lock().active.get(&id).map(|entry| {
            if entry.executing {
                entry.cancel.send_replace(true);
            }
            entry.executing
        });
        let Some(executing) = executing else {
            let archived = self
                .store
                .get(id)
                .await?
                .ok_or(RecruitorError::WorkflowNotFound(id))?;
            return Err(RecruitorError::Workflow(format!(
                "Workflow {id} is already {}",
                archived.status
            )));
        };
        if executing {
            info!(workflow_id = %id, "Cancellation requested");
        } else {
            self.finish(id, WorkflowStatus::Cancelled, None).await?;
        }
        Ok(())
    }

    /// Brings an archived workflow back into the active set.
    async fn reactivate(&self, id: Uuid) -> RecruitorResult<()> {
        if self.state.lock().active.contains_key(&id) {
            return Ok(());
        }
        let state = self
            .store
            .get(id)
            .await?
            .ok_or(RecruitorError::WorkflowNotFound(id))?;
        let graph = StepGraph::from_steps(&state.steps)?;
        let conditions = parse_conditions(&state.steps)?;
        self.state
            .lock()
            .active
            .entry(id)
            .or_insert_with(|| ActiveWorkflow::new(state, graph, conditions));
        debug!(workflow_id = %id, "Workflow reactivated from store");
        Ok(())
    }

    async fn drive(&self, id: Uuid, retry: Option<RetryConfig>) -> RecruitorResult<WorkflowState> {
        let mut cancel_rx = {
            let mut inner = self.state.lock();
            let entry = inner.entry(id)?;
            if entry.executing {
                return Err(RecruitorError::Workflow(format!(
                    "Workflow {id} is already executing"
                )));
            }
            if entry.state.status.is_terminal() {
                return Err(RecruitorError::Workflow(format!(
                    "Workflow {id} is already {}",
                    entry.state.status
                )));
            }
            entry.executing = true;
            let (tx, rx) = watch::channel(false);
            entry.cancel = tx;
            let state = &mut entry.state;
            state.status = WorkflowStatus::Running;
            state.error = None;
            state.completed_at = None;
            state.started_at.get_or_insert_with(Utc::now);
            let name = state.name.clone();
            inner.snapshot(id, "started", self.snapshot_cap());
            self.events.emit(OrchestrationEvent::WorkflowStarted {
                workflow_id: id,
                name: name.clone(),
            });
            info!(workflow_id = %id, name = %name, "Workflow started");
            rx
        };

        loop {
            if *cancel_rx.borrow() {
                return self.finish(id, WorkflowStatus::Cancelled, None).await;
            }
            let next = self.next_step(id)?;
            let plan = match next {
                Next::Done => return self.finish(id, WorkflowStatus::Completed, None).await,
                Next::Skipped => continue,
                Next::Run(plan) => plan,
            };

            match self.run_step(id, &plan, retry.as_ref(), &mut cancel_rx).await {
                Outcome::Completed(output) => self.record_success(id, &plan, output)?,
                Outcome::Cancelled => {
                    if let Some(entry) = self.state.lock().active.get_mut(&id) {
                        entry.state.steps[plan.index].reset();
                    }
                    return self.finish(id, WorkflowStatus::Cancelled, None).await;
                }
                Outcome::Failed(message) => {
                    if !self.record_failure(id, &plan, &message)? {
                        let error = format!("Step '{}' failed: {message}", plan.step_id);
                        return self.finish(id, WorkflowStatus::Failed, Some(error)).await;
                    }
                }
            }
        }
    }

    /// Picks the first ready step. Gated-out steps are skipped here.
    fn next_step(&self, id: Uuid) -> RecruitorResult<Next> {
        let cap = self.snapshot_cap();
        let mut inner = self.state.lock();
        let entry = inner.entry(id)?;
        let Some(&index) = entry.graph.ready(&entry.state.steps).first() else {
            return Ok(Next::Done);
        };

        let scope = ConditionScope {
            context: &entry.state.context,
            last_error: entry.last_error(),
            failed: entry.graph.any_dependency_failed(&entry.state.steps, index),
        };
        let step = &entry.state.steps[index];
        let decision = gate(
            step.condition.as_ref(),
            entry.conditions.get(&step.id),
            &scope,
        );

        if let Gate::Skip(reason) = decision {
            let step = &mut entry.state.steps[index];
            step.status = StepStatus::Skipped;
            step.completed_at = Some(Utc::now());
            let step_id = step.id.clone();
            inner.snapshot(id, "step:skipped", cap);
            self.events.emit(OrchestrationEvent::StepSkipped {
                workflow_id: id,
                step_id: step_id.clone(),
                reason: reason.to_string(),
            });
            debug!(workflow_id = %id, step_id = %step_id, reason, "Step skipped");
            return Ok(Next::Skipped);
        }

        let input = resolve_input(&step.input, &entry.state.context).map_err(|e| e.to_string());
        Ok(Next::Run(StepPlan {
            index,
            step_id: step.id.clone(),
            action: step.action.clone(),
            pinned: step.agent_id.clone(),
            input,
        }))
    }

    async fn run_step(
        &self,
        id: Uuid,
        plan: &StepPlan,
        retry: Option<&RetryConfig>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let input = match &plan.input {
            Ok(input) => input,
            Err(message) => {
                self.mark_attempt(id, plan, None);
                return Outcome::Failed(message.clone());
            }
        };

        let max_attempts = retry.map_or(1, |r| r.max_attempts.max(1));
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            let delay = retry.map_or(Duration::ZERO, |r| r.delay_before(attempt));
            if !delay.is_zero() {
                tokio::select! {
                    _ = wait_cancelled(cancel_rx) => return Outcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if *cancel_rx.borrow() {
                return Outcome::Cancelled;
            }

            let result = tokio::select! {
                _ = wait_cancelled(cancel_rx) => return Outcome::Cancelled,
                result = self.attempt(id, plan, input.clone()) => result,
            };
            match result {
                Ok(output) => return Outcome::Completed(output),
                Err(err) => {
                    last_error = failure_message(&err);
                    if attempt < max_attempts {
                        warn!(
                            workflow_id = %id,
                            step_id = %plan.step_id,
                            attempt,
                            error = %err,
                            "Step attempt failed, retrying"
                        );
                    }
                }
            }
        }
        Outcome::Failed(last_error)
    }

    async fn attempt(&self, id: Uuid, plan: &StepPlan, input: Value) -> RecruitorResult<Value> {
        let agent_id = match &plan.pinned {
            Some(agent_id) => Some(agent_id.clone()),
            None => self
                .registry
                .get_best_agent_for_capability(&plan.action)
                .await
                .map(|info| info.id),
        };
        self.mark_attempt(id, plan, agent_id.as_deref());
        let Some(agent_id) = agent_id else {
            return Err(RecruitorError::NoEligibleWorker(format!(
                "no worker offers action '{}'",
                plan.action
            )));
        };

        self.events.emit(OrchestrationEvent::StepStarted {
            workflow_id: id,
            step_id: plan.step_id.clone(),
            agent_id: agent_id.clone(),
        });
        debug!(workflow_id = %id, step_id = %plan.step_id, agent_id = %agent_id, "Dispatching step");

        let request = RequestMessage::new(ENGINE_ID, agent_id, plan.action.clone(), input)
            .with_timeout(self.config.step_timeout_ms);
        self.bus.send_request(request).await?.into_result()
    }

    fn mark_attempt(&self, id: Uuid, plan: &StepPlan, agent_id: Option<&str>) {
        let mut inner = self.state.lock();
        let Some(entry) = inner.active.get_mut(&id) else {
            return;
        };
        let step = &mut entry.state.steps[plan.index];
        step.status = StepStatus::Running;
        step.attempts += 1;
        step.assigned_agent = agent_id.map(str::to_string);
        step.started_at = Some(Utc::now());
        step.completed_at = None;
        inner.snapshot(id, "step:started", self.snapshot_cap());
    }

    fn record_success(&self, id: Uuid, plan: &StepPlan, output: Value) -> RecruitorResult<()> {
        let mut inner = self.state.lock();
        let state = &mut inner.entry(id)?.state;
        let step = &mut state.steps[plan.index];
        step.status = StepStatus::Completed;
        step.output = Some(output.clone());
        step.error = None;
        step.completed_at = Some(Utc::now());
        let duration_ms = step.duration_ms().unwrap_or(0);
        state.context.insert(plan.step_id.clone(), output);
        inner.snapshot(id, "step:completed", self.snapshot_cap());

        self.events.emit(OrchestrationEvent::StepCompleted {
            workflow_id: id,
            step_id: plan.step_id.clone(),
            duration_ms,
        });
        debug!(workflow_id = %id, step_id = %plan.step_id, duration_ms, "Step completed");
        Ok(())
    }

    /// Returns whether a dependent step absorbs the failure.
    fn record_failure(&self, id: Uuid, plan: &StepPlan, message: &str) -> RecruitorResult<bool> {
        let mut inner = self.state.lock();
        let entry = inner.entry(id)?;
        let step = &mut entry.state.steps[plan.index];
        step.status = StepStatus::Failed;
        step.output = None;
        step.error = Some(message.to_string());
        step.completed_at = Some(Utc::now());
        let handled = entry.graph.failure_handled(&entry.state.steps, plan.index);
        inner.snapshot(id, "step:failed", self.snapshot_cap());

        self.events.emit(OrchestrationEvent::StepFailed {
            workflow_id: id,
            step_id: plan.step_id.clone(),
            error: message.to_string(),
        });
        warn!(workflow_id = %id, step_id = %plan.step_id, error = %message, handled, "Step failed");
        Ok(handled)
    }

    /// Moves a workflow to a terminal status and archives it.
    async fn finish(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> RecruitorResult<WorkflowState> {
        let state = {
            let mut inner = self.state.lock();
            let mut entry = inner
                .active
                .remove(&id)
                .ok_or(RecruitorError::WorkflowNotFound(id))?;
            entry.state.status = status;
            entry.state.error = error.clone();
            entry.state.completed_at = Some(Utc::now());
            inner
                .snapshots
                .entry(id)
                .or_default()
                .push(&status.to_string(), &entry.state, self.snapshot_cap());
            entry.state
        };

        let event = match status {
            WorkflowStatus::Completed => OrchestrationEvent::WorkflowCompleted {
                workflow_id: id,
                duration_ms: state.duration_ms(),
            },
            WorkflowStatus::Cancelled => OrchestrationEvent::WorkflowCancelled { workflow_id: id },
            _ => OrchestrationEvent::WorkflowFailed {
                workflow_id: id,
                error: error.unwrap_or_default(),
            },
        };
        self.events.emit(event);
        info!(
            workflow_id = %id,
            status = %status,
            duration_ms = state.duration_ms(),
            "Workflow finished"
        );

        match self.store.update(&state).await {
            Err(RecruitorError::WorkflowNotFound(_)) => self.store.save(&state).await?,
            other => other?,
        }
        Ok(state)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::runtime::{Agent, AgentRuntime};
    use crate::store::InMemoryWorkflowStore;
    use crate::types::StepDefinition;
    use async_trait::async_trait;
    use recruitor_core::{Action, ActionSet, AgentDescriptor, Contract};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Pipeline {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for Pipeline {
        fn descriptor(&self) -> AgentDescriptor {
            AgentDescriptor::new("pipeline-1", "Pipeline worker", "pipeline")
        }

        fn actions(&self) -> ActionSet {
            let counted = |name: &'static str| {
                let calls = Arc::clone(&self.calls);
                Action::from_fn(name, Contract::any(), Contract::any(), move |payload| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(json!({"step": name, "input": payload})) }
                })
            };
            let calls = Arc::clone(&self.calls);
            ActionSet::new()
                .with(counted("search"))
                .with(counted("score"))
                .with(counted("notify"))
                .with(Action::from_fn(
                    "fail",
                    Contract::any(),
                    Contract::any(),
                    move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async move { Err(RecruitorError::ActionFailed("board offline".into())) }
                    },
                ))
                .with(Action::from_fn(
                    "slow",
                    Contract::any(),
                    Contract::any(),
                    |_| async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(json!("late"))
                    },
                ))
        }
    }

    struct Env {
        engine: Arc<WorkflowEngine>,
        calls: Arc<AtomicUsize>,
        _runtime: AgentRuntime,
    }

    async fn env(config: WorkflowConfig) -> Env {
        let events = EventHub::new(256);
        let registry = Arc::new(AgentRegistry::new(events.clone()));
        let bus = Arc::new(MessageBus::new(events.clone()).with_registry(Arc::clone(&registry)));
        let calls = Arc::new(AtomicUsize::new(0));
        let runtime = AgentRuntime::new(
            Arc::new(Pipeline {
                calls: Arc::clone(&calls),
            }),
            Arc::clone(&bus),
            Arc::clone(&registry),
        );
        runtime.initialize().await.unwrap();
        let engine = Arc::new(WorkflowEngine::new(
            bus,
            registry,
            Arc::new(InMemoryWorkflowStore::new()),
            events,
            config,
        ));
        Env {
            engine,
            calls,
            _runtime: runtime,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            backoff_ms: 1,
            backoff_multiplier: 1.0,
        }
    }

    #[test]
    fn test_gate_table() {
        let context = serde_json::Map::new();
        let ok = ConditionScope {
            context: &context,
            last_error: None,
            failed: false,
        };
        let failed = ConditionScope { failed: true, ..ok };
        assert_eq!(gate(None, None, &ok), Gate::Run);
        assert_eq!(gate(None, None, &failed), Gate::Skip("dependency failed"));
        assert_eq!(gate(Some(&StepCondition::Always), None, &failed), Gate::Run);
        assert_eq!(
            gate(Some(&StepCondition::OnSuccess), None, &failed),
            Gate::Skip("dependency failed")
        );
        assert_eq!(
            gate(Some(&StepCondition::OnFailure), None, &ok),
            Gate::Skip("no dependency failed")
        );
        assert_eq!(gate(Some(&StepCondition::OnFailure), None, &failed), Gate::Run);

        let custom = StepCondition::Custom("failed".into());
        let expr = ConditionExpr::parse("failed").unwrap();
        assert_eq!(gate(Some(&custom), Some(&expr), &failed), Gate::Run);
        assert_eq!(
            gate(Some(&custom), Some(&expr), &ok),
            Gate::Skip("condition not met")
        );
    }

    #[test]
    fn test_snapshot_ring_evicts_oldest() {
        let state = WorkflowState {
            id: Uuid::new_v4(),
            name: "ring".into(),
            steps: Vec::new(),
            context: serde_json::Map::new(),
            status: WorkflowStatus::Pending,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            due_at: None,
        };
        let mut ring = SnapshotRing::default();
        for _ in 0..5 {
            ring.push("tick", &state, 3);
        }
        let sequences: Vec<u64> = ring.items.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_placeholders_flow_between_steps() {
        let env = env(WorkflowConfig::default()).await;
        let def = WorkflowDefinition::new(
            "sourcing",
            vec![
                StepDefinition::new("search", "search").with_input(json!({"query": "{{role}}"})),
                StepDefinition::new("score", "score")
                    .with_input(json!({"from": "{{search.step}}", "label": "top {{role}}"})),
            ],
        )
        .with_context("role", json!("rust engineer"));

        let state = env.engine.run(def).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.context["search"]["input"]["query"], "rust engineer");
        assert_eq!(state.context["score"]["input"]["from"], "search");
        assert_eq!(state.context["score"]["input"]["label"], "top rust engineer");
        assert!(env.engine.list_active().is_empty());
        assert_eq!(
            env.engine.get_workflow(state.id).await.unwrap().status,
            WorkflowStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_unresolved_placeholder_fails_step() {
        let env = env(WorkflowConfig::default()).await;
        let def = WorkflowDefinition::new(
            "broken-input",
            vec![StepDefinition::new("search", "search").with_input(json!({"q": "{{missing}}"}))],
        );
        let state = env.engine.run(def).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.error.unwrap().starts_with("Step 'search' failed: Invalid input"));
        assert_eq!(env.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unhandled_failure_halts_graph() {
        let env = env(WorkflowConfig::default()).await;
        let def = WorkflowDefinition::new(
            "halt",
            vec![
                StepDefinition::new("search", "search"),
                StepDefinition::new("fetch", "fail"),
                StepDefinition::new("score", "score"),
            ],
        );
        let state = env.engine.run(def).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(
            state.error.as_deref(),
            Some("Step 'fetch' failed: Action failed: board offline")
        );
        assert_eq!(state.step("score").unwrap().status, StepStatus::Pending);
        assert_eq!(state.step("fetch").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_on_failure_branch_and_custom_condition() {
        let env = env(WorkflowConfig::default()).await;
        let def = WorkflowDefinition::new(
            "branching",
            vec![
                StepDefinition::new("fetch", "fail"),
                StepDefinition::new("fallback", "notify")
                    .depends_on(&["fetch"])
                    .with_condition(StepCondition::OnFailure),
                StepDefinition::new("happy", "score")
                    .depends_on(&["fetch"])
                    .with_condition(StepCondition::OnSuccess),
                StepDefinition::new("vip", "score")
                    .depends_on(&["fallback"])
                    .with_condition(StepCondition::Custom("tier == \"gold\"".into())),
                StepDefinition::new("bronze", "score")
                    .depends_on(&["fallback"])
                    .with_condition(StepCondition::Custom("tier == \"bronze\"".into())),
            ],
        )
        .with_context("tier", json!("gold"));

        let state = env.engine.run(def).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.step("fetch").unwrap().status, StepStatus::Failed);
        assert_eq!(state.step("fallback").unwrap().status, StepStatus::Completed);
        assert_eq!(state.step("happy").unwrap().status, StepStatus::Skipped);
        assert_eq!(state.step("vip").unwrap().status, StepStatus::Completed);
        assert_eq!(state.step("bronze").unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_invalid_definitions_rejected_at_submit() {
        let env = env(WorkflowConfig::default()).await;
        let cycle = WorkflowDefinition::new(
            "cycle",
            vec![
                StepDefinition::new("a", "search").depends_on(&["b"]),
                StepDefinition::new("b", "search").depends_on(&["a"]),
            ],
        );
        assert!(matches!(
            env.engine.submit(cycle).await,
            Err(RecruitorError::Workflow(_))
        ));

        let bad_condition = WorkflowDefinition::new(
            "bad",
            vec![StepDefinition::new("a", "search")
                .with_condition(StepCondition::Custom("score >".into()))],
        );
        assert!(env.engine.submit(bad_condition).await.is_err());
        assert!(env.engine.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_missing_worker_fails_with_no_eligible_worker() {
        let env = env(WorkflowConfig::default()).await;
        let def = WorkflowDefinition::new("orphan", vec![StepDefinition::new("call", "phone")]);
        let state = env.engine.run(def).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.error.as_ref().unwrap().contains("No eligible worker"));
        assert!(state.step("call").unwrap().assigned_agent.is_none());
    }

    #[tokio::test]
    async fn test_retry_step_reruns_with_backoff() {
        let env = env(WorkflowConfig::default()).await;
        let def = WorkflowDefinition::new(
            "retry",
            vec![StepDefinition::new("search", "search"), StepDefinition::new("fetch", "fail")],
        );
        let failed = env.engine.run(def).await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        let calls_before = env.calls.load(Ordering::SeqCst);

        let retried = env
            .engine
            .retry_step(failed.id, "fetch", Some(fast_retry()))
            .await
            .unwrap();
        assert_eq!(retried.status, WorkflowStatus::Failed);
        assert_eq!(retried.step("fetch").unwrap().attempts, 2);
        assert_eq!(retried.step("search").unwrap().status, StepStatus::Completed);
        assert_eq!(env.calls.load(Ordering::SeqCst), calls_before + 2);

        let err = env.engine.retry_step(failed.id, "ghost", None).await.unwrap_err();
        assert!(matches!(err, RecruitorError::StepNotFound(_)));
    }

    #[tokio::test]
    async fn test_rollback_defaults_to_last_completed_step() {
        let env = env(WorkflowConfig::default()).await;
        let def = WorkflowDefinition::new(
            "rollback",
            vec![
                StepDefinition::new("search", "search"),
                StepDefinition::new("fetch", "fail"),
                StepDefinition::new("score", "score"),
            ],
        )
        .with_context("role", json!("sre"));
        let state = env.engine.run(def).await.unwrap();

        let point = env.engine.rollback_workflow(state.id, None, true).await.unwrap();
        assert_eq!(point, "search");
        let rolled = env.engine.get_workflow(state.id).await.unwrap();
        assert_eq!(rolled.status, WorkflowStatus::Pending);
        assert!(rolled.error.is_none());
        assert_eq!(rolled.step("fetch").unwrap().status, StepStatus::Pending);
        assert!(rolled.step("fetch").unwrap().error.is_none());
        assert!(rolled.context.contains_key("search"));
        assert_eq!(rolled.context["role"], "sre");

        let point = env.engine.rollback_workflow(state.id, None, false).await.unwrap();
        assert_eq!(point, "search");
        assert!(env.engine.get_workflow(state.id).await.unwrap().context.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_with_nothing_completed_returns_workflow_id() {
        let env = env(WorkflowConfig::default()).await;
        let id = env
            .engine
            .submit(WorkflowDefinition::new("fresh", vec![StepDefinition::new("a", "search")]))
            .await
            .unwrap();
        let point = env.engine.rollback_workflow(id, None, true).await.unwrap();
        assert_eq!(point, id.to_string());

        let err = env
            .engine
            .rollback_workflow(Uuid::new_v4(), None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, RecruitorError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_snapshots_capped_and_restorable() {
        let config = WorkflowConfig {
            max_snapshots: 4,
            ..WorkflowConfig::default()
        };
        let env = env(config).await;
        let def = WorkflowDefinition::new(
            "snap",
            vec![
                StepDefinition::new("a", "search"),
                StepDefinition::new("b", "score"),
                StepDefinition::new("c", "notify"),
            ],
        );
        let state = env.engine.run(def).await.unwrap();
        let snapshots = env.engine.snapshots(state.id);
        assert_eq!(snapshots.len(), 4);
        assert!(snapshots.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(snapshots.last().unwrap().state.status, WorkflowStatus::Completed);

        let running = snapshots
            .iter()
            .find(|s| s.state.status == WorkflowStatus::Running)
            .unwrap();
        let restored = env
            .engine
            .restore_snapshot(state.id, running.sequence)
            .await
            .unwrap();
        assert_eq!(restored.status, WorkflowStatus::Pending);
        assert!(restored.steps.iter().all(|s| s.status != StepStatus::Running));

        let err = env.engine.restore_snapshot(state.id, 999).await.unwrap_err();
        assert!(err.to_string().contains("Snapshot 999 not found"));
    }

    #[tokio::test]
    async fn test_cancel_executing_workflow() {
        let env = env(WorkflowConfig::default()).await;
        let id = env
            .engine
            .submit(WorkflowDefinition::new(
                "cancel",
                vec![StepDefinition::new("wait", "slow"), StepDefinition::new("after", "search")],
            ))
            .await
            .unwrap();

        let engine = Arc::clone(&env.engine);
        let handle = tokio::spawn(async move { engine.execute(id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        env.engine.cancel_workflow(id).await.unwrap();

        let state = handle.await.unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Cancelled);
        assert_eq!(state.step("wait").unwrap().status, StepStatus::Pending);
        assert_eq!(state.step("after").unwrap().status, StepStatus::Pending);
        assert_eq!(env.calls.load(Ordering::SeqCst), 0);

        let err = env.engine.cancel_workflow(id).await.unwrap_err();
        assert!(err.to_string().contains("already cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_pending_workflow() {
        let env = env(WorkflowConfig::default()).await;
        let id = env
            .engine
            .submit(WorkflowDefinition::new("idle", vec![StepDefinition::new("a", "search")]))
            .await
            .unwrap();
        env.engine.cancel_workflow(id).await.unwrap();
        let state = env.engine.get_workflow(id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Cancelled);
        assert!(env.engine.list_active().is_empty());
        assert_eq!(env.engine.workflow_history(id).await.unwrap().len(), 2);
    }
}
