use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shared key/value context every step of a workflow can read.
pub type WorkflowContext = serde_json::Map<String, serde_json::Value>;

/// Runtime status of a workflow step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Overall status of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Gate deciding whether a step runs once its dependencies are done.
///
/// Serialized as `"always"`, `"on_success"`, `"on_failure"` or
/// `{"custom": "<expression>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    Always,
    OnSuccess,
    OnFailure,
    Custom(String),
}

impl StepCondition {
    /// Whether a step with this condition absorbs a failed dependency.
    pub fn handles_failure(&self) -> bool {
        matches!(
            self,
            StepCondition::Always | StepCondition::OnFailure | StepCondition::Custom(_)
        )
    }
}

/// One step as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Action to invoke on the selected worker.
    pub action: String,
    /// Pin the step to this worker instead of asking the registry.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Input template; `{{path}}` placeholders resolve against the context.
    #[serde(default = "empty_object")]
    pub input: serde_json::Value,
    /// Explicit dependencies. Empty means "the previous step".
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub condition: Option<StepCondition>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            action: action.into(),
            agent_id: None,
            input: empty_object(),
            dependencies: Vec::new(),
            condition: None,
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn pinned_to(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A workflow as submitted (usually parsed from JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
    /// Initial context values.
    #[serde(default)]
    pub context: WorkflowContext,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            steps,
            context: WorkflowContext::new(),
            due_at: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// A step inside a running or archived workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub action: String,
    pub agent_id: Option<String>,
    pub input: serde_json::Value,
    /// Effective dependencies, with the implicit sequential edge filled in.
    pub dependencies: Vec<String>,
    pub condition: Option<StepCondition>,
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
    /// Worker that ran the latest attempt.
    pub assigned_agent: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn from_definition(def: StepDefinition, dependencies: Vec<String>) -> Self {
        Self {
            name: def.name.unwrap_or_else(|| def.id.clone()),
            id: def.id,
            action: def.action,
            agent_id: def.agent_id,
            input: def.input,
            dependencies,
            condition: def.condition,
            status: StepStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
            assigned_agent: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Back to a never-run step.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.output = None;
        self.error = None;
        self.attempts = 0;
        self.assigned_agent = None;
        self.started_at = None;
        self.completed_at = None;
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Live or archived state of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    pub context: WorkflowContext,
    pub status: WorkflowStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Step ids grouped by status, for compact reporting.
    pub fn progress(&self) -> serde_json::Value {
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();
        serde_json::json!({
            "total": self.steps.len(),
            "pending": count(StepStatus::Pending),
            "running": count(StepStatus::Running),
            "completed": count(StepStatus::Completed),
            "failed": count(StepStatus::Failed),
            "skipped": count(StepStatus::Skipped),
        })
    }
}

/// A point-in-time deep copy of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Monotonic per workflow, starting at 1.
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    /// What mutation produced this copy (`submitted`, `step:completed`, ...).
    pub reason: String,
    pub state: WorkflowState,
}
