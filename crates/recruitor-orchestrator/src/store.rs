use crate::balancer::{TaskStatus, WorkloadTask};
use crate::types::{WorkflowState, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recruitor_core::{RecruitorError, RecruitorResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Selects workflows by status and creation window (both bounds inclusive).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl WorkflowFilter {
    pub fn with_status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, state: &WorkflowState) -> bool {
        self.status.map_or(true, |s| s == state.status)
            && in_window(state.created_at, self.created_after, self.created_before)
    }
}

/// Selects tasks by status, bound worker and creation window (both bounds
/// inclusive).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    /// Tasks bound to one worker.
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &WorkloadTask) -> bool {
        self.status.map_or(true, |s| s == task.status)
            && self
                .agent_id
                .as_deref()
                .map_or(true, |id| task.assigned_agent.as_deref() == Some(id))
            && in_window(task.created_at, self.created_after, self.created_before)
    }
}

fn in_window(at: DateTime<Utc>, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> bool {
    after.map_or(true, |a| at >= a) && before.map_or(true, |b| at <= b)
}

/// Store ordering: oldest first, ties by due date with undated entries last.
fn listing_order(
    a: (DateTime<Utc>, Option<DateTime<Utc>>),
    b: (DateTime<Utc>, Option<DateTime<Utc>>),
) -> Ordering {
    a.0.cmp(&b.0).then_with(|| match (a.1, b.1) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    })
}

fn sort_workflows(states: &mut [WorkflowState]) {
    states.sort_by(|a, b| listing_order((a.created_at, a.due_at), (b.created_at, b.due_at)));
}

fn sort_tasks(tasks: &mut [WorkloadTask]) {
    tasks.sort_by(|a, b| listing_order((a.created_at, a.due_at), (b.created_at, b.due_at)));
}

/// What happened to a stored workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Saved,
    Updated,
    Deleted,
}

/// One line of a workflow's persistence history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub workflow_id: Uuid,
    pub action: HistoryAction,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    fn record(state: &WorkflowState, action: HistoryAction) -> Self {
        Self {
            workflow_id: state.id,
            action,
            status: state.status,
            error: state.error.clone(),
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Inserts or replaces.
    async fn save(&self, state: &WorkflowState) -> RecruitorResult<()>;
    async fn get(&self, id: Uuid) -> RecruitorResult<Option<WorkflowState>>;
    /// Replaces an existing workflow; unknown ids are an error.
    async fn update(&self, state: &WorkflowState) -> RecruitorResult<()>;
    async fn delete(&self, id: Uuid) -> RecruitorResult<bool>;
    async fn list(&self, filter: &WorkflowFilter) -> RecruitorResult<Vec<WorkflowState>>;
    async fn history(&self, id: Uuid) -> RecruitorResult<Vec<HistoryEntry>>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, task: &WorkloadTask) -> RecruitorResult<()>;
    async fn get(&self, id: Uuid) -> RecruitorResult<Option<WorkloadTask>>;
    async fn update(&self, task: &WorkloadTask) -> RecruitorResult<()>;
    async fn delete(&self, id: Uuid) -> RecruitorResult<bool>;
    async fn list(&self, filter: &TaskFilter) -> RecruitorResult<Vec<WorkloadTask>>;
}

/// Workflow store kept in process memory.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    states: RwLock<HashMap<Uuid, WorkflowState>>,
    history: RwLock<Vec<HistoryEntry>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn save(&self, state: &WorkflowState) -> RecruitorResult<()> {
        self.states.write().await.insert(state.id, state.clone());
        self.history
            .write()
            .await
            .push(HistoryEntry::record(state, HistoryAction::Saved));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RecruitorResult<Option<WorkflowState>> {
        Ok(self.states.read().await.get(&id).cloned())
    }

    async fn update(&self, state: &WorkflowState) -> RecruitorResult<()> {
        let mut states = self.states.write().await;
        let slot = states
            .get_mut(&state.id)
            .ok_or(RecruitorError::WorkflowNotFound(state.id))?;
        *slot = state.clone();
        drop(states);
        self.history
            .write()
            .await
            .push(HistoryEntry::record(state, HistoryAction::Updated));
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> RecruitorResult<bool> {
        let removed = self.states.write().await.remove(&id);
        if let Some(state) = &removed {
            self.history
                .write()
                .await
                .push(HistoryEntry::record(state, HistoryAction::Deleted));
        }
        Ok(removed.is_some())
    }

    async fn list(&self, filter: &WorkflowFilter) -> RecruitorResult<Vec<WorkflowState>> {
        let mut states: Vec<WorkflowState> = self
            .states
            .read()
            .await
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sort_workflows(&mut states);
        Ok(states)
    }

    async fn history(&self, id: Uuid) -> RecruitorResult<Vec<HistoryEntry>> {
        Ok(self
            .history
            .read()
            .await
            .iter()
            .filter(|e| e.workflow_id == id)
            .cloned()
            .collect())
    }
}

/// File-based workflow store: one JSON file per workflow plus an
/// append-only `history.jsonl`.
pub struct FileWorkflowStore {
    dir: PathBuf,
}

impl FileWorkflowStore {
    pub async fn new(dir: PathBuf) -> RecruitorResult<Self> {
        tokio::fs::create_dir_all(dir.join("workflows")).await?;
        Ok(Self { dir })
    }

    fn workflow_path(&self, id: Uuid) -> PathBuf {
        self.dir.join("workflows").join(format!("{id}.json"))
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join("history.jsonl")
    }

    async fn write_state(&self, state: &WorkflowState) -> RecruitorResult<()> {
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(self.workflow_path(state.id), json).await?;
        Ok(())
    }

    async fn append_history(&self, entry: &HistoryEntry) -> RecruitorResult<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_state(&self, path: PathBuf) -> RecruitorResult<WorkflowState> {
        let data = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&data).map_err(|e| {
            RecruitorError::Store(format!(
                "Failed to parse workflow file '{}': {e}",
                path.display()
            ))
        })
    }
}

#[async_trait]
impl WorkflowStore for FileWorkflowStore {
    async fn save(&self, state: &WorkflowState) -> RecruitorResult<()> {
        self.write_state(state).await?;
        self.append_history(&HistoryEntry::record(state, HistoryAction::Saved))
            .await
    }

    async fn get(&self, id: Uuid) -> RecruitorResult<Option<WorkflowState>> {
        let path = self.workflow_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        self.read_state(path).await.map(Some)
    }

    async fn update(&self, state: &WorkflowState) -> RecruitorResult<()> {
        if !tokio::fs::try_exists(self.workflow_path(state.id)).await? {
            return Err(RecruitorError::WorkflowNotFound(state.id));
        }
        self.write_state(state).await?;
        self.append_history(&HistoryEntry::record(state, HistoryAction::Updated))
            .await
    }

    async fn delete(&self, id: Uuid) -> RecruitorResult<bool> {
        let Some(state) = self.get(id).await? else {
            return Ok(false);
        };
        tokio::fs::remove_file(self.workflow_path(id)).await?;
        self.append_history(&HistoryEntry::record(&state, HistoryAction::Deleted))
            .await?;
        Ok(true)
    }

    async fn list(&self, filter: &WorkflowFilter) -> RecruitorResult<Vec<WorkflowState>> {
        let mut entries = tokio::fs::read_dir(self.dir.join("workflows")).await?;
        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_json = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(".json"));
            if !is_json {
                continue;
            }
            let state = self.read_state(entry.path()).await?;
            if filter.matches(&state) {
                states.push(state);
            }
        }
        sort_workflows(&mut states);
        Ok(states)
    }

    async fn history(&self, id: Uuid) -> RecruitorResult<Vec<HistoryEntry>> {
        let path = self.history_path();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(path).await?;
        let mut entries = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let entry: HistoryEntry = serde_json::from_str(line)
                .map_err(|e| RecruitorError::Store(format!("Corrupt history line: {e}")))?;
            if entry.workflow_id == id {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

/// Task store kept in process memory.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, WorkloadTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &WorkloadTask) -> RecruitorResult<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> RecruitorResult<Option<WorkloadTask>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update(&self, task: &WorkloadTask) -> RecruitorResult<()> {
        let mut tasks = self.tasks.write().await;
        let slot = tasks
            .get_mut(&task.id)
            .ok_or(RecruitorError::TaskNotFound(task.id))?;
        *slot = task.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> RecruitorResult<bool> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }

    async fn list(&self, filter: &TaskFilter) -> RecruitorResult<Vec<WorkloadTask>> {
        let mut tasks: Vec<WorkloadTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        sort_tasks(&mut tasks);
        Ok(tasks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::WorkflowContext;
    use chrono::Duration;
    use serde_json::json;

    fn state(name: &str, created_at: DateTime<Utc>, status: WorkflowStatus) -> WorkflowState {
        WorkflowState {
            id: Uuid::new_v4(),
            name: name.to_string(),
            steps: Vec::new(),
            context: WorkflowContext::new(),
            status,
            error: None,
            created_at,
            started_at: None,
            completed_at: None,
            due_at: None,
        }
    }

    #[test]
    fn test_listing_order_nulls_last() {
        let t = Utc::now();
        let due = Some(t + Duration::hours(1));
        assert_eq!(listing_order((t, due), (t, None)), Ordering::Less);
        assert_eq!(listing_order((t, None), (t, due)), Ordering::Greater);
        assert_eq!(
            listing_order((t + Duration::seconds(1), due), (t, None)),
            Ordering::Greater
        );
    }

    #[tokio::test]
    async fn test_in_memory_crud_and_history() {
        let store = InMemoryWorkflowStore::new();
        let mut wf = state("outreach", Utc::now(), WorkflowStatus::Running);
        store.save(&wf).await.unwrap();
        wf.status = WorkflowStatus::Completed;
        store.update(&wf).await.unwrap();

        assert_eq!(store.get(wf.id).await.unwrap().unwrap().status, WorkflowStatus::Completed);
        assert!(store.delete(wf.id).await.unwrap());
        assert!(!store.delete(wf.id).await.unwrap());
        assert!(store.get(wf.id).await.unwrap().is_none());

        let actions: Vec<HistoryAction> =
            store.history(wf.id).await.unwrap().iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![HistoryAction::Saved, HistoryAction::Updated, HistoryAction::Deleted]
        );

        let ghost = state("ghost", Utc::now(), WorkflowStatus::Pending);
        assert!(matches!(
            store.update(&ghost).await,
            Err(RecruitorError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowStore::new(dir.path().to_path_buf()).await.unwrap();
        let t0 = Utc::now() - Duration::hours(3);

        let mut old = state("old", t0, WorkflowStatus::Completed);
        old.context.insert("search".into(), json!({"hits": 3}));
        let mid = state("mid", t0 + Duration::hours(1), WorkflowStatus::Failed);
        let new = state("new", t0 + Duration::hours(2), WorkflowStatus::Completed);
        for wf in [&new, &old, &mid] {
            store.save(wf).await.unwrap();
        }

        let loaded = store.get(old.id).await.unwrap().unwrap();
        assert_eq!(loaded.context["search"]["hits"], 3);

        let names: Vec<String> = store
            .list(&WorkflowFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["old", "mid", "new"]);

        let completed = store
            .list(&WorkflowFilter::with_status(WorkflowStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 2);

        let window = WorkflowFilter {
            created_after: Some(t0 + Duration::hours(1)),
            created_before: Some(t0 + Duration::hours(2)),
            ..WorkflowFilter::default()
        };
        assert_eq!(store.list(&window).await.unwrap().len(), 2);

        store.delete(mid.id).await.unwrap();
        assert_eq!(store.history(mid.id).await.unwrap().len(), 2);
        assert!(store.get(mid.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_reports_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWorkflowStore::new(dir.path().to_path_buf()).await.unwrap();
        let id = Uuid::new_v4();
        tokio::fs::write(dir.path().join("workflows").join(format!("{id}.json")), "{not json")
            .await
            .unwrap();
        assert!(matches!(store.get(id).await, Err(RecruitorError::Store(_))));
    }

    #[tokio::test]
    async fn test_task_store_ordering() {
        let store = InMemoryTaskStore::new();
        let t = Utc::now();
        let mut undated = WorkloadTask::new("call", json!({}));
        undated.created_at = t;
        let mut dated = WorkloadTask::new("email", json!({})).with_due_at(t + Duration::hours(4));
        dated.created_at = t;
        let mut older = WorkloadTask::new("scrape", json!({}));
        older.created_at = t - Duration::minutes(5);

        for task in [&undated, &dated, &older] {
            store.save(task).await.unwrap();
        }
        let types: Vec<String> = store
            .list(&TaskFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task_type)
            .collect();
        assert_eq!(types, vec!["scrape", "email", "call"]);

        let mut done = older.clone();
        done.status = TaskStatus::Completed;
        store.update(&done).await.unwrap();
        let filter = TaskFilter {
            status: Some(TaskStatus::Completed),
            ..TaskFilter::default()
        };
        assert_eq!(store.list(&filter).await.unwrap().len(), 1);
    }
}
