use thiserror::Error;
use uuid::Uuid;

/// Convenience `Result` alias using [`RecruitorError`].
pub type RecruitorResult<T> = Result<T, RecruitorError>;

/// Unified error type for the orchestration core.
#[derive(Error, Debug)]
pub enum RecruitorError {
    /// The requested action is not registered on the target worker.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// A request payload did not satisfy the action's input contract.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A handler result did not satisfy the action's output contract.
    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    /// No response arrived within the configured window.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Id of the request that went unanswered.
        request_id: Uuid,
        /// Window that elapsed.
        timeout_ms: u64,
    },

    /// Neither the registry nor the balancer found a candidate worker.
    #[error("No eligible worker: {0}")]
    NoEligibleWorker(String),

    /// No live or stored workflow has this id.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// The workflow has no step with this id.
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// The balancer or task store has no task with this id.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// The bus could not reach the recipient.
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// A handler returned an error, or the remote worker answered with an error response.
    #[error("Action failed: {0}")]
    ActionFailed(String),

    /// The workflow definition or its runtime state is invalid for the operation.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// A registry operation was rejected.
    #[error("Registry error: {0}")]
    Registry(String),

    /// The configuration could not be read, parsed or validated.
    #[error("Config error: {0}")]
    Config(String),

    /// The workflow or task store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem or other I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecruitorError {
    /// Whether this error came from a request that never got an answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RecruitorError::RequestTimeout { .. })
    }
}
