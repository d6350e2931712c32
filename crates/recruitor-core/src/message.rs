use crate::error::{RecruitorError, RecruitorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request for a worker to run one of its named actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Unique identifier; echoed back as the response's `correlation_id`.
    pub id: Uuid,
    /// Sender identity (worker id or service name).
    pub from: String,
    /// Recipient worker id.
    pub to: String,
    /// Name of the action to invoke.
    pub action: String,
    /// Opaque payload validated against the action's input contract.
    pub payload: serde_json::Value,
    /// Optional per-request deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// UTC timestamp of when the request was created.
    pub timestamp: DateTime<Utc>,
}

impl RequestMessage {
    /// Creates a new request with a fresh id and no timeout.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            action: action.into(),
            payload,
            timeout_ms: None,
            timestamp: Utc::now(),
        }
    }

    /// Sets the per-request deadline.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// The answer to a [`RequestMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Unique identifier of this response.
    pub id: Uuid,
    /// The `id` of the request being answered.
    pub correlation_id: Uuid,
    /// The responding worker.
    pub from: String,
    /// The original requester.
    pub to: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Handler output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Failure message on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the worker gave up because the request's deadline passed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    /// UTC timestamp of when the response was created.
    pub timestamp: DateTime<Utc>,
}

impl ResponseMessage {
    /// Builds a success response correlated to `request`.
    pub fn success(request: &RequestMessage, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: request.id,
            from: request.to.clone(),
            to: request.from.clone(),
            success: true,
            data: Some(data),
            error: None,
            timed_out: false,
            timestamp: Utc::now(),
        }
    }

    /// Builds an error response correlated to `request`.
    pub fn failure(request: &RequestMessage, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: request.id,
            from: request.to.clone(),
            to: request.from.clone(),
            success: false,
            data: None,
            error: Some(error.into()),
            timed_out: false,
            timestamp: Utc::now(),
        }
    }

    /// Builds the error response a worker sends when the request's deadline passed.
    pub fn timeout(request: &RequestMessage, timeout_ms: u64) -> Self {
        let err = RecruitorError::RequestTimeout {
            request_id: request.id,
            timeout_ms,
        };
        Self {
            timed_out: true,
            ..Self::failure(request, err.to_string())
        }
    }

    /// Converts the response into the handler's output or an [`RecruitorError::ActionFailed`].
    pub fn into_result(self) -> RecruitorResult<serde_json::Value> {
        if self.success {
            Ok(self.data.unwrap_or(serde_json::Value::Null))
        } else {
            Err(RecruitorError::ActionFailed(
                self.error
                    .unwrap_or_else(|| "worker returned an error without a message".to_string()),
            ))
        }
    }
}

/// A fire-and-forget notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique identifier of this event.
    pub id: Uuid,
    /// Sender identity.
    pub from: String,
    /// Single recipient; `None` means every subscriber.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Event name.
    pub name: String,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// UTC timestamp of when the event was created.
    pub timestamp: DateTime<Utc>,
}

impl EventMessage {
    /// Creates an event addressed to every subscriber.
    pub fn new(from: impl Into<String>, name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: None,
            name: name.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Restricts delivery to a single recipient.
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to = Some(recipient.into());
        self
    }
}

/// Every envelope that travels over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// See [`RequestMessage`].
    Request(RequestMessage),
    /// See [`ResponseMessage`].
    Response(ResponseMessage),
    /// See [`EventMessage`].
    Event(EventMessage),
}

impl Message {
    /// The unique id of the wrapped envelope.
    pub fn id(&self) -> Uuid {
        match self {
            Message::Request(r) => r.id,
            Message::Response(r) => r.id,
            Message::Event(e) => e.id,
        }
    }

    /// The sender of the wrapped envelope.
    pub fn sender(&self) -> &str {
        match self {
            Message::Request(r) => &r.from,
            Message::Response(r) => &r.from,
            Message::Event(e) => &e.from,
        }
    }

    /// The recipient, if the envelope is addressed to a single worker.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.to),
            Message::Response(r) => Some(&r.to),
            Message::Event(e) => e.to.as_deref(),
        }
    }

    /// Short name of the envelope kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Event(_) => "event",
        }
    }
}
