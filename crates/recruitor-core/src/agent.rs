use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reachability and activity of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Offline,
}

impl AgentStatus {
    /// Selection priority: lower is preferred.
    pub fn priority(self) -> u8 {
        match self {
            AgentStatus::Idle => 0,
            AgentStatus::Busy => 1,
            AgentStatus::Error => 2,
            AgentStatus::Offline => 3,
        }
    }

    pub fn is_reachable(self) -> bool {
        self != AgentStatus::Offline
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Static identity a worker declares about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    /// Declared type or category (e.g. `scraper`, `outreach`).
    pub agent_type: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent_type: agent_type.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// The registry's record of a live worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub status: AgentStatus,
    /// Names of the actions this worker registered.
    pub capabilities: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Monotonic registration sequence, used to break selection ties.
    #[serde(default)]
    pub registration_seq: u64,
}

impl AgentInfo {
    /// Builds a record from a descriptor and the worker's action names.
    pub fn new(descriptor: &AgentDescriptor, capabilities: Vec<String>) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            agent_type: descriptor.agent_type.clone(),
            status: AgentStatus::Idle,
            capabilities,
            last_heartbeat: Utc::now(),
            metadata: descriptor.metadata.clone(),
            registration_seq: 0,
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn has_capability(&self, action: &str) -> bool {
        self.capabilities.iter().any(|c| c == action)
    }

    /// Whether every name in `required` is among this worker's capabilities.
    pub fn supports_all(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.has_capability(r))
    }

    /// Declared specializations: the `specializations` metadata list plus the worker type.
    pub fn specializations(&self) -> Vec<String> {
        let mut specs: Vec<String> = self
            .metadata
            .get("specializations")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        specs.push(self.agent_type.clone());
        specs
    }
}
