//! Core contracts for the Recruitor orchestration layer.
//!
//! This crate holds the vocabulary shared by every other crate: the message
//! envelopes that travel over the bus, the action contracts workers declare,
//! the identity records the registry keeps, the lifecycle events the core
//! emits, and the unified error type.
//!
//! # Main types
//!
//! - [`RecruitorError`]: Unified error enum for the orchestration core.
//! - [`RecruitorResult`]: Convenience alias for `Result<T, RecruitorError>`.
//! - [`Message`]: Tagged union of [`RequestMessage`], [`ResponseMessage`] and [`EventMessage`].
//! - [`Action`] / [`ActionSet`]: Named capabilities with input/output [`Contract`]s.
//! - [`AgentInfo`] / [`AgentStatus`]: The registry's view of a worker.
//! - [`OrchestrationEvent`] / [`EventHub`]: Observability events and their fan-out.

/// Named actions, handlers and action sets.
pub mod action;
/// Worker identity and status.
pub mod agent;
/// Input/output contract validation.
pub mod contract;
/// Error types.
pub mod error;
/// Lifecycle events and the event hub.
pub mod event;
/// Request/response/event envelopes.
pub mod message;

pub use action::{Action, ActionDescriptor, ActionHandler, ActionSet};
pub use agent::{AgentDescriptor, AgentInfo, AgentStatus};
pub use contract::{Contract, FieldSpec, ValueKind};
pub use error::{RecruitorError, RecruitorResult};
pub use event::{Alert, AlertKind, EventHub, OrchestrationEvent};
pub use message::{EventMessage, Message, RequestMessage, ResponseMessage};
