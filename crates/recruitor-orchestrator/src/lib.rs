//! Agent orchestration services for Recruitor.
//!
//! Workers exchange typed messages over an in-process bus, announce
//! themselves to a registry, and get work from either the workload balancer
//! (single tasks) or the workflow engine (dependency graphs of steps with
//! conditions, retry and rollback). A health monitor watches every worker and
//! raises alerts through the shared event hub.
//!
//! # Main types
//!
//! - [`MessageBus`]: Point-to-point delivery, request/response correlation and broadcast.
//! - [`AgentRegistry`]: Worker records, capability lookup and liveness sweep.
//! - [`AgentRuntime`]: Hosts an [`Agent`] on the bus with serial request handling.
//! - [`WorkflowEngine`]: Executes [`WorkflowDefinition`]s step by step.
//! - [`WorkloadBalancer`]: Scores workers for tasks and rebalances load.
//! - [`HealthMonitor`]: Per-worker metrics, health classification and alerts.
//! - [`ServiceScheduler`]: Starts and stops the periodic service loops.
//! - [`Orchestrator`]: All of the above wired from one [`RecruitorConfig`].

/// Workload balancing across workers.
pub mod balancer;
/// In-process message bus.
pub mod bus;
/// TOML configuration.
pub mod config;
/// Workflow execution engine.
pub mod engine;
/// Worker health and metrics monitoring.
pub mod monitor;
/// Worker registry.
pub mod registry;
/// Worker runtime.
pub mod runtime;
/// Periodic service loops.
pub mod scheduler;
/// Worker scoring strategies.
pub mod scoring;
/// Service wiring.
pub mod services;
/// Dependency graph over workflow steps.
pub mod step_graph;
/// Workflow and task persistence.
pub mod store;
/// Input placeholders and step conditions.
pub mod template;
/// Workflow data types.
pub mod types;

pub use balancer::{
    AgentLoad, AssignmentResult, HealthSample, RebalanceReport, TaskAssignment, TaskStatus,
    WorkloadBalancer, WorkloadTask, NO_AVAILABLE_AGENTS,
};
pub use bus::{Inbox, MessageBus};
pub use config::{
    BalancerConfig, BusConfig, MonitorConfig, RecruitorConfig, RegistryConfig, RetryConfig,
    WorkerConfig, WorkflowConfig,
};
pub use engine::{WorkflowEngine, ENGINE_ID};
pub use monitor::{HealthMonitor, HealthRecord, HealthStatus, SystemMetrics};
pub use registry::AgentRegistry;
pub use runtime::{Agent, AgentRuntime};
pub use scheduler::ServiceScheduler;
pub use scoring::{Candidate, HybridScorer, ScoringStrategy, TaskScorer};
pub use services::Orchestrator;
pub use step_graph::StepGraph;
pub use store::{
    FileWorkflowStore, HistoryAction, HistoryEntry, InMemoryTaskStore, InMemoryWorkflowStore,
    TaskFilter, TaskStore, WorkflowFilter, WorkflowStore,
};
pub use template::{evaluate_condition, resolve_input, ConditionExpr, ConditionScope};
pub use types::{
    StepCondition, StepDefinition, StepStatus, WorkflowContext, WorkflowDefinition,
    WorkflowSnapshot, WorkflowState, WorkflowStatus, WorkflowStep,
};
