//! Content pipeline orchestration: backlog admission, a dependency-aware task
//! queue, worker status tracking, quality gates and human escalation.
//!
//! Stories from a backlog are checked for readiness and expanded into one task
//! per pipeline phase. A single control loop hands eligible tasks to external
//! worker roles, judges their completion signals, and routes anything it cannot
//! decide to an operator.
//!
//! # Main types
//!
//! - [`Orchestrator`]: The control loop and owner of every store.
//! - [`TaskQueue`]: Tasks, their dependencies and lifecycle transitions.
//! - [`StatusRegistry`]: Latest self-reported status of each worker role.
//! - [`QualityGate`]: Readiness and completion decisions.
//! - [`EscalationManager`]: Durable requests for human judgment.
//! - [`StateStore`]: Persistence seam used for restart and resume.

/// Story backlog loading and bookkeeping.
pub mod backlog;
/// Worker assignment seam.
pub mod dispatch;
/// Orchestrator control loop.
pub mod engine;
/// Escalation store and resolution.
pub mod escalation;
/// Readiness and completion checks.
pub mod gate;
/// Worker role status registry.
pub mod registry;
/// Operator status report.
pub mod report;
/// Snapshot persistence.
pub mod store;
/// Task queue with dependency resolution.
pub mod task_queue;
/// Shared orchestration types (Story, Task, Escalation, etc.).
pub mod types;

pub use backlog::Backlog;
pub use dispatch::{Assignment, ChannelDispatcher, LogDispatcher, WorkerDispatcher};
pub use engine::{IterationOutcome, Orchestrator, RunSummary, SchedulerConfig, StopReason};
pub use escalation::{EscalationManager, ResolutionOutcome};
pub use gate::{GatePolicy, QualityGate, ReadinessReport, ReworkOutcome};
pub use registry::{AgentRecord, StatusRegistry};
pub use report::StatusReport;
pub use store::{JsonStateStore, MemoryStateStore, Snapshot, StateStore};
pub use task_queue::{TaskQueue, TransitionOutcome, TransitionPayload};
pub use types::{
    BlockReason, Decision, Escalation, EscalationCategory, EscalationStatus, GateDecision, Phase,
    Priority, Story, StoryStatus, Task, TaskStatus,
};
