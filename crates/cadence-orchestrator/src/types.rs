use cadence_core::{CadenceError, WorkerRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Priority tier of a story. `P0` is the most urgent.
///
/// The derived ordering sorts `P0` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::P0 => write!(f, "P0"),
            Priority::P1 => write!(f, "P1"),
            Priority::P2 => write!(f, "P2"),
            Priority::P3 => write!(f, "P3"),
        }
    }
}

impl FromStr for Priority {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "P0" => Ok(Priority::P0),
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            "P3" => Ok(Priority::P3),
            other => Err(CadenceError::Config(format!("unknown priority '{other}'"))),
        }
    }
}

/// A pipeline phase. Each story expands into one task per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Research,
    Writing,
    Editing,
    Graphics,
    Validation,
}

impl Phase {
    /// The worker role that executes this phase.
    pub fn role(&self) -> WorkerRole {
        match self {
            Phase::Research => WorkerRole::Researcher,
            Phase::Writing => WorkerRole::Writer,
            Phase::Editing => WorkerRole::Editor,
            Phase::Graphics => WorkerRole::Designer,
            Phase::Validation => WorkerRole::Validator,
        }
    }

    /// Phases that hand a deliverable to the next phase.
    pub fn produces_artifact(&self) -> bool {
        !matches!(self, Phase::Validation)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Research => write!(f, "research"),
            Phase::Writing => write!(f, "writing"),
            Phase::Editing => write!(f, "editing"),
            Phase::Graphics => write!(f, "graphics"),
            Phase::Validation => write!(f, "validation"),
        }
    }
}

/// Lifecycle of a story in the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    /// Not yet admitted; readiness is checked every iteration.
    #[default]
    Backlog,
    /// Failed the readiness checklist. Never expanded.
    NotReady,
    /// Readiness found an ambiguity; a story-level escalation is pending.
    AwaitingDecision,
    /// An operator approved an ambiguous story; expand on the next iteration.
    Cleared,
    /// Expanded into tasks.
    InProgress,
    /// Every task complete.
    Done,
    /// Rejected by an operator.
    Cancelled,
}

impl StoryStatus {
    /// No further scheduling work will happen for this story.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            StoryStatus::Done | StoryStatus::Cancelled | StoryStatus::NotReady
        )
    }
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StoryStatus::Backlog => "backlog",
            StoryStatus::NotReady => "not_ready",
            StoryStatus::AwaitingDecision => "awaiting_decision",
            StoryStatus::Cleared => "cleared",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Done => "done",
            StoryStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A planned unit of work from the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Size estimate in story points.
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Stories that must be done before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Unanswered questions recorded during refinement.
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub requires_graphics: bool,
    #[serde(default)]
    pub status: StoryStatus,
    /// Findings of the most recent failed readiness check.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_issues: Vec<String>,
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            priority: None,
            size: None,
            acceptance_criteria: Vec::new(),
            depends_on: Vec::new(),
            open_questions: Vec::new(),
            requires_graphics: false,
            status: StoryStatus::Backlog,
            readiness_issues: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_graphics(mut self) -> Self {
        self.requires_graphics = true;
        self
    }

    pub fn depending_on(mut self, story_id: impl Into<String>) -> Self {
        self.depends_on.push(story_id.into());
        self
    }

    pub fn with_open_question(mut self, question: impl Into<String>) -> Self {
        self.open_questions.push(question.into());
        self
    }

    /// The phases this story expands into, in canonical order.
    pub fn phases(&self) -> Vec<Phase> {
        let mut phases = vec![Phase::Research, Phase::Writing, Phase::Editing];
        if self.requires_graphics {
            phases.push(Phase::Graphics);
        }
        phases.push(Phase::Validation);
        phases
    }
}

/// Status of a task in the execution queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Assigned,
    InProgress,
    NeedsRework,
    Complete,
    /// Story was rejected; never counted toward velocity.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Cancelled)
    }

    /// A worker currently holds the task.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if next == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Blocked)
                | (Blocked, Pending)
                | (Assigned, InProgress)
                | (Assigned, Pending)
                | (Assigned, Blocked)
                | (InProgress, Complete)
                | (InProgress, NeedsRework)
                | (InProgress, Pending)
                | (InProgress, Blocked)
                | (NeedsRework, Assigned)
                | (NeedsRework, Blocked)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::NeedsRework => "needs_rework",
            TaskStatus::Complete => "complete",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task sits in [`TaskStatus::Blocked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// At least one dependency is not complete.
    Dependency,
    /// Waiting for an operator to answer an escalation.
    Escalation { escalation_id: Uuid },
}

/// One round of gate rejection reasons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub attempt: u32,
    pub reasons: Vec<String>,
    pub at: DateTime<Utc>,
}

/// A task in the orchestration queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub story_id: String,
    pub phase: Phase,
    pub priority: Priority,
    pub dependencies: Vec<Uuid>,
    pub status: TaskStatus,
    #[serde(default)]
    pub block_reason: Option<BlockReason>,
    #[serde(default)]
    pub assigned_role: Option<WorkerRole>,
    #[serde(default)]
    pub rejection_history: Vec<Rejection>,
    /// Gate failures since the last approval or operator decision.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Worker error signals since the last approval or operator decision.
    #[serde(default)]
    pub worker_failures: u32,
    /// Insertion order, used to break priority ties.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(story_id: impl Into<String>, phase: Phase, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            story_id: story_id.into(),
            phase,
            priority,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            block_reason: None,
            assigned_role: None,
            rejection_history: Vec::new(),
            consecutive_failures: 0,
            worker_failures: 0,
            sequence: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// The role that works this task.
    pub fn role(&self) -> WorkerRole {
        self.phase.role()
    }

    /// Every rejection reason recorded so far, oldest first.
    pub fn accumulated_reasons(&self) -> Vec<String> {
        self.rejection_history
            .iter()
            .flat_map(|r| r.reasons.iter().cloned())
            .collect()
    }

    pub fn is_blocked_on_escalation(&self) -> bool {
        self.status == TaskStatus::Blocked
            && matches!(self.block_reason, Some(BlockReason::Escalation { .. }))
    }
}

/// Outcome of a completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Approve,
    Reject,
    Escalate,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approve => write!(f, "APPROVE"),
            Decision::Reject => write!(f, "REJECT"),
            Decision::Escalate => write!(f, "ESCALATE"),
        }
    }
}

/// The kind of ambiguity an escalation asks an operator to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationCategory {
    /// A subjective or unrecognised check failed.
    AmbiguousCriteria,
    /// Too many checks failed at once.
    TooManyFailures,
    /// The task kept failing the gate.
    RepeatedRejection,
    /// The worker kept erroring out.
    WorkerFailure,
    /// Readiness found open questions on the story.
    StoryAmbiguity,
    /// The worker reported failure without naming a failed check.
    ContradictoryReport,
}

impl EscalationCategory {
    /// A resolution the system proposes for the operator.
    pub fn recommendation(&self) -> &'static str {
        match self {
            EscalationCategory::AmbiguousCriteria => {
                "Judge the subjective checks; approve to send the task back for another pass, reject to drop the story"
            }
            EscalationCategory::TooManyFailures => {
                "Deliverable is far from done; consider splitting or rewriting the story before approving another attempt"
            }
            EscalationCategory::RepeatedRejection => {
                "Automatic rework is not converging; clarify acceptance criteria with the worker, then approve a fresh attempt"
            }
            EscalationCategory::WorkerFailure => {
                "Worker keeps failing; check the worker's health before approving a retry"
            }
            EscalationCategory::StoryAmbiguity => {
                "Answer the open questions in the story, then approve to admit it"
            }
            EscalationCategory::ContradictoryReport => {
                "Worker reported failure without naming a check; inspect the deliverable manually"
            }
        }
    }
}

impl std::fmt::Display for EscalationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EscalationCategory::AmbiguousCriteria => "ambiguous_criteria",
            EscalationCategory::TooManyFailures => "too_many_failures",
            EscalationCategory::RepeatedRejection => "repeated_rejection",
            EscalationCategory::WorkerFailure => "worker_failure",
            EscalationCategory::StoryAmbiguity => "story_ambiguity",
            EscalationCategory::ContradictoryReport => "contradictory_report",
        };
        f.write_str(s)
    }
}

/// The gate's verdict for a single task transition. Consumed immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub decision: Decision,
    /// Missing or failed criteria behind the decision.
    pub failed_criteria: Vec<String>,
    /// Set when `decision` is [`Decision::Escalate`].
    pub category: Option<EscalationCategory>,
}

impl GateDecision {
    pub fn approve() -> Self {
        Self {
            decision: Decision::Approve,
            failed_criteria: Vec::new(),
            category: None,
        }
    }

    pub fn reject(failed_criteria: Vec<String>) -> Self {
        Self {
            decision: Decision::Reject,
            failed_criteria,
            category: None,
        }
    }

    pub fn escalate(category: EscalationCategory, failed_criteria: Vec<String>) -> Self {
        Self {
            decision: Decision::Escalate,
            failed_criteria,
            category: Some(category),
        }
    }
}

/// Status of an escalation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Answered,
    /// Closed without an answer because its story was cancelled.
    Dismissed,
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationStatus::Pending => write!(f, "pending"),
            EscalationStatus::Answered => write!(f, "answered"),
            EscalationStatus::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// The operator's answer, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: cadence_core::ResolutionDecision,
    pub note: String,
}

/// A durable request for human judgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub story_id: String,
    /// `None` for story-level escalations raised before expansion.
    pub task_id: Option<Uuid>,
    pub category: EscalationCategory,
    pub recommendation: String,
    pub priority: Priority,
    pub reasons: Vec<String>,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
}
