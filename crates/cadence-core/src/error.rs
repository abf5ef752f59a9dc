use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`CadenceError`].
pub type CadenceResult<T> = Result<T, CadenceError>;

/// Top-level error type for the Cadence orchestrator.
///
/// Variants fall into the categories the control loop cares about:
/// configuration errors (bad stories), transition errors (integration
/// defects), boundary errors (bad signals) and fatal state errors.
#[derive(Error, Debug)]
pub enum CadenceError {
    /// A story is missing fields required for expansion into tasks.
    #[error("Malformed story '{story_id}': missing {}", missing.join(", "))]
    MalformedStory {
        /// The offending story.
        story_id: String,
        /// Names of the missing or invalid fields.
        missing: Vec<String>,
    },

    /// A task state change that the lifecycle does not allow.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// The task the transition was requested for.
        task_id: Uuid,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// No task with the given id.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// No story with the given id.
    #[error("Story not found: {0}")]
    StoryNotFound(String),

    /// No escalation with the given id.
    #[error("Escalation not found: {0}")]
    EscalationNotFound(Uuid),

    /// The escalation was already answered or dismissed.
    #[error("Escalation {0} is already closed")]
    EscalationClosed(Uuid),

    /// An inbound worker signal failed boundary validation.
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// Persisted state could not be read or parsed. The control loop halts.
    #[error("State store corrupted: {0}")]
    StateCorrupted(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// Handing an assignment to a worker failed.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadenceError {
    /// Whether this error must halt the control loop instead of being logged
    /// and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CadenceError::StateCorrupted(_))
    }
}
