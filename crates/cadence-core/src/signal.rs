use crate::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// The fixed set of external worker roles, one per pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    /// Gathers sources and background material.
    Researcher,
    /// Produces the draft.
    Writer,
    /// Edits the draft for correctness and style.
    Editor,
    /// Produces graphics and illustrations.
    Designer,
    /// Runs final format and acceptance validation.
    Validator,
}

impl WorkerRole {
    /// Every role, in pipeline order.
    pub const ALL: [WorkerRole; 5] = [
        WorkerRole::Researcher,
        WorkerRole::Writer,
        WorkerRole::Editor,
        WorkerRole::Designer,
        WorkerRole::Validator,
    ];

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Researcher => "researcher",
            WorkerRole::Writer => "writer",
            WorkerRole::Editor => "editor",
            WorkerRole::Designer => "designer",
            WorkerRole::Validator => "validator",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerRole {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        WorkerRole::ALL
            .into_iter()
            .find(|r| r.as_str() == needle)
            .ok_or_else(|| CadenceError::InvalidSignal(format!("unknown worker role '{s}'")))
    }
}

/// Status a worker role reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Waiting for work.
    Idle,
    /// A task has been designated but not started.
    Assigned,
    /// Actively executing the assigned task.
    InProgress,
    /// Finished the assigned task; carries a validation payload.
    Complete,
    /// Cannot make progress (external reason).
    Blocked,
    /// Failed while executing the assigned task.
    Error,
}

impl AgentStatus {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Assigned => "assigned",
            AgentStatus::InProgress => "in_progress",
            AgentStatus::Complete => "complete",
            AgentStatus::Blocked => "blocked",
            AgentStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "idle" => Ok(AgentStatus::Idle),
            "assigned" => Ok(AgentStatus::Assigned),
            "in_progress" => Ok(AgentStatus::InProgress),
            "complete" => Ok(AgentStatus::Complete),
            "blocked" => Ok(AgentStatus::Blocked),
            "error" => Ok(AgentStatus::Error),
            other => Err(CadenceError::InvalidSignal(format!(
                "unknown agent status '{other}'"
            ))),
        }
    }
}

/// A worker's self-reported validation result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationPayload {
    /// Whether the worker considers its own output acceptable.
    pub passed: bool,
    /// Identifiers of the checks that failed.
    pub failed_checks: Vec<String>,
}

/// The raw inbound shape of a worker signal, exactly as it appears on the wire.
///
/// Use [`CompletionSignal::try_from`] to validate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Reporting role.
    pub role: WorkerRole,
    /// Reported status.
    pub status: AgentStatus,
    /// Self-validation flag. Required when `status` is `complete`.
    #[serde(default)]
    pub passed: Option<bool>,
    /// Failed check identifiers.
    #[serde(default)]
    pub failed_checks: Vec<String>,
    /// The task the worker believes it is reporting on.
    #[serde(default)]
    pub task_id: Option<Uuid>,
    /// References to produced artifacts (paths, URLs).
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// A worker status signal that passed boundary validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    /// Reporting role.
    pub role: WorkerRole,
    /// Reported status.
    pub status: AgentStatus,
    /// Present iff `status` is `complete`.
    pub payload: Option<ValidationPayload>,
    /// The task the worker believes it is reporting on.
    pub task_id: Option<Uuid>,
    /// References to produced artifacts.
    pub artifacts: Vec<String>,
}

impl CompletionSignal {
    /// A signal without payload (`idle`, `in_progress`, `blocked`, `error`, ...).
    pub fn status(role: WorkerRole, status: AgentStatus) -> Self {
        Self {
            role,
            status,
            payload: None,
            task_id: None,
            artifacts: Vec::new(),
        }
    }

    /// A `complete` signal with the given validation result.
    pub fn complete<I, S>(role: WorkerRole, passed: bool, failed_checks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role,
            status: AgentStatus::Complete,
            payload: Some(ValidationPayload {
                passed,
                failed_checks: failed_checks.into_iter().map(Into::into).collect(),
            }),
            task_id: None,
            artifacts: Vec::new(),
        }
    }

    /// Pin the signal to a specific task.
    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attach artifact references.
    pub fn with_artifacts<I, S>(mut self, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts = artifacts.into_iter().map(Into::into).collect();
        self
    }

    /// Parse and validate a JSON-encoded signal.
    pub fn from_json(raw: &str) -> CadenceResult<Self> {
        let envelope: SignalEnvelope = serde_json::from_str(raw)
            .map_err(|e| CadenceError::InvalidSignal(format!("unparseable signal: {e}")))?;
        Self::try_from(envelope)
    }

    /// Back to wire shape.
    pub fn to_envelope(&self) -> SignalEnvelope {
        SignalEnvelope {
            role: self.role,
            status: self.status,
            passed: self.payload.as_ref().map(|p| p.passed),
            failed_checks: self
                .payload
                .as_ref()
                .map(|p| p.failed_checks.clone())
                .unwrap_or_default(),
            task_id: self.task_id,
            artifacts: self.artifacts.clone(),
        }
    }
}

impl TryFrom<SignalEnvelope> for CompletionSignal {
    type Error = CadenceError;

    fn try_from(envelope: SignalEnvelope) -> Result<Self, Self::Error> {
        if envelope.failed_checks.iter().any(|c| c.trim().is_empty()) {
            return Err(CadenceError::InvalidSignal(format!(
                "{} reported a blank failed check id",
                envelope.role
            )));
        }

        let payload = match (envelope.status, envelope.passed) {
            (AgentStatus::Complete, Some(passed)) => Some(ValidationPayload {
                passed,
                failed_checks: envelope
                    .failed_checks
                    .into_iter()
                    .map(|c| c.trim().to_string())
                    .collect(),
            }),
            (AgentStatus::Complete, None) => {
                return Err(CadenceError::InvalidSignal(format!(
                    "complete signal from {} is missing 'passed'",
                    envelope.role
                )));
            }
            (status, _) if !envelope.failed_checks.is_empty() => {
                return Err(CadenceError::InvalidSignal(format!(
                    "{} sent failed checks with non-complete status '{status}'",
                    envelope.role
                )));
            }
            _ => None,
        };

        Ok(Self {
            role: envelope.role,
            status: envelope.status,
            payload,
            task_id: envelope.task_id,
            artifacts: envelope.artifacts,
        })
    }
}
