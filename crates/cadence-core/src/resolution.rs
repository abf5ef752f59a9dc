//! Resolution types for human-in-the-loop escalations.
//!
//! These types live in `cadence-core` so that the orchestrator (which applies
//! resolutions) and the CLI (which collects them from an operator) share one
//! wire format.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::CadenceError;

/// The decision an operator makes on a pending escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionDecision {
    /// Proceed: the task (or story) goes back into scheduling.
    Approve,
    /// Reject the story outright: its remaining tasks are cancelled.
    Reject,
}

impl std::fmt::Display for ResolutionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionDecision::Approve => write!(f, "approve"),
            ResolutionDecision::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for ResolutionDecision {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" | "approved" | "yes" => Ok(ResolutionDecision::Approve),
            "reject" | "rejected" | "no" => Ok(ResolutionDecision::Reject),
            other => Err(CadenceError::Config(format!(
                "unknown resolution decision '{other}' (expected approve|reject)"
            ))),
        }
    }
}

/// A human-supplied resolution of an escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub escalation_id: Uuid,
    pub decision: ResolutionDecision,
    #[serde(default)]
    pub note: String,
}

impl ResolutionRequest {
    pub fn approve(escalation_id: Uuid) -> Self {
        Self {
            escalation_id,
            decision: ResolutionDecision::Approve,
            note: String::new(),
        }
    }

    pub fn reject(escalation_id: Uuid) -> Self {
        Self {
            escalation_id,
            decision: ResolutionDecision::Reject,
            note: String::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }
}
