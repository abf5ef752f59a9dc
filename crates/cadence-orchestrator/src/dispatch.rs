use crate::types::{Phase, Priority};
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult, WorkerRole};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// "Assign task T, phase P, to role R", with everything the worker needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: Uuid,
    pub story_id: String,
    pub story_title: String,
    pub phase: Phase,
    pub role: WorkerRole,
    pub priority: Priority,
    /// Every gate rejection reason so far, oldest first.
    #[serde(default)]
    pub rework_reasons: Vec<String>,
    /// 1 for the first attempt, incremented on each rework.
    pub attempt: u32,
}

impl Assignment {
    pub fn is_rework(&self) -> bool {
        !self.rework_reasons.is_empty()
    }
}

/// Hands assignments to the worker pool.
///
/// Dispatch must not wait for the work itself; results come back later as
/// completion signals.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    async fn dispatch(&self, assignment: Assignment) -> CadenceResult<()>;
}

/// Dispatcher that only logs. Useful with a manual signal inbox.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl WorkerDispatcher for LogDispatcher {
    async fn dispatch(&self, assignment: Assignment) -> CadenceResult<()> {
        info!(
            task_id = %assignment.task_id,
            story_id = %assignment.story_id,
            phase = %assignment.phase,
            role = %assignment.role,
            attempt = assignment.attempt,
            "Assignment issued"
        );
        Ok(())
    }
}

/// Dispatcher that forwards assignments over an in-process channel.
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Assignment>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Assignment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl WorkerDispatcher for ChannelDispatcher {
    async fn dispatch(&self, assignment: Assignment) -> CadenceResult<()> {
        self.tx
            .send(assignment)
            .map_err(|e| CadenceError::Dispatch(format!("worker channel closed: {e}")))
    }
}
