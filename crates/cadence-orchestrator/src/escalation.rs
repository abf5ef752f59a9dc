use crate::task_queue::{TaskQueue, TransitionPayload};
use crate::types::{
    BlockReason, Escalation, EscalationCategory, EscalationStatus, Priority, Resolution, Story,
    TaskStatus,
};
use cadence_core::{CadenceError, CadenceResult, ResolutionDecision, ResolutionRequest};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

/// What a resolution changed, for the caller to finish bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub escalation_id: Uuid,
    pub story_id: String,
    pub task_id: Option<Uuid>,
    pub decision: ResolutionDecision,
    /// Tasks cancelled because the story was rejected.
    pub cancelled_tasks: Vec<Uuid>,
    /// Other escalations closed because the story was rejected.
    pub dismissed: Vec<Uuid>,
}

/// Durable store of escalations awaiting (or past) human judgment.
///
/// Operations that touch tasks take the queue explicitly; callers hold the
/// queue lock for the whole call so the task and escalation change together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationManager {
    escalations: HashMap<Uuid, Escalation>,
}

impl EscalationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an escalation for a task and block the task on it.
    ///
    /// The escalation inherits the task's priority, which is its story's.
    pub fn create(
        &mut self,
        queue: &mut TaskQueue,
        task_id: Uuid,
        category: EscalationCategory,
        recommendation: impl Into<String>,
        reasons: Vec<String>,
    ) -> CadenceResult<Uuid> {
        let task = queue
            .get(task_id)
            .ok_or(CadenceError::TaskNotFound(task_id))?;
        let story_id = task.story_id.clone();
        let priority = task.priority;

        let id = Uuid::new_v4();
        queue.transition(
            task_id,
            TaskStatus::Blocked,
            TransitionPayload::Block(BlockReason::Escalation { escalation_id: id }),
        )?;

        self.escalations.insert(
            id,
            Escalation {
                id,
                story_id: story_id.clone(),
                task_id: Some(task_id),
                category,
                recommendation: recommendation.into(),
                priority,
                reasons,
                status: EscalationStatus::Pending,
                created_at: Utc::now(),
                resolved_at: None,
                resolution: None,
            },
        );
        info!(escalation_id = %id, task_id = %task_id, story_id = %story_id, category = %category, "Escalation created");
        Ok(id)
    }

    /// Open an escalation about a story that has not been expanded yet.
    pub fn create_for_story(
        &mut self,
        story: &Story,
        category: EscalationCategory,
        reasons: Vec<String>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.escalations.insert(
            id,
            Escalation {
                id,
                story_id: story.id.clone(),
                task_id: None,
                category,
                recommendation: category.recommendation().to_string(),
                priority: story.priority.unwrap_or(Priority::P3),
                reasons,
                status: EscalationStatus::Pending,
                created_at: Utc::now(),
                resolved_at: None,
                resolution: None,
            },
        );
        info!(escalation_id = %id, story_id = %story.id, category = %category, "Story escalation created");
        id
    }

    /// Apply an operator decision.
    ///
    /// Approve returns the task to `pending` with its failure counters reset.
    /// Reject cancels every remaining task of the story and dismisses the
    /// story's other pending escalations.
    pub fn resolve(
        &mut self,
        queue: &mut TaskQueue,
        request: &ResolutionRequest,
    ) -> CadenceResult<ResolutionOutcome> {
        let escalation = self
            .escalations
            .get(&request.escalation_id)
            .ok_or(CadenceError::EscalationNotFound(request.escalation_id))?;
        if escalation.status != EscalationStatus::Pending {
            return Err(CadenceError::EscalationClosed(request.escalation_id));
        }
        let story_id = escalation.story_id.clone();
        let task_id = escalation.task_id;

        let mut outcome = ResolutionOutcome {
            escalation_id: request.escalation_id,
            story_id: story_id.clone(),
            task_id,
            decision: request.decision,
            cancelled_tasks: Vec::new(),
            dismissed: Vec::new(),
        };

        match (request.decision, task_id) {
            (ResolutionDecision::Approve, Some(task_id)) => {
                let blocked_here = queue.get(task_id).is_some_and(|t| {
                    t.block_reason
                        == Some(BlockReason::Escalation {
                            escalation_id: request.escalation_id,
                        })
                });
                if blocked_here {
                    queue.transition(task_id, TaskStatus::Pending, TransitionPayload::None)?;
                    queue.reset_failures(task_id)?;
                }
            }
            (ResolutionDecision::Approve, None) => {}
            (ResolutionDecision::Reject, _) => {
                outcome.cancelled_tasks = queue.cancel_story(&story_id);
                let now = Utc::now();
                for other in self.escalations.values_mut() {
                    if other.id != request.escalation_id
                        && other.story_id == story_id
                        && other.status == EscalationStatus::Pending
                    {
                        other.status = EscalationStatus::Dismissed;
                        other.resolved_at = Some(now);
                        outcome.dismissed.push(other.id);
                    }
                }
            }
        }

        if let Some(escalation) = self.escalations.get_mut(&request.escalation_id) {
            escalation.status = EscalationStatus::Answered;
            escalation.resolved_at = Some(Utc::now());
            escalation.resolution = Some(Resolution {
                decision: request.decision,
                note: request.note.clone(),
            });
        }

        info!(
            escalation_id = %request.escalation_id,
            story_id = %story_id,
            decision = %request.decision,
            cancelled = outcome.cancelled_tasks.len(),
            "Escalation resolved"
        );
        Ok(outcome)
    }

    /// Pending escalations, most urgent first, then oldest first.
    pub fn unresolved(&self) -> Vec<&Escalation> {
        let mut pending: Vec<&Escalation> = self
            .escalations
            .values()
            .filter(|e| e.status == EscalationStatus::Pending)
            .collect();
        pending.sort_by_key(|e| (e.priority, e.created_at));
        pending
    }

    pub fn get(&self, id: Uuid) -> Option<&Escalation> {
        self.escalations.get(&id)
    }

    /// Every escalation ever raised, oldest first.
    pub fn all(&self) -> Vec<&Escalation> {
        let mut all: Vec<&Escalation> = self.escalations.values().collect();
        all.sort_by_key(|e| e.created_at);
        all
    }
}
