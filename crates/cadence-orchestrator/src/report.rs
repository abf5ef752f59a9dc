use crate::store::Snapshot;
use crate::types::{BlockReason, EscalationCategory, Priority, StoryStatus, TaskStatus};
use cadence_core::{AgentStatus, WorkerRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// One worker role in the status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLine {
    pub role: WorkerRole,
    /// `None` until the role first signals or is assigned.
    pub status: Option<AgentStatus>,
    pub current_task: Option<Uuid>,
}

/// One pending escalation in the status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationLine {
    pub id: Uuid,
    pub story_id: String,
    pub category: EscalationCategory,
    pub priority: Priority,
    pub reasons: Vec<String>,
    pub recommendation: String,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time summary of the pipeline for operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub total_tasks: usize,
    /// Task count per status name.
    pub queue_depth: BTreeMap<String, usize>,
    pub blocked_on_dependency: usize,
    pub blocked_on_escalation: usize,
    /// Open tasks whose role currently reports `blocked` or `error`.
    pub blocked_on_worker_error: usize,
    pub roles: Vec<RoleLine>,
    pub unresolved_escalations: usize,
    pub escalations: Vec<EscalationLine>,
    /// Story count per status name.
    pub stories: BTreeMap<String, usize>,
}

impl StatusReport {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let queue = &snapshot.queue;

        let queue_depth = queue
            .count_by_status()
            .into_iter()
            .map(|(status, n)| (status.as_str().to_string(), n))
            .collect();

        let mut blocked_on_dependency = 0;
        let mut blocked_on_escalation = 0;
        for task in queue.all_tasks() {
            match (task.status, task.block_reason) {
                (TaskStatus::Blocked, Some(BlockReason::Escalation { .. })) => {
                    blocked_on_escalation += 1;
                }
                (TaskStatus::Blocked, _) => blocked_on_dependency += 1,
                _ => {}
            }
        }

        let erroring: BTreeSet<WorkerRole> = snapshot
            .agents
            .iter()
            .filter(|r| matches!(r.status, AgentStatus::Blocked | AgentStatus::Error))
            .map(|r| r.role)
            .collect();
        let blocked_on_worker_error = queue
            .all_tasks()
            .iter()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Pending
                        | TaskStatus::Assigned
                        | TaskStatus::InProgress
                        | TaskStatus::NeedsRework
                )
            })
            .filter(|t| erroring.contains(&t.role()))
            .count();

        let roles = WorkerRole::ALL
            .into_iter()
            .map(|role| {
                let record = snapshot.agents.iter().find(|r| r.role == role);
                RoleLine {
                    role,
                    status: record.map(|r| r.status),
                    current_task: record.and_then(|r| r.current_task),
                }
            })
            .collect();

        let escalations: Vec<EscalationLine> = snapshot
            .escalations
            .unresolved()
            .into_iter()
            .map(|e| EscalationLine {
                id: e.id,
                story_id: e.story_id.clone(),
                category: e.category,
                priority: e.priority,
                reasons: e.reasons.clone(),
                recommendation: e.recommendation.clone(),
                created_at: e.created_at,
            })
            .collect();

        let mut stories: BTreeMap<String, usize> = BTreeMap::new();
        for story in &snapshot.backlog.stories {
            *stories.entry(story.status.to_string()).or_insert(0) += 1;
        }

        Self {
            generated_at: Utc::now(),
            total_tasks: queue.total_count(),
            queue_depth,
            blocked_on_dependency,
            blocked_on_escalation,
            blocked_on_worker_error,
            roles,
            unresolved_escalations: escalations.len(),
            escalations,
            stories,
        }
    }

    pub fn stories_in(&self, status: StoryStatus) -> usize {
        self.stories.get(&status.to_string()).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Queue ({} tasks)", self.total_tasks)?;
        for (status, count) in &self.queue_depth {
            writeln!(f, "  {status:<14} {count}")?;
        }
        writeln!(
            f,
            "  blocked: {} dependency, {} escalation, {} worker error",
            self.blocked_on_dependency, self.blocked_on_escalation, self.blocked_on_worker_error
        )?;

        writeln!(f, "Roles")?;
        for line in &self.roles {
            let status = line
                .status
                .map_or_else(|| "no signal".to_string(), |s| s.to_string());
            match line.current_task {
                Some(task) => writeln!(f, "  {:<11} {status} ({task})", line.role)?,
                None => writeln!(f, "  {:<11} {status}", line.role)?,
            }
        }

        writeln!(f, "Stories")?;
        for (status, count) in &self.stories {
            writeln!(f, "  {status:<18} {count}")?;
        }

        write!(f, "Unresolved escalations: {}", self.unresolved_escalations)?;
        for e in &self.escalations {
            write!(
                f,
                "\n  [{}] {} {} {}: {}",
                e.priority,
                e.id,
                e.story_id,
                e.category,
                e.reasons.join(", ")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backlog::Backlog;
    use crate::escalation::EscalationManager;
    use crate::registry::AgentRecord;
    use crate::task_queue::{TaskQueue, TransitionPayload};
    use crate::types::{Phase, Story};

    fn snapshot() -> Snapshot {
        let story = Story::new("S-1", "Title")
            .with_priority(Priority::P0)
            .with_size(3)
            .with_criteria(["a", "b", "c"]);
        let mut queue = TaskQueue::construct([&story]).unwrap();
        let research = queue.find("S-1", Phase::Research).unwrap().id;
        queue
            .transition(research, TaskStatus::Assigned, TransitionPayload::None)
            .unwrap();
        queue
            .transition(research, TaskStatus::InProgress, TransitionPayload::None)
            .unwrap();

        let mut escalations = EscalationManager::new();
        escalations
            .create(
                &mut queue,
                research,
                EscalationCategory::AmbiguousCriteria,
                "judge",
                vec!["tone".into()],
            )
            .unwrap();

        let mut backlog = Backlog::new(vec![story]);
        backlog.set_status("S-1", StoryStatus::InProgress).unwrap();

        Snapshot {
            backlog,
            queue,
            agents: vec![AgentRecord {
                role: WorkerRole::Writer,
                status: AgentStatus::Error,
                payload: None,
                current_task: None,
                artifacts: vec![],
                updated_at: Utc::now(),
            }],
            escalations,
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_blocked_split() {
        let report = StatusReport::from_snapshot(&snapshot());
        assert_eq!(report.total_tasks, 4);
        assert_eq!(report.blocked_on_escalation, 1);
        assert_eq!(report.blocked_on_dependency, 3);
        // The writing task is blocked on a dependency, not on the worker.
        assert_eq!(report.blocked_on_worker_error, 0);
        assert_eq!(report.unresolved_escalations, 1);
        assert_eq!(report.stories_in(StoryStatus::InProgress), 1);
    }

    #[test]
    fn test_roles_listed_in_order() {
        let report = StatusReport::from_snapshot(&snapshot());
        assert_eq!(report.roles.len(), 5);
        assert_eq!(report.roles[0].role, WorkerRole::Researcher);
        assert!(report.roles[0].status.is_none());
        assert_eq!(report.roles[1].status, Some(AgentStatus::Error));
    }

    #[test]
    fn test_text_and_json() {
        let report = StatusReport::from_snapshot(&snapshot());
        let text = report.to_string();
        assert!(text.contains("Queue (4 tasks)"));
        assert!(text.contains("1 escalation"));
        assert!(text.contains("Unresolved escalations: 1"));
        assert!(text.contains("ambiguous_criteria"));

        let json = report.to_json().unwrap();
        assert_eq!(json["queue_depth"]["blocked"], 4);
        assert_eq!(json["unresolved_escalations"], 1);
    }
}
