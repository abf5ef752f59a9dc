use cadence_core::{AgentStatus, CompletionSignal, ValidationPayload, WorkerRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The latest status a worker role reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub role: WorkerRole,
    pub status: AgentStatus,
    /// Self-reported validation, only on `complete`.
    pub payload: Option<ValidationPayload>,
    /// The task the orchestrator last handed to this role.
    pub current_task: Option<Uuid>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Tracks the current status of every worker role.
///
/// Records are overwritten on each signal; nothing older than the current
/// task is kept. All access goes through one lock, so a reader never sees a
/// half-applied signal.
pub struct StatusRegistry {
    records: Arc<RwLock<HashMap<WorkerRole, AgentRecord>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Rebuild a registry from persisted records.
    pub fn from_records(records: Vec<AgentRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(
                records.into_iter().map(|r| (r.role, r)).collect(),
            )),
        }
    }

    /// Overwrite a role's record with a new status (last writer wins).
    ///
    /// The current task survives every status except `idle`, which means the
    /// worker let go of it.
    pub async fn signal(
        &self,
        role: WorkerRole,
        status: AgentStatus,
        payload: Option<ValidationPayload>,
    ) {
        let mut records = self.records.write().await;
        let current_task = match status {
            AgentStatus::Idle => None,
            _ => records.get(&role).and_then(|r| r.current_task),
        };
        records.insert(
            role,
            AgentRecord {
                role,
                status,
                payload,
                current_task,
                artifacts: Vec::new(),
                updated_at: Utc::now(),
            },
        );
    }

    /// Apply a validated inbound signal. Returns the record it replaced.
    pub async fn apply(&self, signal: &CompletionSignal) -> Option<AgentRecord> {
        let mut records = self.records.write().await;
        let previous = records.get(&signal.role).cloned();
        let current_task = match signal.status {
            AgentStatus::Idle => None,
            _ => previous.as_ref().and_then(|r| r.current_task),
        };
        records.insert(
            signal.role,
            AgentRecord {
                role: signal.role,
                status: signal.status,
                payload: signal.payload.clone(),
                current_task,
                artifacts: signal.artifacts.clone(),
                updated_at: Utc::now(),
            },
        );
        previous
    }

    /// Record that the orchestrator handed `task_id` to `role`.
    pub async fn assign(&self, role: WorkerRole, task_id: Uuid) {
        let mut records = self.records.write().await;
        records.insert(
            role,
            AgentRecord {
                role,
                status: AgentStatus::Assigned,
                payload: None,
                current_task: Some(task_id),
                artifacts: Vec::new(),
                updated_at: Utc::now(),
            },
        );
    }

    /// Detach the role from its task, keeping the reported status.
    pub async fn release(&self, role: WorkerRole) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&role) {
            record.current_task = None;
            record.updated_at = Utc::now();
        }
    }

    /// Current record for a role, or `None` if it never signaled.
    pub async fn poll(&self, role: WorkerRole) -> Option<AgentRecord> {
        let records = self.records.read().await;
        records.get(&role).cloned()
    }

    /// Roles currently reporting `blocked` or `error`.
    pub async fn detect_blocked(&self) -> BTreeSet<WorkerRole> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| matches!(r.status, AgentStatus::Blocked | AgentStatus::Error))
            .map(|r| r.role)
            .collect()
    }

    /// Roles that may receive a new assignment: not blocked, not erroring,
    /// and not holding a task.
    pub async fn available_roles(&self) -> BTreeSet<WorkerRole> {
        let records = self.records.read().await;
        WorkerRole::ALL
            .into_iter()
            .filter(|role| match records.get(role) {
                None => true,
                Some(r) => {
                    r.current_task.is_none()
                        && !matches!(r.status, AgentStatus::Blocked | AgentStatus::Error)
                }
            })
            .collect()
    }

    /// Snapshot of all records, in role order.
    pub async fn snapshot(&self) -> Vec<AgentRecord> {
        let records = self.records.read().await;
        let mut out: Vec<AgentRecord> = records.values().cloned().collect();
        out.sort_by_key(|r| r.role);
        out
    }

    /// Serialize the current state as JSON (for the status report).
    pub async fn to_json(&self) -> serde_json::Value {
        let records = self.snapshot().await;
        let blocked = self.detect_blocked().await;
        serde_json::json!({
            "agents": records,
            "blocked": blocked,
        })
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_before_any_signal() {
        let registry = StatusRegistry::new();
        assert!(registry.poll(WorkerRole::Writer).await.is_none());
        assert_eq!(registry.available_roles().await.len(), 5);
    }

    #[tokio::test]
    async fn test_signal_overwrites() {
        let registry = StatusRegistry::new();
        registry
            .signal(WorkerRole::Writer, AgentStatus::InProgress, None)
            .await;
        registry
            .signal(
                WorkerRole::Writer,
                AgentStatus::Complete,
                Some(ValidationPayload {
                    passed: true,
                    failed_checks: vec![],
                }),
            )
            .await;

        let record = registry.poll(WorkerRole::Writer).await.unwrap();
        assert_eq!(record.status, AgentStatus::Complete);
        assert!(record.payload.unwrap().passed);
    }

    #[tokio::test]
    async fn test_assign_keeps_task_until_idle() {
        let registry = StatusRegistry::new();
        let task_id = Uuid::new_v4();
        registry.assign(WorkerRole::Editor, task_id).await;
        assert!(!registry.available_roles().await.contains(&WorkerRole::Editor));

        registry
            .apply(&CompletionSignal::status(
                WorkerRole::Editor,
                AgentStatus::InProgress,
            ))
            .await;
        let record = registry.poll(WorkerRole::Editor).await.unwrap();
        assert_eq!(record.current_task, Some(task_id));

        registry
            .apply(&CompletionSignal::status(WorkerRole::Editor, AgentStatus::Idle))
            .await;
        let record = registry.poll(WorkerRole::Editor).await.unwrap();
        assert!(record.current_task.is_none());
        assert!(registry.available_roles().await.contains(&WorkerRole::Editor));
    }

    #[tokio::test]
    async fn test_apply_returns_previous_record() {
        let registry = StatusRegistry::new();
        let task_id = Uuid::new_v4();
        registry.assign(WorkerRole::Researcher, task_id).await;
        let previous = registry
            .apply(&CompletionSignal::complete(
                WorkerRole::Researcher,
                true,
                Vec::<String>::new(),
            ))
            .await
            .unwrap();
        assert_eq!(previous.status, AgentStatus::Assigned);
        assert_eq!(previous.current_task, Some(task_id));
    }

    #[tokio::test]
    async fn test_detect_blocked() {
        let registry = StatusRegistry::new();
        registry
            .signal(WorkerRole::Designer, AgentStatus::Error, None)
            .await;
        registry
            .signal(WorkerRole::Validator, AgentStatus::Blocked, None)
            .await;
        registry
            .signal(WorkerRole::Writer, AgentStatus::Idle, None)
            .await;

        let blocked = registry.detect_blocked().await;
        assert_eq!(blocked.len(), 2);
        assert!(blocked.contains(&WorkerRole::Designer));
        assert!(blocked.contains(&WorkerRole::Validator));

        let available = registry.available_roles().await;
        assert!(!available.contains(&WorkerRole::Designer));
        assert!(available.contains(&WorkerRole::Writer));
    }

    #[tokio::test]
    async fn test_release_frees_role() {
        let registry = StatusRegistry::new();
        registry.assign(WorkerRole::Writer, Uuid::new_v4()).await;
        registry.release(WorkerRole::Writer).await;
        assert!(registry.available_roles().await.contains(&WorkerRole::Writer));
    }

    #[tokio::test]
    async fn test_restore_from_records() {
        let registry = StatusRegistry::new();
        registry.assign(WorkerRole::Editor, Uuid::new_v4()).await;
        let restored = StatusRegistry::from_records(registry.snapshot().await);
        assert_eq!(restored.snapshot().await, registry.snapshot().await);
    }

    #[tokio::test]
    async fn test_to_json() {
        let registry = StatusRegistry::new();
        registry
            .signal(WorkerRole::Researcher, AgentStatus::Error, None)
            .await;
        let json = registry.to_json().await;
        assert!(json["agents"].is_array());
        assert_eq!(json["blocked"][0], "researcher");
    }
}
