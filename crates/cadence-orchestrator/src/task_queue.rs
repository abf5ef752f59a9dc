use crate::types::{BlockReason, Phase, Rejection, Story, Task, TaskStatus};
use cadence_core::{CadenceError, CadenceResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use uuid::Uuid;

/// Rejection rounds kept per task.
pub const REJECTION_HISTORY_CAP: usize = 10;

/// Extra data carried by a [`TaskQueue::transition`] request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TransitionPayload {
    #[default]
    None,
    /// Why the task is being blocked. Defaults to [`BlockReason::Dependency`].
    Block(BlockReason),
    /// Gate rejection reasons for a move to `needs_rework`.
    Rework(Vec<String>),
}

/// What a successful transition did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub previous: TaskStatus,
    pub current: TaskStatus,
    /// False when the request replayed a terminal state.
    pub changed: bool,
    /// Dependents flipped from blocked to pending by this transition.
    pub unblocked: Vec<Uuid>,
}

/// A task queue with dependency resolution and priority ordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskQueue {
    tasks: HashMap<Uuid, Task>,
    next_sequence: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue by expanding every story of a backlog.
    ///
    /// Fails on the first story lacking a priority tier or a size estimate.
    pub fn construct<'a, I>(stories: I) -> CadenceResult<Self>
    where
        I: IntoIterator<Item = &'a Story>,
    {
        let mut queue = Self::new();
        for story in stories {
            queue.expand_story(story)?;
        }
        Ok(queue)
    }

    /// Expand a story into one task per phase, in canonical order.
    ///
    /// research → writing → (editing ∥ graphics) → validation. Validation
    /// depends on writing and on every parallel finishing phase. Expanding a
    /// story twice returns the existing task ids.
    pub fn expand_story(&mut self, story: &Story) -> CadenceResult<Vec<Uuid>> {
        let mut missing = Vec::new();
        if story.priority.is_none() {
            missing.push("priority".to_string());
        }
        if story.size.is_none() {
            missing.push("size".to_string());
        }
        let priority = match story.priority {
            Some(p) if missing.is_empty() => p,
            _ => {
                return Err(CadenceError::MalformedStory {
                    story_id: story.id.clone(),
                    missing,
                })
            }
        };

        let existing = self.tasks_for_story(&story.id);
        if !existing.is_empty() {
            debug!(story_id = %story.id, "Story already expanded");
            return Ok(existing.iter().map(|t| t.id).collect());
        }

        let mut ids: HashMap<Phase, Uuid> = HashMap::new();
        let mut created = Vec::new();
        for phase in story.phases() {
            let deps: Vec<Uuid> = match phase {
                Phase::Research => vec![],
                Phase::Writing => vec![ids[&Phase::Research]],
                Phase::Editing | Phase::Graphics => vec![ids[&Phase::Writing]],
                Phase::Validation => [Phase::Writing, Phase::Editing, Phase::Graphics]
                    .iter()
                    .filter_map(|p| ids.get(p).copied())
                    .collect(),
            };
            let task = Task::new(story.id.clone(), phase, priority).with_dependencies(deps);
            ids.insert(phase, task.id);
            created.push(self.add(task));
        }

        debug!(story_id = %story.id, tasks = created.len(), "Story expanded");
        Ok(created)
    }

    /// Add a task to the queue. Tasks with unmet dependencies start blocked.
    pub fn add(&mut self, mut task: Task) -> Uuid {
        let id = task.id;
        task.sequence = self.next_sequence;
        self.next_sequence += 1;
        if task.status == TaskStatus::Pending && !self.dependencies_complete(&task) {
            task.status = TaskStatus::Blocked;
            task.block_reason = Some(BlockReason::Dependency);
        }
        self.tasks.insert(id, task);
        id
    }

    /// The highest-priority pending task whose dependencies are all complete.
    ///
    /// Ties go to the task inserted first. `None` is the normal answer while
    /// work is in flight.
    pub fn next_eligible(&self) -> Option<&Task> {
        self.next_eligible_where(|_| true)
    }

    /// Like [`next_eligible`](Self::next_eligible), restricted by `filter`.
    pub fn next_eligible_where<F>(&self, filter: F) -> Option<&Task>
    where
        F: Fn(&Task) -> bool,
    {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && self.dependencies_complete(t))
            .filter(|t| filter(t))
            .min_by_key(|t| (t.priority, t.sequence))
    }

    /// The next task that can be handed to a worker: pending-and-eligible or
    /// waiting for rework.
    pub fn next_assignable_where<F>(&self, filter: F) -> Option<&Task>
    where
        F: Fn(&Task) -> bool,
    {
        self.tasks
            .values()
            .filter(|t| match t.status {
                TaskStatus::Pending => self.dependencies_complete(t),
                TaskStatus::NeedsRework => true,
                _ => false,
            })
            .filter(|t| filter(t))
            .min_by_key(|t| (t.priority, t.sequence))
    }

    /// Apply a lifecycle transition.
    ///
    /// Illegal requests leave the task untouched. Completing a task flips
    /// every now-satisfied dependent to pending before returning. Replaying a
    /// terminal status is a no-op.
    pub fn transition(
        &mut self,
        id: Uuid,
        to: TaskStatus,
        payload: TransitionPayload,
    ) -> CadenceResult<TransitionOutcome> {
        let task = self.tasks.get(&id).ok_or(CadenceError::TaskNotFound(id))?;
        let from = task.status;

        if from == to && from.is_terminal() {
            debug!(task_id = %id, status = %from, "Replayed terminal transition ignored");
            return Ok(TransitionOutcome {
                previous: from,
                current: from,
                changed: false,
                unblocked: Vec::new(),
            });
        }

        let needs_deps = matches!(to, TaskStatus::Assigned | TaskStatus::InProgress);
        if !from.can_transition_to(to) || (needs_deps && !self.dependencies_complete(task)) {
            warn!(task_id = %id, from = %from, to = %to, "Refusing invalid transition");
            return Err(CadenceError::InvalidTransition {
                task_id: id,
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(CadenceError::TaskNotFound(id))?;
        task.status = to;
        task.updated_at = now;
        task.block_reason = None;
        match to {
            TaskStatus::Assigned => task.assigned_role = Some(task.phase.role()),
            TaskStatus::Pending | TaskStatus::Cancelled => task.assigned_role = None,
            TaskStatus::Blocked => {
                task.assigned_role = None;
                task.block_reason = Some(match payload {
                    TransitionPayload::Block(reason) => reason,
                    _ => BlockReason::Dependency,
                });
            }
            TaskStatus::NeedsRework => {
                task.consecutive_failures += 1;
                if let TransitionPayload::Rework(reasons) = payload {
                    task.rejection_history.push(Rejection {
                        attempt: task.consecutive_failures,
                        reasons,
                        at: now,
                    });
                    if task.rejection_history.len() > REJECTION_HISTORY_CAP {
                        let overflow = task.rejection_history.len() - REJECTION_HISTORY_CAP;
                        task.rejection_history.drain(..overflow);
                    }
                }
            }
            TaskStatus::Complete => task.completed_at = Some(now),
            TaskStatus::InProgress => {}
        }

        let unblocked = if to == TaskStatus::Complete {
            self.unblock_dependents(id)
        } else {
            Vec::new()
        };

        Ok(TransitionOutcome {
            previous: from,
            current: to,
            changed: true,
            unblocked,
        })
    }

    /// Flip dependents of `completed` whose dependencies are now all complete.
    fn unblock_dependents(&mut self, completed: Uuid) -> Vec<Uuid> {
        let ready: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.dependencies.contains(&completed))
            .filter(|t| {
                t.status == TaskStatus::Blocked && t.block_reason == Some(BlockReason::Dependency)
            })
            .filter(|t| self.dependencies_complete(t))
            .map(|t| t.id)
            .collect();

        let now = Utc::now();
        for id in &ready {
            if let Some(task) = self.tasks.get_mut(id) {
                task.status = TaskStatus::Pending;
                task.block_reason = None;
                task.updated_at = now;
            }
        }
        ready
    }

    /// Record a worker error against a task. Returns the running count.
    pub fn record_worker_failure(&mut self, id: Uuid) -> CadenceResult<u32> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(CadenceError::TaskNotFound(id))?;
        task.worker_failures += 1;
        task.updated_at = Utc::now();
        Ok(task.worker_failures)
    }

    /// Clear failure counters after an approval or an operator decision.
    pub fn reset_failures(&mut self, id: Uuid) -> CadenceResult<()> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(CadenceError::TaskNotFound(id))?;
        task.consecutive_failures = 0;
        task.worker_failures = 0;
        Ok(())
    }

    /// Cancel every non-terminal task of a story. Returns the cancelled ids.
    pub fn cancel_story(&mut self, story_id: &str) -> Vec<Uuid> {
        let now = Utc::now();
        let mut cancelled: Vec<&mut Task> = self
            .tasks
            .values_mut()
            .filter(|t| t.story_id == story_id && !t.status.is_terminal())
            .collect();
        cancelled.sort_by_key(|t| t.sequence);
        cancelled
            .into_iter()
            .map(|task| {
                task.status = TaskStatus::Cancelled;
                task.block_reason = None;
                task.assigned_role = None;
                task.updated_at = now;
                task.id
            })
            .collect()
    }

    /// Get a task by ID.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks of a story, in insertion order.
    pub fn tasks_for_story(&self, story_id: &str) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.story_id == story_id)
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// The task of `story_id` in `phase`, if expanded.
    pub fn find(&self, story_id: &str, phase: Phase) -> Option<&Task> {
        self.tasks
            .values()
            .find(|t| t.story_id == story_id && t.phase == phase)
    }

    /// List all tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Whether every dependency of `task` is complete.
    pub fn dependencies_complete(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Complete)
        })
    }

    /// Task count per status.
    pub fn count_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Total number of tasks.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Check if all tasks are in a terminal state.
    pub fn is_settled(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// Check for cycles in the dependency graph.
    /// Returns true if a cycle is detected.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        for &id in self.tasks.keys() {
            if self.dfs_cycle(id, &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle(&self, id: Uuid, visited: &mut HashMap<Uuid, u8>) -> bool {
        match visited.get(&id) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(&id) {
            for dep in &task.dependencies {
                if self.dfs_cycle(*dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn story(id: &str, priority: Priority) -> Story {
        Story::new(id, format!("Story {id}"))
            .with_priority(priority)
            .with_size(3)
            .with_criteria(["a", "b", "c"])
    }

    fn drive_to_complete(queue: &mut TaskQueue, id: Uuid) -> TransitionOutcome {
        queue
            .transition(id, TaskStatus::Assigned, TransitionPayload::None)
            .unwrap();
        queue
            .transition(id, TaskStatus::InProgress, TransitionPayload::None)
            .unwrap();
        queue
            .transition(id, TaskStatus::Complete, TransitionPayload::None)
            .unwrap()
    }

    #[test]
    fn test_empty_queue() {
        let queue = TaskQueue::new();
        assert_eq!(queue.total_count(), 0);
        assert!(queue.is_settled());
        assert!(queue.next_eligible().is_none());
    }

    #[test]
    fn test_expand_wires_canonical_dependencies() {
        let mut queue = TaskQueue::new();
        let s = story("S-1", Priority::P0).with_graphics();
        let ids = queue.expand_story(&s).unwrap();
        assert_eq!(ids.len(), 5);

        let research = queue.find("S-1", Phase::Research).unwrap();
        let writing = queue.find("S-1", Phase::Writing).unwrap();
        let editing = queue.find("S-1", Phase::Editing).unwrap();
        let graphics = queue.find("S-1", Phase::Graphics).unwrap();
        let validation = queue.find("S-1", Phase::Validation).unwrap();

        assert!(research.dependencies.is_empty());
        assert_eq!(research.status, TaskStatus::Pending);
        assert_eq!(writing.dependencies, vec![research.id]);
        assert_eq!(editing.dependencies, vec![writing.id]);
        assert_eq!(graphics.dependencies, vec![writing.id]);
        assert_eq!(
            validation.dependencies,
            vec![writing.id, editing.id, graphics.id]
        );
        assert_eq!(validation.status, TaskStatus::Blocked);
        assert_eq!(validation.block_reason, Some(BlockReason::Dependency));
        assert!(!queue.has_cycle());
    }

    #[test]
    fn test_expand_twice_is_idempotent() {
        let mut queue = TaskQueue::new();
        let s = story("S-1", Priority::P1);
        let first = queue.expand_story(&s).unwrap();
        let second = queue.expand_story(&s).unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.total_count(), 4);
    }

    #[test]
    fn test_construct_rejects_malformed_story() {
        let good = story("S-1", Priority::P1);
        let mut bad = story("S-2", Priority::P1);
        bad.priority = None;
        bad.size = None;
        let err = TaskQueue::construct([&good, &bad]).unwrap_err();
        match err {
            CadenceError::MalformedStory { story_id, missing } => {
                assert_eq!(story_id, "S-2");
                assert_eq!(missing, vec!["priority", "size"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_next_eligible_prefers_priority_then_insertion() {
        let stories = [
            story("S-low", Priority::P2),
            story("S-high", Priority::P0),
            story("S-high-2", Priority::P0),
        ];
        let queue = TaskQueue::construct(&stories).unwrap();
        let next = queue.next_eligible().unwrap();
        assert_eq!(next.story_id, "S-high");
        assert_eq!(next.phase, Phase::Research);
    }

    #[test]
    fn test_completion_unblocks_dependents() {
        let mut queue = TaskQueue::construct([&story("S-1", Priority::P1)]).unwrap();
        let research = queue.find("S-1", Phase::Research).unwrap().id;
        let writing = queue.find("S-1", Phase::Writing).unwrap().id;

        let outcome = drive_to_complete(&mut queue, research);
        assert_eq!(outcome.unblocked, vec![writing]);
        assert_eq!(queue.get(writing).unwrap().status, TaskStatus::Pending);
        assert_eq!(queue.next_eligible().unwrap().id, writing);
    }

    #[test]
    fn test_validation_waits_for_all_parallel_phases() {
        let mut queue = TaskQueue::construct([&story("S-1", Priority::P1).with_graphics()]).unwrap();
        for phase in [Phase::Research, Phase::Writing, Phase::Editing] {
            let id = queue.find("S-1", phase).unwrap().id;
            drive_to_complete(&mut queue, id);
        }
        let validation = queue.find("S-1", Phase::Validation).unwrap().id;
        assert_eq!(queue.get(validation).unwrap().status, TaskStatus::Blocked);

        let graphics = queue.find("S-1", Phase::Graphics).unwrap().id;
        let outcome = drive_to_complete(&mut queue, graphics);
        assert_eq!(outcome.unblocked, vec![validation]);
    }

    #[test]
    fn test_pending_to_complete_is_refused() {
        let mut queue = TaskQueue::construct([&story("S-1", Priority::P1)]).unwrap();
        let research = queue.find("S-1", Phase::Research).unwrap().id;
        let err = queue
            .transition(research, TaskStatus::Complete, TransitionPayload::None)
            .unwrap_err();
        assert!(matches!(err, CadenceError::InvalidTransition { .. }));
        assert_eq!(queue.get(research).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_cannot_start_with_incomplete_dependencies() {
        let mut queue = TaskQueue::construct([&story("S-1", Priority::P1)]).unwrap();
        let writing = queue.find("S-1", Phase::Writing).unwrap().id;
        // Blocked -> Pending is legal on its own, but assignment is not.
        queue
            .transition(writing, TaskStatus::Pending, TransitionPayload::None)
            .unwrap();
        let err = queue
            .transition(writing, TaskStatus::Assigned, TransitionPayload::None)
            .unwrap_err();
        assert!(matches!(err, CadenceError::InvalidTransition { .. }));
    }

    #[test]
    fn test_complete_replay_is_noop() {
        let mut queue = TaskQueue::construct([&story("S-1", Priority::P1)]).unwrap();
        let research = queue.find("S-1", Phase::Research).unwrap().id;
        drive_to_complete(&mut queue, research);

        let replay = queue
            .transition(research, TaskStatus::Complete, TransitionPayload::None)
            .unwrap();
        assert!(!replay.changed);
        assert!(replay.unblocked.is_empty());
    }

    #[test]
    fn test_rework_records_capped_history() {
        let mut queue = TaskQueue::construct([&story("S-1", Priority::P1)]).unwrap();
        let research = queue.find("S-1", Phase::Research).unwrap().id;
        queue
            .transition(research, TaskStatus::Assigned, TransitionPayload::None)
            .unwrap();

        for round in 0..12 {
            queue
                .transition(research, TaskStatus::InProgress, TransitionPayload::None)
                .unwrap();
            queue
                .transition(
                    research,
                    TaskStatus::NeedsRework,
                    TransitionPayload::Rework(vec![format!("check_{round}")]),
                )
                .unwrap();
            queue
                .transition(research, TaskStatus::Assigned, TransitionPayload::None)
                .unwrap();
        }

        let task = queue.get(research).unwrap();
        assert_eq!(task.consecutive_failures, 12);
        assert_eq!(task.rejection_history.len(), REJECTION_HISTORY_CAP);
        assert_eq!(task.rejection_history[0].reasons, vec!["check_2"]);
    }

    #[test]
    fn test_next_assignable_includes_rework() {
        let mut queue = TaskQueue::construct([&story("S-1", Priority::P1)]).unwrap();
        let research = queue.find("S-1", Phase::Research).unwrap().id;
        queue
            .transition(research, TaskStatus::Assigned, TransitionPayload::None)
            .unwrap();
        queue
            .transition(research, TaskStatus::InProgress, TransitionPayload::None)
            .unwrap();
        queue
            .transition(
                research,
                TaskStatus::NeedsRework,
                TransitionPayload::Rework(vec!["sources".into()]),
            )
            .unwrap();

        assert!(queue.next_eligible().is_none());
        assert_eq!(queue.next_assignable_where(|_| true).unwrap().id, research);
    }

    #[test]
    fn test_escalation_block_is_not_lifted_by_dependencies() {
        let mut queue = TaskQueue::construct([&story("S-1", Priority::P1)]).unwrap();
        let research = queue.find("S-1", Phase::Research).unwrap().id;
        let writing = queue.find("S-1", Phase::Writing).unwrap().id;
        queue
            .transition(
                writing,
                TaskStatus::Pending,
                TransitionPayload::None,
            )
            .unwrap();
        queue
            .transition(
                writing,
                TaskStatus::Blocked,
                TransitionPayload::Block(BlockReason::Escalation {
                    escalation_id: Uuid::new_v4(),
                }),
            )
            .unwrap();

        let outcome = drive_to_complete(&mut queue, research);
        assert!(outcome.unblocked.is_empty());
        assert!(queue.get(writing).unwrap().is_blocked_on_escalation());
    }

    #[test]
    fn test_cancel_story_skips_terminal_tasks() {
        let mut queue =
            TaskQueue::construct([&story("S-1", Priority::P1), &story("S-2", Priority::P1)])
                .unwrap();
        let research = queue.find("S-1", Phase::Research).unwrap().id;
        drive_to_complete(&mut queue, research);

        let cancelled = queue.cancel_story("S-1");
        assert_eq!(cancelled.len(), 3);
        assert_eq!(queue.get(research).unwrap().status, TaskStatus::Complete);
        assert_eq!(queue.count(TaskStatus::Cancelled), 3);
        assert!(queue
            .tasks_for_story("S-2")
            .iter()
            .all(|t| !t.status.is_terminal()));
    }

    #[test]
    fn test_cycle_detection() {
        let mut queue = TaskQueue::new();
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();

        let mut t1 = Task::new("S-1", Phase::Research, Priority::P1);
        t1.id = id1;
        t1.dependencies = vec![id2];

        let mut t2 = Task::new("S-1", Phase::Writing, Priority::P1);
        t2.id = id2;
        t2.dependencies = vec![id1];

        queue.add(t1);
        queue.add(t2);
        assert!(queue.has_cycle());
    }

    #[test]
    fn test_count_by_status() {
        let queue = TaskQueue::construct([&story("S-1", Priority::P1)]).unwrap();
        let counts = queue.count_by_status();
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Blocked), Some(&3));
    }
}
