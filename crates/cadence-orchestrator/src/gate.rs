use crate::backlog::Backlog;
use crate::task_queue::{TaskQueue, TransitionPayload};
use crate::types::{EscalationCategory, GateDecision, Story, StoryStatus, Task, TaskStatus};
use cadence_core::{CadenceError, CadenceResult, ValidationPayload};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Tunable thresholds and check classification for the quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatePolicy {
    /// At or above this many failed checks the gate escalates.
    #[serde(default = "default_escalate_at")]
    pub escalate_at_failures: usize,
    /// The n-th consecutive failure of one task escalates instead of rejecting.
    #[serde(default = "default_max_rejections")]
    pub max_consecutive_rejections: u32,
    #[serde(default = "default_min_criteria")]
    pub min_acceptance_criteria: usize,
    #[serde(default = "default_max_criteria")]
    pub max_acceptance_criteria: usize,
    /// Supported story-point estimates.
    #[serde(default = "default_sizes")]
    pub allowed_sizes: Vec<u32>,
    /// Titles treated as "not really a title" (case-insensitive).
    #[serde(default = "default_placeholders")]
    pub placeholder_titles: Vec<String>,
    /// Checks a worker can fix mechanically.
    #[serde(default = "default_fixable")]
    pub fixable_checks: Vec<String>,
    /// Checks that need human judgment.
    #[serde(default = "default_subjective")]
    pub subjective_checks: Vec<String>,
    /// Fail producing phases that report no artifact references.
    #[serde(default)]
    pub require_artifacts: bool,
}

fn default_escalate_at() -> usize {
    3
}
fn default_max_rejections() -> u32 {
    3
}
fn default_min_criteria() -> usize {
    3
}
fn default_max_criteria() -> usize {
    7
}
fn default_sizes() -> Vec<u32> {
    vec![1, 2, 3, 5, 8, 13]
}
fn default_placeholders() -> Vec<String> {
    ["tbd", "todo", "untitled", "new story", "placeholder", "xxx", "..."]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
fn default_fixable() -> Vec<String> {
    [
        "word_count",
        "missing_field",
        "required_field",
        "metadata",
        "format",
        "file_format",
        "spelling",
        "broken_links",
        "citation_format",
        "image_dimensions",
        "alt_text",
        "headline_length",
        "missing_artifact",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}
fn default_subjective() -> Vec<String> {
    [
        "tone",
        "structure",
        "sourcing",
        "voice",
        "style",
        "clarity",
        "accuracy",
        "relevance",
        "originality",
        "visual_quality",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            escalate_at_failures: default_escalate_at(),
            max_consecutive_rejections: default_max_rejections(),
            min_acceptance_criteria: default_min_criteria(),
            max_acceptance_criteria: default_max_criteria(),
            allowed_sizes: default_sizes(),
            placeholder_titles: default_placeholders(),
            fixable_checks: default_fixable(),
            subjective_checks: default_subjective(),
            require_artifacts: false,
        }
    }
}

impl GatePolicy {
    /// Whether a failed check can be fixed without human judgment.
    /// Unrecognised checks are treated as ambiguous.
    pub fn is_fixable(&self, check: &str) -> bool {
        let check = check.to_lowercase();
        !self.subjective_checks.iter().any(|c| *c == check)
            && self.fixable_checks.iter().any(|c| *c == check)
    }

    fn validate(&self) -> CadenceResult<()> {
        if self.escalate_at_failures == 0 || self.max_consecutive_rejections == 0 {
            return Err(CadenceError::Config(
                "gate thresholds must be at least 1".into(),
            ));
        }
        if self.min_acceptance_criteria > self.max_acceptance_criteria {
            return Err(CadenceError::Config(format!(
                "min_acceptance_criteria ({}) exceeds max_acceptance_criteria ({})",
                self.min_acceptance_criteria, self.max_acceptance_criteria
            )));
        }
        Ok(())
    }
}

/// Result of a Definition-of-Ready check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub story_id: String,
    /// Missing or invalid fields. Non-empty means the story is not ready.
    pub missing: Vec<String>,
    /// Dependency stories that are not done yet.
    pub waiting_on: Vec<String>,
    /// Open questions or unclear criteria that need an operator.
    pub ambiguities: Vec<String>,
}

impl ReadinessReport {
    /// Passes the checklist (ambiguities are judged separately).
    pub fn passed(&self) -> bool {
        self.missing.is_empty() && self.waiting_on.is_empty()
    }
}

/// What [`QualityGate::send_back_for_rework`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReworkOutcome {
    /// Task moved to `needs_rework`; `attempt` counts consecutive failures.
    Reworked { attempt: u32 },
    /// The bound was hit; the caller must escalate. The task is unchanged.
    ForceEscalate { attempts: u32 },
}

/// Definition-of-Ready / Definition-of-Done decisioning.
#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    policy: GatePolicy,
}

impl QualityGate {
    pub fn new(policy: GatePolicy) -> CadenceResult<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Swap in a new policy (hot reload). Invalid policies are refused.
    pub fn set_policy(&mut self, policy: GatePolicy) -> CadenceResult<()> {
        policy.validate()?;
        self.policy = policy;
        Ok(())
    }

    /// Check a story against the readiness checklist.
    pub fn readiness(&self, story: &Story, backlog: &Backlog) -> ReadinessReport {
        let policy = &self.policy;
        let mut report = ReadinessReport {
            story_id: story.id.clone(),
            ..Default::default()
        };

        let title = story.title.trim();
        if title.is_empty() {
            report.missing.push("title".into());
        } else if policy
            .placeholder_titles
            .iter()
            .any(|p| p.eq_ignore_ascii_case(title))
        {
            report.missing.push(format!("title (placeholder '{title}')"));
        }

        let criteria = story.acceptance_criteria.len();
        if criteria < policy.min_acceptance_criteria || criteria > policy.max_acceptance_criteria {
            report.missing.push(format!(
                "acceptance_criteria ({criteria}, expected {}-{})",
                policy.min_acceptance_criteria, policy.max_acceptance_criteria
            ));
        }

        match story.size {
            None => report.missing.push("size".into()),
            Some(size) if !policy.allowed_sizes.contains(&size) => {
                report.missing.push(format!("size ({size} not in {:?})", policy.allowed_sizes));
            }
            Some(_) => {}
        }

        if story.priority.is_none() {
            report.missing.push("priority".into());
        }

        let cycle = backlog.dependency_cycle(&story.id);
        if let Some(path) = &cycle {
            report
                .missing
                .push(format!("depends_on (cycle: {})", path.join(" -> ")));
        }
        for dep in &story.depends_on {
            match backlog.status_of(dep) {
                None => report.missing.push(format!("depends_on ({dep} unknown)")),
                Some(StoryStatus::Done) => {}
                Some(status @ (StoryStatus::Cancelled | StoryStatus::NotReady)) => report
                    .missing
                    .push(format!("depends_on ({dep} is {status})")),
                Some(_) if dep == &story.id => {
                    report.missing.push(format!("depends_on ({dep} is itself)"));
                }
                Some(_) if cycle.as_ref().is_some_and(|path| path.contains(dep)) => {}
                Some(_) => report.waiting_on.push(dep.clone()),
            }
        }

        for question in &story.open_questions {
            report.ambiguities.push(format!("open question: {question}"));
        }
        for criterion in &story.acceptance_criteria {
            let upper = criterion.to_uppercase();
            if criterion.trim().is_empty() || upper.contains("TBD") || criterion.contains("??") {
                report
                    .ambiguities
                    .push(format!("unclear criterion: '{criterion}'"));
            }
        }

        debug!(
            story_id = %story.id,
            missing = report.missing.len(),
            waiting = report.waiting_on.len(),
            ambiguities = report.ambiguities.len(),
            "Readiness checked"
        );
        report
    }

    /// Judge a finished deliverable.
    ///
    /// No failures approves. One or two fixable failures reject. Three or
    /// more, anything subjective, or a task that keeps failing escalates.
    pub fn completion(
        &self,
        task: &Task,
        payload: &ValidationPayload,
        artifacts: &[String],
    ) -> GateDecision {
        let policy = &self.policy;

        let mut failed: Vec<String> = Vec::new();
        for check in &payload.failed_checks {
            let check = check.trim().to_lowercase();
            if !failed.contains(&check) {
                failed.push(check);
            }
        }
        if policy.require_artifacts && task.phase.produces_artifact() && artifacts.is_empty() {
            failed.push("missing_artifact".into());
        }

        if failed.is_empty() {
            if payload.passed {
                return GateDecision::approve();
            }
            return GateDecision::escalate(
                EscalationCategory::ContradictoryReport,
                vec!["unspecified_failure".into()],
            );
        }

        if failed.len() >= policy.escalate_at_failures {
            return GateDecision::escalate(EscalationCategory::TooManyFailures, failed);
        }
        if failed.iter().any(|c| !policy.is_fixable(c)) {
            return GateDecision::escalate(EscalationCategory::AmbiguousCriteria, failed);
        }
        if task.consecutive_failures + 1 >= policy.max_consecutive_rejections {
            return GateDecision::escalate(EscalationCategory::RepeatedRejection, failed);
        }
        GateDecision::reject(failed)
    }

    /// Return a task to its worker with reasons attached.
    ///
    /// Refuses (and asks for escalation) once the task would reach the
    /// consecutive-failure bound.
    pub fn send_back_for_rework(
        &self,
        queue: &mut TaskQueue,
        task_id: Uuid,
        reasons: Vec<String>,
    ) -> CadenceResult<ReworkOutcome> {
        let task = queue
            .get(task_id)
            .ok_or(CadenceError::TaskNotFound(task_id))?;
        let attempts = task.consecutive_failures + 1;
        if attempts >= self.policy.max_consecutive_rejections {
            info!(task_id = %task_id, attempts, "Rework bound reached, escalating");
            return Ok(ReworkOutcome::ForceEscalate { attempts });
        }

        queue.transition(
            task_id,
            TaskStatus::NeedsRework,
            TransitionPayload::Rework(reasons),
        )?;
        Ok(ReworkOutcome::Reworked { attempt: attempts })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Decision, Phase, Priority};

    fn ready_story() -> Story {
        Story::new("S-1", "How we ship weekly")
            .with_priority(Priority::P0)
            .with_size(3)
            .with_criteria(["a", "b", "c", "d", "e"])
    }

    fn payload(passed: bool, checks: &[&str]) -> ValidationPayload {
        ValidationPayload {
            passed,
            failed_checks: checks.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    fn gate() -> QualityGate {
        QualityGate::default()
    }

    #[test]
    fn test_ready_story_passes() {
        let story = ready_story();
        let backlog = Backlog::new(vec![story.clone()]);
        let report = gate().readiness(&story, &backlog);
        assert!(report.passed(), "{report:?}");
        assert!(report.ambiguities.is_empty());
    }

    #[test]
    fn test_readiness_lists_every_missing_field() {
        let mut story = Story::new("S-2", "TBD").with_criteria(["only one"]);
        story.size = Some(4);
        let backlog = Backlog::new(vec![story.clone()]);
        let report = gate().readiness(&story, &backlog);
        assert!(!report.passed());
        assert_eq!(report.missing.len(), 4, "{:?}", report.missing);
        assert!(report.missing[0].starts_with("title"));
        assert!(report.missing.iter().any(|m| m.starts_with("acceptance_criteria")));
        assert!(report.missing.iter().any(|m| m.starts_with("size (4")));
        assert!(report.missing.iter().any(|m| m == "priority"));
    }

    #[test]
    fn test_too_many_criteria() {
        let story = ready_story().with_criteria(["1", "2", "3", "4", "5", "6", "7", "8"]);
        let backlog = Backlog::new(vec![story.clone()]);
        assert!(!gate().readiness(&story, &backlog).passed());
    }

    #[test]
    fn test_unresolved_dependency_waits() {
        let upstream = ready_story();
        let mut downstream = ready_story().depending_on("S-1");
        downstream.id = "S-2".into();
        let mut backlog = Backlog::new(vec![upstream, downstream.clone()]);

        let report = gate().readiness(&downstream, &backlog);
        assert!(report.missing.is_empty());
        assert_eq!(report.waiting_on, vec!["S-1"]);
        assert!(!report.passed());

        backlog.set_status("S-1", StoryStatus::Done).unwrap();
        assert!(gate().readiness(&downstream, &backlog).passed());

        backlog.set_status("S-1", StoryStatus::Cancelled).unwrap();
        let report = gate().readiness(&downstream, &backlog);
        assert!(report.missing[0].contains("cancelled"));
    }

    #[test]
    fn test_mutual_dependency_is_not_ready() {
        let mut first = ready_story().depending_on("S-2");
        first.id = "S-1".into();
        let mut second = ready_story().depending_on("S-1");
        second.id = "S-2".into();
        let backlog = Backlog::new(vec![first.clone(), second]);

        let report = gate().readiness(&first, &backlog);
        assert!(!report.passed());
        assert_eq!(report.missing, vec!["depends_on (cycle: S-1 -> S-2 -> S-1)"]);
        assert!(report.waiting_on.is_empty());
    }

    #[test]
    fn test_ambiguity_detection() {
        let story = ready_story()
            .with_criteria(["cites sources", "length TBD", "friendly"])
            .with_open_question("Which audience?");
        let backlog = Backlog::new(vec![story.clone()]);
        let report = gate().readiness(&story, &backlog);
        assert!(report.passed());
        assert_eq!(report.ambiguities.len(), 2);
    }

    #[test]
    fn test_completion_approves_clean_report() {
        let task = Task::new("S-1", Phase::Writing, Priority::P0);
        let decision = gate().completion(&task, &payload(true, &[]), &[]);
        assert_eq!(decision, GateDecision::approve());
    }

    #[test]
    fn test_single_fixable_failure_rejects() {
        let task = Task::new("S-1", Phase::Writing, Priority::P0);
        let decision = gate().completion(&task, &payload(false, &["word_count"]), &[]);
        assert_eq!(decision.decision, Decision::Reject);
        assert_eq!(decision.failed_criteria, vec!["word_count"]);
    }

    #[test]
    fn test_three_failures_escalate() {
        let task = Task::new("S-1", Phase::Writing, Priority::P0);
        let decision = gate().completion(
            &task,
            &payload(false, &["tone", "structure", "sourcing"]),
            &[],
        );
        assert_eq!(decision.decision, Decision::Escalate);
        assert_eq!(decision.category, Some(EscalationCategory::TooManyFailures));
    }

    #[test]
    fn test_subjective_failure_escalates() {
        let task = Task::new("S-1", Phase::Editing, Priority::P0);
        let decision = gate().completion(&task, &payload(false, &["tone"]), &[]);
        assert_eq!(decision.category, Some(EscalationCategory::AmbiguousCriteria));
    }

    #[test]
    fn test_unknown_check_is_ambiguous() {
        let task = Task::new("S-1", Phase::Editing, Priority::P0);
        let decision = gate().completion(&task, &payload(false, &["vibes"]), &[]);
        assert_eq!(decision.decision, Decision::Escalate);
    }

    #[test]
    fn test_duplicate_checks_count_once() {
        let task = Task::new("S-1", Phase::Editing, Priority::P0);
        let decision = gate().completion(
            &task,
            &payload(false, &["format", "FORMAT", "spelling"]),
            &[],
        );
        assert_eq!(decision.decision, Decision::Reject);
        assert_eq!(decision.failed_criteria.len(), 2);
    }

    #[test]
    fn test_failure_without_checks_is_contradictory() {
        let task = Task::new("S-1", Phase::Research, Priority::P0);
        let decision = gate().completion(&task, &payload(false, &[]), &[]);
        assert_eq!(decision.category, Some(EscalationCategory::ContradictoryReport));
    }

    #[test]
    fn test_third_consecutive_failure_escalates() {
        let mut task = Task::new("S-1", Phase::Writing, Priority::P0);
        task.consecutive_failures = 2;
        let decision = gate().completion(&task, &payload(false, &["word_count"]), &[]);
        assert_eq!(decision.category, Some(EscalationCategory::RepeatedRejection));
    }

    #[test]
    fn test_required_artifacts() {
        let policy = GatePolicy {
            require_artifacts: true,
            ..Default::default()
        };
        let gate = QualityGate::new(policy).unwrap();
        let writing = Task::new("S-1", Phase::Writing, Priority::P0);
        let decision = gate.completion(&writing, &payload(true, &[]), &[]);
        assert_eq!(decision, GateDecision::reject(vec!["missing_artifact".into()]));

        let ok = gate.completion(&writing, &payload(true, &[]), &["drafts/s1.md".into()]);
        assert_eq!(ok.decision, Decision::Approve);

        let validation = Task::new("S-1", Phase::Validation, Priority::P0);
        assert_eq!(
            gate.completion(&validation, &payload(true, &[]), &[]).decision,
            Decision::Approve
        );
    }

    #[test]
    fn test_configurable_threshold() {
        let policy = GatePolicy {
            escalate_at_failures: 5,
            ..Default::default()
        };
        let gate = QualityGate::new(policy).unwrap();
        let task = Task::new("S-1", Phase::Editing, Priority::P0);
        let decision = gate.completion(
            &task,
            &payload(false, &["format", "spelling", "metadata"]),
            &[],
        );
        assert_eq!(decision.decision, Decision::Reject);
    }

    #[test]
    fn test_invalid_policy_refused() {
        let policy = GatePolicy {
            min_acceptance_criteria: 9,
            ..Default::default()
        };
        assert!(QualityGate::new(policy).is_err());
    }

    #[test]
    fn test_send_back_for_rework_is_bounded() {
        let story = ready_story();
        let mut queue = TaskQueue::construct([&story]).unwrap();
        let id = queue.find("S-1", Phase::Research).unwrap().id;
        let gate = gate();

        queue
            .transition(id, TaskStatus::Assigned, TransitionPayload::None)
            .unwrap();
        for expected in 1..=2 {
            queue
                .transition(id, TaskStatus::InProgress, TransitionPayload::None)
                .unwrap();
            let outcome = gate
                .send_back_for_rework(&mut queue, id, vec!["word_count".into()])
                .unwrap();
            assert_eq!(outcome, ReworkOutcome::Reworked { attempt: expected });
            queue
                .transition(id, TaskStatus::Assigned, TransitionPayload::None)
                .unwrap();
        }

        queue
            .transition(id, TaskStatus::InProgress, TransitionPayload::None)
            .unwrap();
        let outcome = gate
            .send_back_for_rework(&mut queue, id, vec!["word_count".into()])
            .unwrap();
        assert_eq!(outcome, ReworkOutcome::ForceEscalate { attempts: 3 });
        assert_eq!(queue.get(id).unwrap().status, TaskStatus::InProgress);
        assert_eq!(queue.get(id).unwrap().rejection_history.len(), 2);
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: GatePolicy = toml::from_str("escalate_at_failures = 4").unwrap();
        assert_eq!(policy.escalate_at_failures, 4);
        assert_eq!(policy.max_consecutive_rejections, 3);
        assert!(policy.is_fixable("word_count"));
        assert!(!policy.is_fixable("tone"));
    }
}
