use crate::backlog::Backlog;
use crate::dispatch::{Assignment, WorkerDispatcher};
use crate::escalation::{EscalationManager, ResolutionOutcome};
use crate::gate::{GatePolicy, QualityGate, ReworkOutcome};
use crate::registry::StatusRegistry;
use crate::report::StatusReport;
use crate::store::{Snapshot, StateStore};
use crate::task_queue::{TaskQueue, TransitionPayload};
use crate::types::{Decision, Escalation, EscalationCategory, StoryStatus, TaskStatus};
use cadence_core::{
    AgentStatus, CadenceError, CadenceResult, CompletionSignal, ResolutionDecision,
    ResolutionRequest,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Loop pacing and retry bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// The n-th worker error on one task escalates instead of retrying.
    #[serde(default = "default_retry_limit")]
    pub worker_retry_limit: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Stop after this many iterations. Unbounded when absent.
    #[serde(default)]
    pub max_iterations: Option<u64>,
}

fn default_retry_limit() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    50
}
fn default_max_backoff() -> u64 {
    2000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_retry_limit: default_retry_limit(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_iterations: None,
        }
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationOutcome {
    pub admitted: usize,
    pub not_ready: usize,
    pub resolutions: usize,
    pub signals: usize,
    pub approved: usize,
    pub rejected: usize,
    pub escalated: usize,
    pub assigned: usize,
    pub stories_done: usize,
}

impl IterationOutcome {
    pub fn made_progress(&self) -> bool {
        self.admitted
            + self.not_ready
            + self.resolutions
            + self.signals
            + self.approved
            + self.rejected
            + self.escalated
            + self.assigned
            + self.stories_done
            > 0
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every story is done, cancelled or not ready.
    Settled,
    Shutdown,
    IterationLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub iterations: u64,
    pub stop: StopReason,
}

/// The pipeline orchestrator.
///
/// Owns the backlog, task queue, status registry and escalation store. One
/// logical control loop drives everything; workers run out of band and talk
/// back through the signal channel.
///
/// Locks are always taken in the order backlog, queue, escalations. The
/// registry guards itself and never reaches into the other stores.
pub struct Orchestrator {
    backlog: Arc<RwLock<Backlog>>,
    queue: Arc<RwLock<TaskQueue>>,
    registry: Arc<StatusRegistry>,
    escalations: Arc<RwLock<EscalationManager>>,
    gate: Arc<RwLock<QualityGate>>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    store: Arc<dyn StateStore>,
    config: SchedulerConfig,
    signal_tx: mpsc::UnboundedSender<CompletionSignal>,
    signal_rx: Mutex<mpsc::UnboundedReceiver<CompletionSignal>>,
    resolution_tx: mpsc::UnboundedSender<ResolutionRequest>,
    resolution_rx: Mutex<mpsc::UnboundedReceiver<ResolutionRequest>>,
}

impl Orchestrator {
    /// Start fresh from a backlog with the default gate policy.
    pub fn new(
        backlog: Backlog,
        dispatcher: Arc<dyn WorkerDispatcher>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self::from_parts(
            backlog,
            TaskQueue::new(),
            StatusRegistry::new(),
            EscalationManager::new(),
            dispatcher,
            store,
        )
    }

    fn from_parts(
        backlog: Backlog,
        queue: TaskQueue,
        registry: StatusRegistry,
        escalations: EscalationManager,
        dispatcher: Arc<dyn WorkerDispatcher>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (resolution_tx, resolution_rx) = mpsc::unbounded_channel();
        Self {
            backlog: Arc::new(RwLock::new(backlog)),
            queue: Arc::new(RwLock::new(queue)),
            registry: Arc::new(registry),
            escalations: Arc::new(RwLock::new(escalations)),
            gate: Arc::new(RwLock::new(QualityGate::default())),
            dispatcher,
            store,
            config: SchedulerConfig::default(),
            signal_tx,
            signal_rx: Mutex::new(signal_rx),
            resolution_tx,
            resolution_rx: Mutex::new(resolution_rx),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_gate_policy(mut self, policy: GatePolicy) -> CadenceResult<Self> {
        self.gate = Arc::new(RwLock::new(QualityGate::new(policy)?));
        Ok(self)
    }

    /// Resume from persisted state, or start from `backlog` if there is none.
    ///
    /// Stories in `backlog` that the persisted state does not know are added;
    /// known stories keep their persisted progress.
    pub async fn resume(
        store: Arc<dyn StateStore>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        backlog: Option<Backlog>,
    ) -> CadenceResult<Self> {
        match store.load().await? {
            Some(snapshot) => {
                if snapshot.queue.has_cycle() {
                    return Err(CadenceError::StateCorrupted(
                        "dependency cycle in persisted task queue".into(),
                    ));
                }
                let mut restored = snapshot.backlog;
                if let Some(incoming) = backlog {
                    let added = restored.merge_new(incoming);
                    if added > 0 {
                        info!(added, "New stories merged into persisted backlog");
                    }
                }
                info!(
                    saved_at = %snapshot.saved_at,
                    tasks = snapshot.queue.total_count(),
                    "Resuming from persisted state"
                );
                Ok(Self::from_parts(
                    restored,
                    snapshot.queue,
                    StatusRegistry::from_records(snapshot.agents),
                    snapshot.escalations,
                    dispatcher,
                    store,
                ))
            }
            None => {
                let backlog = backlog.ok_or_else(|| {
                    CadenceError::Config("no persisted state and no backlog to start from".into())
                })?;
                Ok(Self::new(backlog, dispatcher, store))
            }
        }
    }

    /// Sender for worker signals. Signals are applied in send order.
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<CompletionSignal> {
        self.signal_tx.clone()
    }

    /// Sender for operator resolutions, applied on the next iteration.
    pub fn resolution_sender(&self) -> mpsc::UnboundedSender<ResolutionRequest> {
        self.resolution_tx.clone()
    }

    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<RwLock<TaskQueue>> {
        &self.queue
    }

    pub fn backlog(&self) -> &Arc<RwLock<Backlog>> {
        &self.backlog
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Replace the gate policy while the loop runs. Invalid policies are refused.
    pub async fn set_gate_policy(&self, policy: GatePolicy) -> CadenceResult<()> {
        self.gate.write().await.set_policy(policy)?;
        info!("Gate policy updated");
        Ok(())
    }

    pub async fn gate_policy(&self) -> GatePolicy {
        self.gate.read().await.policy().clone()
    }

    /// Pending escalations, most urgent first.
    pub async fn unresolved_escalations(&self) -> Vec<Escalation> {
        self.escalations
            .read()
            .await
            .unresolved()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn is_settled(&self) -> bool {
        self.backlog.read().await.is_settled()
    }

    /// Apply an operator decision immediately.
    pub async fn resolve(&self, request: ResolutionRequest) -> CadenceResult<ResolutionOutcome> {
        let mut backlog = self.backlog.write().await;
        let mut queue = self.queue.write().await;
        let mut escalations = self.escalations.write().await;

        let outcome = escalations.resolve(&mut queue, &request)?;
        match (outcome.decision, outcome.task_id) {
            (ResolutionDecision::Reject, _) => {
                if let Some(story) = backlog.get_mut(&outcome.story_id) {
                    story.status = StoryStatus::Cancelled;
                }
                info!(story_id = %outcome.story_id, cancelled = outcome.cancelled_tasks.len(), "Story rejected by operator");
            }
            (ResolutionDecision::Approve, None) => {
                if backlog.status_of(&outcome.story_id) == Some(StoryStatus::AwaitingDecision) {
                    backlog.set_status(&outcome.story_id, StoryStatus::Cleared)?;
                }
            }
            (ResolutionDecision::Approve, Some(_)) => {}
        }
        Ok(outcome)
    }

    /// Run one iteration of the control loop.
    pub async fn tick(&self) -> CadenceResult<IterationOutcome> {
        let mut outcome = IterationOutcome::default();
        let gate = self.gate.read().await.clone();

        self.admit_stories(&gate, &mut outcome).await;
        self.drain_resolutions(&mut outcome).await;
        self.drain_signals(&gate, &mut outcome).await;
        self.update_stories(&mut outcome).await;
        self.assign_work(&mut outcome).await;

        if outcome.made_progress() {
            self.persist().await?;
        }
        Ok(outcome)
    }

    /// Run until settled, shut down, or out of iterations.
    ///
    /// Backs off exponentially while idle. Only fatal errors end the loop with
    /// an error; anything else is logged and the loop carries on.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> CadenceResult<RunSummary> {
        let initial = Duration::from_millis(self.config.initial_backoff_ms);
        let max = Duration::from_millis(self.config.max_backoff_ms);
        let mut backoff = initial;
        let mut iterations = 0u64;

        info!("Orchestrator loop started");
        let stop = loop {
            if *shutdown.borrow() {
                break StopReason::Shutdown;
            }
            if self.config.max_iterations.is_some_and(|limit| iterations >= limit) {
                break StopReason::IterationLimit;
            }
            iterations += 1;

            let outcome = match self.tick().await {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal error, halting loop");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Iteration failed");
                    IterationOutcome::default()
                }
            };

            if self.is_settled().await {
                break StopReason::Settled;
            }
            if outcome.made_progress() {
                backoff = initial;
                continue;
            }

            debug!(backoff = ?backoff, "Nothing to do, backing off");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = shutdown.changed() => {
                    // Sender gone: nobody can ask us to stop any more.
                    if changed.is_err() {
                        break StopReason::Shutdown;
                    }
                }
            }
            backoff = (backoff * 2).min(max);
        };

        self.persist().await?;
        info!(iterations, stop = ?stop, "Orchestrator loop stopped");
        Ok(RunSummary { iterations, stop })
    }

    /// Tick without sleeping until settled or `max_iterations` is reached.
    ///
    /// Yields between iterations so in-process workers get to answer.
    pub async fn run_until_settled(&self, max_iterations: u64) -> CadenceResult<RunSummary> {
        for iteration in 1..=max_iterations {
            self.tick().await?;
            if self.is_settled().await {
                return Ok(RunSummary {
                    iterations: iteration,
                    stop: StopReason::Settled,
                });
            }
            tokio::task::yield_now().await;
        }
        Ok(RunSummary {
            iterations: max_iterations,
            stop: StopReason::IterationLimit,
        })
    }

    /// Consistent copy of every store.
    pub async fn snapshot(&self) -> Snapshot {
        let backlog = self.backlog.read().await;
        let queue = self.queue.read().await;
        let escalations = self.escalations.read().await;
        Snapshot {
            backlog: backlog.clone(),
            queue: queue.clone(),
            agents: self.registry.snapshot().await,
            escalations: escalations.clone(),
            saved_at: Utc::now(),
        }
    }

    pub async fn status_report(&self) -> StatusReport {
        StatusReport::from_snapshot(&self.snapshot().await)
    }

    async fn persist(&self) -> CadenceResult<()> {
        let snapshot = self.snapshot().await;
        self.store.save(&snapshot).await
    }

    /// Readiness-check new or cleared stories and expand the ones that pass.
    async fn admit_stories(&self, gate: &QualityGate, outcome: &mut IterationOutcome) {
        let mut backlog = self.backlog.write().await;
        let mut queue = self.queue.write().await;
        let mut escalations = self.escalations.write().await;

        let candidates: Vec<(String, StoryStatus)> = backlog
            .awaiting_admission()
            .iter()
            .map(|s| (s.id.clone(), s.status))
            .collect();

        for (story_id, status) in candidates {
            let Some(story) = backlog.get(&story_id) else {
                continue;
            };
            let report = gate.readiness(story, &backlog);

            if !report.missing.is_empty() {
                warn!(story_id = %story_id, missing = ?report.missing, "Story not ready");
                if let Some(story) = backlog.get_mut(&story_id) {
                    story.status = StoryStatus::NotReady;
                    story.readiness_issues = report.missing;
                }
                outcome.not_ready += 1;
                continue;
            }
            if !report.waiting_on.is_empty() {
                debug!(story_id = %story_id, waiting_on = ?report.waiting_on, "Story waiting on dependencies");
                continue;
            }
            if status == StoryStatus::Backlog && !report.ambiguities.is_empty() {
                escalations.create_for_story(
                    story,
                    EscalationCategory::StoryAmbiguity,
                    report.ambiguities,
                );
                if let Some(story) = backlog.get_mut(&story_id) {
                    story.status = StoryStatus::AwaitingDecision;
                }
                outcome.escalated += 1;
                continue;
            }

            let expanded = queue.expand_story(story);
            let Some(story) = backlog.get_mut(&story_id) else {
                continue;
            };
            match expanded {
                Ok(ids) => {
                    info!(story_id = %story_id, tasks = ids.len(), "Story admitted");
                    story.status = StoryStatus::InProgress;
                    story.readiness_issues.clear();
                    outcome.admitted += 1;
                }
                Err(e) => {
                    warn!(story_id = %story_id, error = %e, "Story could not be expanded");
                    story.status = StoryStatus::NotReady;
                    story.readiness_issues = vec![e.to_string()];
                    outcome.not_ready += 1;
                }
            }
        }
    }

    async fn drain_resolutions(&self, outcome: &mut IterationOutcome) {
        let pending: Vec<ResolutionRequest> = {
            let mut rx = self.resolution_rx.lock().await;
            let mut pending = Vec::new();
            while let Ok(request) = rx.try_recv() {
                pending.push(request);
            }
            pending
        };

        for request in pending {
            let id = request.escalation_id;
            match self.resolve(request).await {
                Ok(_) => outcome.resolutions += 1,
                Err(e) => warn!(escalation_id = %id, error = %e, "Resolution refused"),
            }
        }
    }

    async fn drain_signals(&self, gate: &QualityGate, outcome: &mut IterationOutcome) {
        let pending: Vec<CompletionSignal> = {
            let mut rx = self.signal_rx.lock().await;
            let mut pending = Vec::new();
            while let Ok(signal) = rx.try_recv() {
                pending.push(signal);
            }
            pending
        };

        for signal in pending {
            outcome.signals += 1;
            if let Err(e) = self.apply_signal(gate, &signal, outcome).await {
                warn!(role = %signal.role, status = %signal.status, error = %e, "Signal not applied");
            }
        }
    }

    /// Apply one worker signal to the registry and, through it, to the task
    /// the role holds.
    async fn apply_signal(
        &self,
        gate: &QualityGate,
        signal: &CompletionSignal,
        outcome: &mut IterationOutcome,
    ) -> CadenceResult<()> {
        // Signals are checked against the queue before they touch the registry.
        let held = self
            .registry
            .poll(signal.role)
            .await
            .and_then(|r| r.current_task);
        let Some(task_id) = signal.task_id.or(held) else {
            debug!(role = %signal.role, status = %signal.status, "Signal without a task");
            self.registry.apply(signal).await;
            return Ok(());
        };
        if held.is_some_and(|h| h != task_id) {
            warn!(role = %signal.role, task_id = %task_id, "Signal names a task the role does not hold, ignored");
            return Ok(());
        }

        let mut queue = self.queue.write().await;
        let task = queue.get(task_id).ok_or(CadenceError::TaskNotFound(task_id))?;
        if task.role() != signal.role {
            return Err(CadenceError::InvalidSignal(format!(
                "{} reported on a {} task",
                signal.role, task.phase
            )));
        }
        let status = task.status;
        self.registry.apply(signal).await;

        if status.is_terminal() {
            debug!(task_id = %task_id, status = %status, "Late signal for a finished task discarded");
            if held == Some(task_id) && signal.status != AgentStatus::InProgress {
                self.registry.release(signal.role).await;
            }
            return Ok(());
        }

        match signal.status {
            AgentStatus::Assigned | AgentStatus::Blocked => {}
            AgentStatus::Idle => {
                if status.is_active() {
                    warn!(task_id = %task_id, role = %signal.role, "Worker went idle holding a task, returned to queue");
                    queue.transition(task_id, TaskStatus::Pending, TransitionPayload::None)?;
                }
            }
            AgentStatus::InProgress => {
                if status == TaskStatus::Assigned {
                    queue.transition(task_id, TaskStatus::InProgress, TransitionPayload::None)?;
                }
            }
            AgentStatus::Error => {
                if !status.is_active() {
                    return Ok(());
                }
                queue.transition(task_id, TaskStatus::Pending, TransitionPayload::None)?;
                let failures = queue.record_worker_failure(task_id)?;
                self.registry.release(signal.role).await;
                warn!(task_id = %task_id, role = %signal.role, failures, "Worker error, task returned to queue");

                if failures >= self.config.worker_retry_limit {
                    let category = EscalationCategory::WorkerFailure;
                    self.escalations.write().await.create(
                        &mut queue,
                        task_id,
                        category,
                        category.recommendation(),
                        vec![format!("{failures} worker errors in a row")],
                    )?;
                    outcome.escalated += 1;
                }
            }
            AgentStatus::Complete => {
                if status == TaskStatus::Assigned {
                    queue.transition(task_id, TaskStatus::InProgress, TransitionPayload::None)?;
                } else if status != TaskStatus::InProgress {
                    warn!(task_id = %task_id, status = %status, "Completion for a task that is not in progress, ignored");
                    return Ok(());
                }
                let payload = signal.payload.as_ref().ok_or_else(|| {
                    CadenceError::InvalidSignal("complete signal without payload".into())
                })?;
                let task = queue
                    .get(task_id)
                    .cloned()
                    .ok_or(CadenceError::TaskNotFound(task_id))?;
                let decision = gate.completion(&task, payload, &signal.artifacts);
                info!(
                    task_id = %task_id,
                    story_id = %task.story_id,
                    phase = %task.phase,
                    decision = %decision.decision,
                    failed = ?decision.failed_criteria,
                    "Completion checked"
                );

                let escalate_as = match decision.decision {
                    Decision::Approve => {
                        let done = queue.transition(
                            task_id,
                            TaskStatus::Complete,
                            TransitionPayload::None,
                        )?;
                        queue.reset_failures(task_id)?;
                        if !done.unblocked.is_empty() {
                            debug!(task_id = %task_id, unblocked = done.unblocked.len(), "Dependents unblocked");
                        }
                        outcome.approved += 1;
                        None
                    }
                    Decision::Reject => match gate.send_back_for_rework(
                        &mut queue,
                        task_id,
                        decision.failed_criteria.clone(),
                    )? {
                        ReworkOutcome::Reworked { attempt } => {
                            info!(task_id = %task_id, attempt, "Sent back for rework");
                            outcome.rejected += 1;
                            None
                        }
                        ReworkOutcome::ForceEscalate { .. } => {
                            Some(EscalationCategory::RepeatedRejection)
                        }
                    },
                    Decision::Escalate => Some(
                        decision
                            .category
                            .unwrap_or(EscalationCategory::AmbiguousCriteria),
                    ),
                };

                if let Some(category) = escalate_as {
                    self.escalations.write().await.create(
                        &mut queue,
                        task_id,
                        category,
                        category.recommendation(),
                        decision.failed_criteria,
                    )?;
                    outcome.escalated += 1;
                }
                self.registry.release(signal.role).await;
            }
        }
        Ok(())
    }

    /// Mark stories done once every task is complete.
    async fn update_stories(&self, outcome: &mut IterationOutcome) {
        let mut backlog = self.backlog.write().await;
        let queue = self.queue.read().await;
        for story in backlog
            .stories
            .iter_mut()
            .filter(|s| s.status == StoryStatus::InProgress)
        {
            let tasks = queue.tasks_for_story(&story.id);
            if !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Complete) {
                story.status = StoryStatus::Done;
                outcome.stories_done += 1;
                info!(story_id = %story.id, "Story done");
            }
        }
    }

    /// Hand the most urgent assignable task of each free role to a worker.
    async fn assign_work(&self, outcome: &mut IterationOutcome) {
        let mut available = self.registry.available_roles().await;
        if available.is_empty() {
            return;
        }

        let mut assignments: Vec<Assignment> = Vec::new();
        {
            let backlog = self.backlog.read().await;
            let mut queue = self.queue.write().await;
            while let Some(task) = queue.next_assignable_where(|t| available.contains(&t.role())) {
                let assignment = Assignment {
                    task_id: task.id,
                    story_id: task.story_id.clone(),
                    story_title: backlog
                        .get(&task.story_id)
                        .map(|s| s.title.clone())
                        .unwrap_or_default(),
                    phase: task.phase,
                    role: task.role(),
                    priority: task.priority,
                    rework_reasons: task.accumulated_reasons(),
                    attempt: task.consecutive_failures + 1,
                };
                available.remove(&assignment.role);
                if let Err(e) = queue.transition(
                    assignment.task_id,
                    TaskStatus::Assigned,
                    TransitionPayload::None,
                ) {
                    warn!(task_id = %assignment.task_id, error = %e, "Could not assign task");
                    continue;
                }
                assignments.push(assignment);
            }
        }

        for assignment in assignments {
            let (task_id, role) = (assignment.task_id, assignment.role);
            self.registry.assign(role, task_id).await;
            match self.dispatcher.dispatch(assignment).await {
                Ok(()) => {
                    info!(task_id = %task_id, role = %role, "Task assigned");
                    outcome.assigned += 1;
                }
                Err(e) => {
                    warn!(task_id = %task_id, role = %role, error = %e, "Dispatch failed, task returned to queue");
                    let mut queue = self.queue.write().await;
                    if let Err(e) =
                        queue.transition(task_id, TaskStatus::Pending, TransitionPayload::None)
                    {
                        warn!(task_id = %task_id, error = %e, "Could not return task to queue");
                    }
                    self.registry.release(role).await;
                }
            }
        }
    }

    #[cfg(test)]
    async fn task_status(&self, id: uuid::Uuid) -> Option<TaskStatus> {
        self.queue.read().await.get(id).map(|t| t.status)
    }
}
