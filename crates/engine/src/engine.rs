//! Engine facade.
//!
//! `Engine` aggregates the event log, task matchers, activity supervisor,
//! deadline wheel, visibility index, and schedule store, and exposes the
//! client RPC surface (start, signal, update, query, cancel, terminate,
//! describe, list, result) and the worker RPC surface (poll, complete, fail,
//! heartbeat). Workflow-lifecycle operations live in [`crate::machine`],
//! message routing in [`crate::router`], schedules in [`crate::schedule`];
//! all of them are `impl Engine` blocks over the shared inner state.
//!
//! The engine must be created inside a tokio runtime: it spawns the deadline
//! sweeper on construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::activity::{ActivitySupervisor, FailureVerdict, HeartbeatVerdict};
use crate::dispatch::{QueuedActivity, TaskMatcher, WorkflowTask};
use crate::error::{EngineError, EngineResult, Failure, FailureKind, TimeoutKind};
use crate::history::{EventAttributes, HistoryEvent, Outcome};
use crate::machine::state::WorkflowState;
use crate::schedule::ScheduleStore;
use crate::store::{EventLogStore, InMemoryEventLog};
use crate::timers::{Deadline, DeadlineWheel};
use crate::types::ExecutionStatus;
use crate::visibility::{ExecutionInfo, ListFilter, VisibilityIndex};
use crate::worker::{ActivityContext, ActivityTask, WorkerRegistry};

/// Link from a child run back to the awaiting parent.
#[derive(Debug, Clone)]
pub(crate) struct ParentLink {
    pub run_id: Uuid,
    pub child_workflow_id: String,
}

/// Outstanding workflow task bookkeeping: at most one in flight per run.
#[derive(Debug, Default)]
pub(crate) struct WftState {
    pub outstanding: Option<Uuid>,
    /// A trigger arrived while a task was in flight; schedule another on
    /// completion.
    pub again: bool,
}

/// Mutable per-run bookkeeping outside the event log.
pub(crate) struct ExecutionMeta {
    pub namespace: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: ExecutionStatus,
    pub parent: Option<ParentLink>,
    pub continued_to: Option<Uuid>,
    pub wft: WftState,
    pub close_tx: watch::Sender<ExecutionStatus>,
}

/// Run table: per-run meta plus the current-run index that enforces the
/// one-current-run-per-workflow-id invariant.
#[derive(Default)]
pub(crate) struct RunTable {
    pub executions: HashMap<Uuid, ExecutionMeta>,
    pub current: HashMap<(String, String), Uuid>,
}

pub(crate) struct EngineInner {
    pub log: Arc<dyn EventLogStore>,
    pub registry: Arc<WorkerRegistry>,
    pub wf_matcher: TaskMatcher<WorkflowTask>,
    pub act_matcher: TaskMatcher<QueuedActivity>,
    pub supervisor: ActivitySupervisor,
    pub wheel: DeadlineWheel,
    pub visibility: VisibilityIndex,
    pub schedules: ScheduleStore,
    pub runs: Mutex<RunTable>,
    /// Workflow task token -> run id.
    pub tokens: Mutex<HashMap<Uuid, Uuid>>,
    /// Per-run oneshot senders for callers awaiting update outcomes.
    pub update_waiters: Mutex<HashMap<Uuid, HashMap<String, oneshot::Sender<Outcome>>>>,
}

/// Handle to the workflow execution core. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine backed by the in-memory event log.
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self::with_store(Arc::new(InMemoryEventLog::new()), registry)
    }

    /// Engine backed by a caller-provided event log store.
    pub fn with_store(log: Arc<dyn EventLogStore>, registry: Arc<WorkerRegistry>) -> Self {
        let engine = Self {
            inner: Arc::new(EngineInner {
                log,
                registry,
                wf_matcher: TaskMatcher::new(),
                act_matcher: TaskMatcher::new(),
                supervisor: ActivitySupervisor::new(),
                wheel: DeadlineWheel::new(),
                visibility: VisibilityIndex::new(),
                schedules: ScheduleStore::new(),
                runs: Mutex::new(RunTable::default()),
                tokens: Mutex::new(HashMap::new()),
                update_waiters: Mutex::new(HashMap::new()),
            }),
        };
        tokio::spawn(sweeper(Arc::downgrade(&engine.inner)));
        engine
    }

    // ------------------------------------------------------------------
    // Worker RPC surface
    // ------------------------------------------------------------------

    /// Long-poll for a workflow task. Returns `None` on timeout.
    pub async fn poll_workflow_task(
        &self,
        task_queue: &str,
        timeout: Duration,
    ) -> Option<WorkflowTask> {
        let task = self.inner.wf_matcher.poll(task_queue, timeout).await?;
        let runs = self.lock_runs();
        match runs.executions.get(&task.run_id) {
            Some(meta)
                if !meta.status.is_terminal() && meta.wft.outstanding == Some(task.task_token) =>
            {
                Some(task)
            }
            _ => {
                debug!(run_id = %task.run_id, "Dropping stale workflow task");
                None
            }
        }
    }

    /// Long-poll for an activity task. Returns `None` on timeout or when the
    /// claimed entry went stale.
    pub async fn poll_activity_task(
        &self,
        task_queue: &str,
        timeout: Duration,
    ) -> Option<ActivityTask> {
        let queued = self.inner.act_matcher.poll(task_queue, timeout).await?;
        self.begin_attempt(queued.run_id, &queued.activity_id, queued.attempt)
    }

    /// Claim an attempt for execution: records `ActivityTaskStarted` and arms
    /// enforcement deadlines. Shared by the queued and local paths.
    pub(crate) fn begin_attempt(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
    ) -> Option<ActivityTask> {
        if self.run_status(run_id)?.is_terminal() {
            return None;
        }
        let now = Utc::now();
        let grant = self
            .inner
            .supervisor
            .try_start(run_id, activity_id, attempt, now)?;

        if let Err(e) = self.inner.log.append(
            run_id,
            None,
            vec![EventAttributes::ActivityTaskStarted {
                activity_id: activity_id.to_string(),
                attempt: grant.attempt,
            }],
        ) {
            warn!(run_id = %run_id, activity_id, error = %e, "Failed to record activity start");
            return None;
        }

        if let Some(at) = grant.start_to_close_deadline {
            self.inner.wheel.schedule(
                at,
                Deadline::ActivityStartToClose {
                    run_id,
                    activity_id: activity_id.to_string(),
                    attempt: grant.attempt,
                },
            );
        }
        if let Some(at) = grant.heartbeat_deadline {
            self.inner.wheel.schedule(
                at,
                Deadline::ActivityHeartbeat {
                    run_id,
                    activity_id: activity_id.to_string(),
                    attempt: grant.attempt,
                },
            );
        }

        Some(ActivityTask {
            run_id,
            activity_id: activity_id.to_string(),
            activity_type: grant.activity_type,
            input: grant.input,
            attempt: grant.attempt,
            heartbeat_details: grant.heartbeat_details,
        })
    }

    /// Report activity success. Stale attempts are dropped silently.
    pub fn complete_activity(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
        result: serde_json::Value,
    ) -> EngineResult<()> {
        if self.run_status_or_not_found(run_id)?.is_terminal() {
            return Ok(());
        }
        if !self.inner.supervisor.complete(run_id, activity_id, attempt) {
            debug!(run_id = %run_id, activity_id, attempt, "Ignoring stale activity completion");
            return Ok(());
        }
        let appended = self.append_if_open(
            run_id,
            |_| true,
            EventAttributes::ActivityTaskCompleted {
                activity_id: activity_id.to_string(),
                attempt,
                result,
            },
        )?;
        if appended {
            debug!(run_id = %run_id, activity_id, attempt, "Activity completed");
            self.schedule_workflow_task(run_id);
        }
        Ok(())
    }

    /// Report activity failure. The supervisor consults the retry policy;
    /// retries stay invisible to the workflow until exhaustion.
    pub fn fail_activity(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
        failure: Failure,
    ) -> EngineResult<()> {
        if self.run_status_or_not_found(run_id)?.is_terminal() {
            return Ok(());
        }
        self.resolve_activity_failure(run_id, activity_id, attempt, failure);
        Ok(())
    }

    pub(crate) fn resolve_activity_failure(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
        failure: Failure,
    ) {
        match self
            .inner
            .supervisor
            .on_failure(run_id, activity_id, attempt, &failure)
        {
            FailureVerdict::Retry {
                delay,
                next_attempt,
            } => {
                debug!(
                    run_id = %run_id,
                    activity_id,
                    attempt,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Activity attempt failed, retrying after backoff"
                );
                let at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                self.inner.wheel.schedule(
                    at,
                    Deadline::ActivityRetry {
                        run_id,
                        activity_id: activity_id.to_string(),
                        attempt: next_attempt,
                    },
                );
            }
            FailureVerdict::Exhausted => {
                let attributes = match &failure.kind {
                    FailureKind::Timeout { timeout } => EventAttributes::ActivityTaskTimedOut {
                        activity_id: activity_id.to_string(),
                        attempt,
                        timeout: *timeout,
                    },
                    FailureKind::Canceled => EventAttributes::ActivityTaskCanceled {
                        activity_id: activity_id.to_string(),
                    },
                    _ => EventAttributes::ActivityTaskFailed {
                        activity_id: activity_id.to_string(),
                        attempt,
                        failure: failure.clone(),
                    },
                };
                debug!(
                    run_id = %run_id,
                    activity_id,
                    attempt,
                    error = %failure,
                    "Activity exhausted, surfacing terminal failure"
                );
                if let Err(e) = self.inner.log.append(run_id, None, vec![attributes]) {
                    warn!(run_id = %run_id, activity_id, error = %e, "Failed to record activity failure");
                    return;
                }
                self.schedule_workflow_task(run_id);
            }
            FailureVerdict::Stale => {
                debug!(run_id = %run_id, activity_id, attempt, "Ignoring stale activity failure");
            }
        }
    }

    /// Record a heartbeat. Returns whether cancellation has been requested
    /// for the activity, so the caller can stop cooperatively.
    pub fn record_activity_heartbeat(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
        details: Option<serde_json::Value>,
    ) -> EngineResult<bool> {
        match self
            .inner
            .supervisor
            .record_heartbeat(run_id, activity_id, attempt, details)
        {
            Some(cancel_requested) => Ok(cancel_requested),
            None => Err(EngineError::NotFound(format!(
                "no live attempt {attempt} for activity {activity_id}"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Full history of a run.
    pub fn get_history(&self, run_id: Uuid) -> EngineResult<Vec<HistoryEvent>> {
        let events = self.inner.log.read(run_id, 1)?;
        if events.is_empty() {
            return Err(EngineError::NotFound(format!("run {run_id}")));
        }
        Ok(events)
    }

    /// Current run id for a workflow id.
    pub fn current_run_id(&self, namespace: &str, workflow_id: &str) -> EngineResult<Uuid> {
        let runs = self.lock_runs();
        runs.current
            .get(&(namespace.to_string(), workflow_id.to_string()))
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("workflow {namespace}/{workflow_id}")))
    }

    /// Visibility record for the current run of a workflow id.
    pub fn describe_execution(
        &self,
        namespace: &str,
        workflow_id: &str,
    ) -> EngineResult<ExecutionInfo> {
        let run_id = self.current_run_id(namespace, workflow_id)?;
        self.describe_run(run_id)
    }

    /// Visibility record for a specific run.
    pub fn describe_run(&self, run_id: Uuid) -> EngineResult<ExecutionInfo> {
        self.inner
            .visibility
            .get(run_id)
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
    }

    /// List executions matching the filter, newest first.
    pub fn list_executions(&self, filter: &ListFilter) -> Vec<ExecutionInfo> {
        self.inner.visibility.list(filter)
    }

    /// Count executions matching the filter.
    pub fn count_executions(&self, filter: &ListFilter) -> usize {
        self.inner.visibility.count(filter)
    }

    /// Attempt telemetry for one activity.
    pub fn activity_attempts(&self, run_id: Uuid, activity_id: &str) -> Option<u32> {
        self.inner.supervisor.attempt_count(run_id, activity_id)
    }

    /// Await the final result of the workflow id's execution chain,
    /// following continue-as-new to the last run.
    pub async fn get_result(
        &self,
        namespace: &str,
        workflow_id: &str,
    ) -> EngineResult<serde_json::Value> {
        let mut run_id = self.current_run_id(namespace, workflow_id)?;
        loop {
            let mut rx = {
                let runs = self.lock_runs();
                let meta = runs
                    .executions
                    .get(&run_id)
                    .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
                meta.close_tx.subscribe()
            };
            while !rx.borrow_and_update().is_terminal() {
                rx.changed()
                    .await
                    .map_err(|_| EngineError::Internal("run watch closed".to_string()))?;
            }

            let (status, continued_to) = {
                let runs = self.lock_runs();
                let meta = runs
                    .executions
                    .get(&run_id)
                    .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
                (meta.status, meta.continued_to)
            };
            match status {
                ExecutionStatus::ContinuedAsNew => {
                    run_id = continued_to.ok_or_else(|| {
                        EngineError::Internal("continued run without successor".to_string())
                    })?;
                }
                _ => return self.run_result(run_id),
            }
        }
    }

    /// Terminal result of a specific closed run.
    pub fn run_result(&self, run_id: Uuid) -> EngineResult<serde_json::Value> {
        let events = self.get_history(run_id)?;
        let last = events
            .last()
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
        match &last.attributes {
            EventAttributes::WorkflowExecutionCompleted { result } => Ok(result.clone()),
            EventAttributes::WorkflowExecutionFailed { failure } => {
                Err(EngineError::WorkflowFailure(failure.clone()))
            }
            EventAttributes::WorkflowExecutionCanceled { details } => {
                let mut failure = Failure::canceled("workflow canceled");
                failure.details = details.clone();
                Err(EngineError::WorkflowFailure(failure))
            }
            EventAttributes::WorkflowExecutionTerminated { reason } => {
                Err(EngineError::WorkflowFailure(Failure::terminated(reason)))
            }
            EventAttributes::WorkflowExecutionTimedOut {} => Err(EngineError::WorkflowFailure(
                Failure::timeout(TimeoutKind::Run),
            )),
            _ => Err(EngineError::Validation(format!(
                "run {run_id} has not closed"
            ))),
        }
    }

    /// Replay a run's history into its derived state.
    pub fn replay(&self, run_id: Uuid) -> EngineResult<WorkflowState> {
        let events = self.get_history(run_id)?;
        WorkflowState::from_events(&events)
    }

    // ------------------------------------------------------------------
    // Deadline handling
    // ------------------------------------------------------------------

    pub(crate) fn handle_deadline(&self, deadline: Deadline) {
        match deadline {
            Deadline::WorkflowTimer { run_id, timer_id } => self.fire_timer(run_id, &timer_id),
            Deadline::ActivityScheduleToStart {
                run_id,
                activity_id,
                attempt,
            } => {
                if self.inner.supervisor.is_current(run_id, &activity_id, attempt) {
                    self.resolve_activity_failure(
                        run_id,
                        &activity_id,
                        attempt,
                        Failure::timeout(TimeoutKind::ScheduleToStart),
                    );
                }
            }
            Deadline::ActivityStartToClose {
                run_id,
                activity_id,
                attempt,
            } => self.resolve_activity_failure(
                run_id,
                &activity_id,
                attempt,
                Failure::timeout(TimeoutKind::StartToClose),
            ),
            Deadline::ActivityHeartbeat {
                run_id,
                activity_id,
                attempt,
            } => {
                let now = Utc::now();
                match self
                    .inner
                    .supervisor
                    .check_heartbeat(run_id, &activity_id, attempt, now)
                {
                    HeartbeatVerdict::Live { recheck_at } => self.inner.wheel.schedule(
                        recheck_at,
                        Deadline::ActivityHeartbeat {
                            run_id,
                            activity_id,
                            attempt,
                        },
                    ),
                    HeartbeatVerdict::TimedOut => self.resolve_activity_failure(
                        run_id,
                        &activity_id,
                        attempt,
                        Failure::timeout(TimeoutKind::Heartbeat),
                    ),
                    HeartbeatVerdict::Stale => {}
                }
            }
            Deadline::ActivityRetry {
                run_id,
                activity_id,
                attempt,
            } => self.dispatch_retry(run_id, &activity_id, attempt),
            Deadline::RunTimeout { run_id } => self.force_run_timeout(run_id),
            Deadline::ScheduleDue { schedule_id } => self.handle_schedule_due(&schedule_id),
        }
    }

    fn fire_timer(&self, run_id: Uuid, timer_id: &str) {
        if self
            .run_status(run_id)
            .map(|s| s.is_terminal())
            .unwrap_or(true)
        {
            return;
        }
        // The guard re-derives from the log so canceled timers and runs
        // closed since the wheel entry was armed are skipped.
        let appended = self.append_if_open(
            run_id,
            |state| matches!(state.timer(timer_id), Some(t) if t.is_pending()),
            EventAttributes::TimerFired {
                timer_id: timer_id.to_string(),
            },
        );
        match appended {
            Ok(true) => {
                debug!(run_id = %run_id, timer_id, "Timer fired");
                self.schedule_workflow_task(run_id);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(run_id = %run_id, timer_id, error = %e, "Failed to record timer fire");
            }
        }
    }

    fn dispatch_retry(&self, run_id: Uuid, activity_id: &str, attempt: u32) {
        if self
            .run_status(run_id)
            .map(|s| s.is_terminal())
            .unwrap_or(true)
        {
            return;
        }
        let now = Utc::now();
        let dispatch = match self
            .inner
            .supervisor
            .on_retry_due(run_id, activity_id, attempt, now)
        {
            Some(d) => d,
            None => return,
        };
        if dispatch.local {
            let engine = self.clone();
            let activity_id = activity_id.to_string();
            tokio::spawn(async move {
                crate::machine::run_local_attempt(engine, run_id, activity_id, attempt).await;
            });
        } else {
            if let Some(at) = dispatch.schedule_to_start_deadline {
                self.inner.wheel.schedule(
                    at,
                    Deadline::ActivityScheduleToStart {
                        run_id,
                        activity_id: activity_id.to_string(),
                        attempt,
                    },
                );
            }
            self.inner.act_matcher.enqueue(
                &dispatch.task_queue,
                QueuedActivity {
                    run_id,
                    activity_id: activity_id.to_string(),
                    attempt,
                },
                dispatch.schedule_to_start_deadline,
            );
        }
    }

    // ------------------------------------------------------------------
    // Internal helpers shared across impl blocks
    // ------------------------------------------------------------------

    /// Append one event keyed on the replayed tail, retrying on append
    /// races. Returns `false` without appending once the history carries a
    /// terminal event or the guard rejects the re-replayed state, so a
    /// racing close can never be followed by this event.
    pub(crate) fn append_if_open<F>(
        &self,
        run_id: Uuid,
        guard: F,
        attributes: EventAttributes,
    ) -> EngineResult<bool>
    where
        F: Fn(&WorkflowState) -> bool,
    {
        loop {
            let state = self.replay(run_id)?;
            if state.status.is_terminal() || !guard(&state) {
                return Ok(false);
            }
            match self.inner.log.append(
                run_id,
                Some(state.last_event_id),
                vec![attributes.clone()],
            ) {
                Ok(_) => return Ok(true),
                Err(EngineError::LogConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn lock_runs(&self) -> std::sync::MutexGuard<'_, RunTable> {
        self.inner.runs.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn run_status(&self, run_id: Uuid) -> Option<ExecutionStatus> {
        let runs = self.lock_runs();
        runs.executions.get(&run_id).map(|m| m.status)
    }

    pub(crate) fn run_status_or_not_found(&self, run_id: Uuid) -> EngineResult<ExecutionStatus> {
        self.run_status(run_id)
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
    }

    pub(crate) fn activity_context(
        &self,
        task: &ActivityTask,
    ) -> ActivityContext {
        ActivityContext::new(self.clone(), task)
    }
}

/// Background sweeper: pops due deadlines and dispatches them. Holds only a
/// weak reference so dropping the last `Engine` stops the loop.
async fn sweeper(inner: Weak<EngineInner>) {
    loop {
        let engine = match inner.upgrade() {
            Some(strong) => Engine { inner: strong },
            None => return,
        };
        let now = Utc::now();
        for deadline in engine.inner.wheel.take_due(now) {
            engine.handle_deadline(deadline);
        }
        // Entries past their schedule-to-start deadline are dropped here;
        // their timeout semantics fired through the wheel.
        let _ = engine.inner.act_matcher.take_expired(now);

        let sleep_for = engine
            .inner
            .wheel
            .next_fire_at()
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::from_millis(250))
            .min(Duration::from_millis(250));
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = engine.inner.wheel.notified() => {}
        }
    }
}
