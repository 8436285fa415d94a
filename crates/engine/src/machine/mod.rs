//! Run lifecycle: start, workflow task completion, command translation,
//! cancellation, termination, and continue-as-new.
//!
//! Command translation is two-phase. Commands are first validated against the
//! replayed state and turned into a history event batch plus a list of side
//! effects; only after the batch lands through the conditional append are the
//! effects applied. A lost append race means another writer moved the log
//! (a signal, an activity resolution) and the worker's decisions are stale,
//! so the run gets a fresh workflow task instead.

pub mod commands;
pub mod state;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{Engine, ExecutionMeta, ParentLink, WftState};
use crate::error::{EngineError, EngineResult, Failure, TimeoutKind};
use crate::history::{EventAttributes, Outcome};
use crate::timers::Deadline;
use crate::types::{
    ActivityOptions, EventId, ExecutionRef, ExecutionStatus, StartWorkflowRequest,
    WorkflowIdReusePolicy,
};
use crate::visibility::ExecutionInfo;

use commands::Command;

/// Side effects applied after a command batch is durably appended.
enum Effect {
    DispatchActivity {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },
    ArmTimer {
        timer_id: String,
        fire_at: chrono::DateTime<Utc>,
    },
    RequestCancelActivity {
        activity_id: String,
    },
    SignalExternal {
        workflow_id: String,
        signal_name: String,
        input: serde_json::Value,
    },
    StartChild {
        child_workflow_id: String,
        child_run_id: Uuid,
        workflow_type: String,
        input: serde_json::Value,
        task_queue: String,
    },
    ResolveUpdate {
        update_id: String,
        outcome: Outcome,
    },
    ContinueAsNew {
        new_run_id: Uuid,
        input: serde_json::Value,
    },
    Close {
        status: ExecutionStatus,
    },
}

impl Engine {
    /// Start a new workflow execution. Enforces one current non-terminal run
    /// per workflow id, subject to the id reuse policy once the previous run
    /// has closed.
    pub fn start_workflow(&self, req: StartWorkflowRequest) -> EngineResult<ExecutionRef> {
        if req.workflow_id.is_empty() {
            return Err(EngineError::Validation("workflow_id is required".into()));
        }
        if req.workflow_type.is_empty() {
            return Err(EngineError::Validation("workflow_type is required".into()));
        }
        if req.task_queue.is_empty() {
            return Err(EngineError::Validation("task_queue is required".into()));
        }
        self.start_run(req, None, None)
    }

    /// Create a run, register it as current, and schedule its first workflow
    /// task. Enforces the id reuse policy against the previous current run.
    pub(crate) fn start_run(
        &self,
        req: StartWorkflowRequest,
        continued_from: Option<Uuid>,
        parent: Option<ParentLink>,
    ) -> EngineResult<ExecutionRef> {
        let run_id = Uuid::new_v4();
        let key = (req.namespace.clone(), req.workflow_id.clone());
        {
            // Check and register under one lock so concurrent starts of the
            // same workflow id cannot both pass the reuse check.
            let mut runs = self.lock_runs();
            if let Some(existing) = runs.current.get(&key).copied() {
                let status = runs
                    .executions
                    .get(&existing)
                    .map(|m| m.status)
                    .unwrap_or(ExecutionStatus::Running);
                let conflict = if !status.is_terminal() {
                    true
                } else {
                    match req.id_reuse_policy {
                        WorkflowIdReusePolicy::AllowDuplicate => false,
                        WorkflowIdReusePolicy::RejectDuplicate => true,
                        WorkflowIdReusePolicy::AllowDuplicateFailedOnly => {
                            status == ExecutionStatus::Completed
                        }
                    }
                };
                if conflict {
                    return Err(EngineError::AlreadyExists(format!(
                        "workflow {}/{} already exists with run {existing}",
                        req.namespace, req.workflow_id
                    )));
                }
            }
            let (close_tx, _) = watch::channel(ExecutionStatus::Running);
            runs.executions.insert(
                run_id,
                ExecutionMeta {
                    namespace: req.namespace.clone(),
                    workflow_id: req.workflow_id.clone(),
                    workflow_type: req.workflow_type.clone(),
                    task_queue: req.task_queue.clone(),
                    status: ExecutionStatus::Running,
                    parent: parent.clone(),
                    continued_to: None,
                    wft: WftState::default(),
                    close_tx,
                },
            );
            runs.current.insert(key, run_id);
        }
        if let Some(run_timeout) = req.run_timeout {
            if let Ok(d) = chrono::Duration::from_std(run_timeout) {
                self.inner
                    .wheel
                    .schedule(Utc::now() + d, Deadline::RunTimeout { run_id });
            }
        }
        self.launch_run(req, run_id, continued_from, parent)
    }

    /// Insert the run's bookkeeping and mark it current. Split from
    /// [`Self::launch_run`] so continue-as-new can register the successor
    /// before result waiters wake on the predecessor's closure.
    fn register_run(&self, req: &StartWorkflowRequest, run_id: Uuid, parent: Option<ParentLink>) {
        let key = (req.namespace.clone(), req.workflow_id.clone());
        let mut runs = self.lock_runs();
        let (close_tx, _) = watch::channel(ExecutionStatus::Running);
        runs.executions.insert(
            run_id,
            ExecutionMeta {
                namespace: req.namespace.clone(),
                workflow_id: req.workflow_id.clone(),
                workflow_type: req.workflow_type.clone(),
                task_queue: req.task_queue.clone(),
                status: ExecutionStatus::Running,
                parent,
                continued_to: None,
                wft: WftState::default(),
                close_tx,
            },
        );
        runs.current.insert(key, run_id);
    }

    /// Append the start event, index the run, and schedule its first
    /// workflow task.
    fn launch_run(
        &self,
        req: StartWorkflowRequest,
        run_id: Uuid,
        continued_from: Option<Uuid>,
        parent: Option<ParentLink>,
    ) -> EngineResult<ExecutionRef> {
        self.inner.log.append(
            run_id,
            None,
            vec![EventAttributes::WorkflowExecutionStarted {
                workflow_type: req.workflow_type.clone(),
                workflow_id: req.workflow_id.clone(),
                task_queue: req.task_queue.clone(),
                input: req.input.clone(),
                continued_from_run_id: continued_from,
                parent_run_id: parent.as_ref().map(|p| p.run_id),
            }],
        )?;

        self.inner.visibility.upsert(ExecutionInfo {
            namespace: req.namespace.clone(),
            workflow_id: req.workflow_id.clone(),
            run_id,
            workflow_type: req.workflow_type.clone(),
            task_queue: req.task_queue.clone(),
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            close_time: None,
            memo: req.memo,
            search_attributes: req.search_attributes,
            parent_run_id: parent.as_ref().map(|p| p.run_id),
            continued_from_run_id: continued_from,
        });

        info!(
            namespace = %req.namespace,
            workflow_id = %req.workflow_id,
            workflow_type = %req.workflow_type,
            run_id = %run_id,
            task_queue = %req.task_queue,
            continued_from = ?continued_from,
            "Workflow execution started"
        );
        self.schedule_workflow_task(run_id);
        Ok(ExecutionRef {
            namespace: req.namespace,
            workflow_id: req.workflow_id,
            run_id,
        })
    }

    /// Schedule a workflow task for the run, collapsing triggers while one is
    /// already outstanding.
    pub(crate) fn schedule_workflow_task(&self, run_id: Uuid) {
        let (token, namespace, workflow_id, task_queue) = {
            let mut runs = self.lock_runs();
            let meta = match runs.executions.get_mut(&run_id) {
                Some(m) => m,
                None => return,
            };
            if meta.status.is_terminal() {
                return;
            }
            if meta.wft.outstanding.is_some() {
                meta.wft.again = true;
                return;
            }
            let token = Uuid::new_v4();
            meta.wft.outstanding = Some(token);
            (
                token,
                meta.namespace.clone(),
                meta.workflow_id.clone(),
                meta.task_queue.clone(),
            )
        };

        if let Err(e) = self.inner.log.append(
            run_id,
            None,
            vec![EventAttributes::WorkflowTaskScheduled {}],
        ) {
            warn!(run_id = %run_id, error = %e, "Failed to record workflow task");
            return;
        }
        let last_event_id = self.inner.log.tail(run_id).unwrap_or_default();
        self.inner
            .tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(token, run_id);
        self.inner.wf_matcher.enqueue(
            &task_queue,
            crate::dispatch::WorkflowTask {
                task_token: token,
                namespace,
                workflow_id,
                run_id,
                last_event_id,
            },
            None,
        );
        debug!(run_id = %run_id, last_event_id, "Workflow task scheduled");
    }

    /// Complete a workflow task: validate the worker's commands against the
    /// replayed state, append the translated events conditionally on the tail
    /// the worker saw, then apply side effects.
    pub fn complete_workflow_task(
        &self,
        task_token: Uuid,
        starting_event_id: EventId,
        commands: Vec<Command>,
    ) -> EngineResult<()> {
        let run_id = self.take_token(task_token)?;
        let meta_queue = {
            let mut runs = self.lock_runs();
            let meta = runs
                .executions
                .get_mut(&run_id)
                .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
            if meta.wft.outstanding != Some(task_token) {
                return Err(EngineError::NotFound("stale task token".into()));
            }
            meta.wft.outstanding = None;
            if meta.status.is_terminal() {
                // Closed out from under the worker (terminate); drop quietly.
                return Ok(());
            }
            meta.task_queue.clone()
        };

        let state = self.replay(run_id)?;
        let (batch, effects) =
            match self.translate_commands(run_id, &state, starting_event_id, commands) {
                Ok(out) => out,
                Err(e) => {
                    self.schedule_workflow_task(run_id);
                    return Err(e);
                }
            };

        match self
            .inner
            .log
            .append(run_id, Some(starting_event_id), batch)
        {
            Ok(_) => {}
            Err(EngineError::LogConflict { .. }) => {
                debug!(run_id = %run_id, starting_event_id, "Workflow task lost append race");
                self.schedule_workflow_task(run_id);
                return Err(EngineError::NonDeterminism(format!(
                    "history advanced past event {starting_event_id} during the workflow task"
                )));
            }
            Err(e) => return Err(e),
        }

        let mut closed = false;
        for effect in effects {
            if self.apply_effect(run_id, &meta_queue, effect) {
                closed = true;
            }
        }

        if !closed {
            let again = {
                let mut runs = self.lock_runs();
                runs.executions
                    .get_mut(&run_id)
                    .map(|meta| std::mem::take(&mut meta.wft.again))
                    .unwrap_or(false)
            };
            if again {
                self.schedule_workflow_task(run_id);
            }
        }
        Ok(())
    }

    /// Fail the run from a workflow task, for errors that retrying cannot
    /// fix, such as an unregistered workflow type.
    pub fn fail_workflow_task(&self, task_token: Uuid, failure: Failure) -> EngineResult<()> {
        let run_id = self.take_token(task_token)?;
        {
            let mut runs = self.lock_runs();
            let meta = runs
                .executions
                .get_mut(&run_id)
                .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
            if meta.wft.outstanding != Some(task_token) {
                return Err(EngineError::NotFound("stale task token".into()));
            }
            meta.wft.outstanding = None;
            if meta.status.is_terminal() {
                return Ok(());
            }
        }
        warn!(run_id = %run_id, error = %failure, "Workflow task failed, closing run");
        self.inner.log.append(
            run_id,
            None,
            vec![EventAttributes::WorkflowExecutionFailed { failure }],
        )?;
        self.close_run(run_id, ExecutionStatus::Failed);
        Ok(())
    }

    fn take_token(&self, task_token: Uuid) -> EngineResult<Uuid> {
        self.inner
            .tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&task_token)
            .ok_or_else(|| EngineError::NotFound("unknown task token".into()))
    }

    fn translate_commands(
        &self,
        run_id: Uuid,
        state: &state::WorkflowState,
        starting_event_id: EventId,
        commands: Vec<Command>,
    ) -> EngineResult<(Vec<EventAttributes>, Vec<Effect>)> {
        let mut batch = vec![EventAttributes::WorkflowTaskCompleted { starting_event_id }];
        let mut effects = Vec::new();
        let total = commands.len();
        for (idx, command) in commands.into_iter().enumerate() {
            if command.is_terminal() && idx + 1 != total {
                return Err(EngineError::Validation(
                    "terminal command must be the last command in the batch".into(),
                ));
            }
            match command {
                Command::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    if state.activity_scheduled(&activity_id) {
                        return Err(EngineError::NonDeterminism(format!(
                            "activity id {activity_id} already scheduled in run {run_id}"
                        )));
                    }
                    batch.push(EventAttributes::ActivityTaskScheduled {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    });
                    effects.push(Effect::DispatchActivity {
                        activity_id,
                        activity_type,
                        input,
                        options,
                    });
                }
                Command::RequestCancelActivity { activity_id } => {
                    match state.activity(&activity_id) {
                        Some(view) if view.is_pending() => {}
                        Some(_) => continue, // already resolved, nothing to cancel
                        None => {
                            return Err(EngineError::NonDeterminism(format!(
                                "cancel requested for unknown activity {activity_id}"
                            )));
                        }
                    }
                    batch.push(EventAttributes::ActivityTaskCancelRequested {
                        activity_id: activity_id.clone(),
                    });
                    effects.push(Effect::RequestCancelActivity { activity_id });
                }
                Command::StartTimer { timer_id, delay } => {
                    if state.timer(&timer_id).is_some() {
                        return Err(EngineError::NonDeterminism(format!(
                            "timer id {timer_id} already started in run {run_id}"
                        )));
                    }
                    let fire_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    batch.push(EventAttributes::TimerStarted {
                        timer_id: timer_id.clone(),
                        fire_at,
                    });
                    effects.push(Effect::ArmTimer { timer_id, fire_at });
                }
                Command::CancelTimer { timer_id } => {
                    match state.timer(&timer_id) {
                        Some(view) if view.is_pending() => {}
                        Some(_) => continue,
                        None => {
                            return Err(EngineError::NonDeterminism(format!(
                                "cancel requested for unknown timer {timer_id}"
                            )));
                        }
                    }
                    // No effect: the wheel entry is skipped lazily at fire time.
                    batch.push(EventAttributes::TimerCanceled { timer_id });
                }
                Command::SignalExternal {
                    workflow_id,
                    signal_name,
                    input,
                } => {
                    effects.push(Effect::SignalExternal {
                        workflow_id,
                        signal_name,
                        input,
                    });
                }
                Command::StartChildWorkflow {
                    workflow_id,
                    workflow_type,
                    input,
                    task_queue,
                } => {
                    if state.child(&workflow_id).is_some() {
                        return Err(EngineError::NonDeterminism(format!(
                            "child workflow id {workflow_id} already initiated in run {run_id}"
                        )));
                    }
                    let child_run_id = Uuid::new_v4();
                    batch.push(EventAttributes::ChildWorkflowExecutionInitiated {
                        child_workflow_id: workflow_id.clone(),
                        child_run_id,
                        workflow_type: workflow_type.clone(),
                    });
                    effects.push(Effect::StartChild {
                        child_workflow_id: workflow_id,
                        child_run_id,
                        workflow_type,
                        input,
                        task_queue: task_queue.unwrap_or_else(|| state.task_queue.clone()),
                    });
                }
                Command::CompleteUpdate { update_id, outcome } => {
                    let known_pending = state
                        .pending_updates()
                        .iter()
                        .any(|u| u.update_id == update_id);
                    if !known_pending {
                        return Err(EngineError::NonDeterminism(format!(
                            "completion for unknown or already-completed update {update_id}"
                        )));
                    }
                    batch.push(EventAttributes::WorkflowExecutionUpdateCompleted {
                        update_id: update_id.clone(),
                        outcome: outcome.clone(),
                    });
                    effects.push(Effect::ResolveUpdate { update_id, outcome });
                }
                Command::CompleteWorkflow { result } => {
                    batch.push(EventAttributes::WorkflowExecutionCompleted { result });
                    effects.push(Effect::Close {
                        status: ExecutionStatus::Completed,
                    });
                }
                Command::FailWorkflow { failure } => {
                    batch.push(EventAttributes::WorkflowExecutionFailed { failure });
                    effects.push(Effect::Close {
                        status: ExecutionStatus::Failed,
                    });
                }
                Command::CancelWorkflow { details } => {
                    batch.push(EventAttributes::WorkflowExecutionCanceled { details });
                    effects.push(Effect::Close {
                        status: ExecutionStatus::Canceled,
                    });
                }
                Command::ContinueAsNew { input } => {
                    let new_run_id = Uuid::new_v4();
                    batch.push(EventAttributes::WorkflowExecutionContinuedAsNew {
                        new_run_id,
                        input: input.clone(),
                    });
                    effects.push(Effect::ContinueAsNew { new_run_id, input });
                }
            }
        }
        Ok((batch, effects))
    }

    /// Apply one side effect. Returns true when the effect closed the run.
    fn apply_effect(&self, run_id: Uuid, task_queue: &str, effect: Effect) -> bool {
        match effect {
            Effect::DispatchActivity {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                let local = options.local;
                let schedule_to_start = options
                    .schedule_to_start_timeout
                    .and_then(|t| chrono::Duration::from_std(t).ok())
                    .map(|t| Utc::now() + t);
                let queue = options
                    .task_queue
                    .clone()
                    .unwrap_or_else(|| task_queue.to_string());
                self.inner.supervisor.register(
                    run_id,
                    &activity_id,
                    &activity_type,
                    input,
                    options,
                    task_queue,
                );
                if local {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        run_local_attempt(engine, run_id, activity_id, 1).await;
                    });
                } else {
                    if let Some(at) = schedule_to_start {
                        self.inner.wheel.schedule(
                            at,
                            Deadline::ActivityScheduleToStart {
                                run_id,
                                activity_id: activity_id.clone(),
                                attempt: 1,
                            },
                        );
                    }
                    self.inner.act_matcher.enqueue(
                        &queue,
                        crate::dispatch::QueuedActivity {
                            run_id,
                            activity_id,
                            attempt: 1,
                        },
                        schedule_to_start,
                    );
                }
                false
            }
            Effect::ArmTimer { timer_id, fire_at } => {
                self.inner
                    .wheel
                    .schedule(fire_at, Deadline::WorkflowTimer { run_id, timer_id });
                false
            }
            Effect::RequestCancelActivity { activity_id } => {
                self.apply_activity_cancel(run_id, &activity_id);
                false
            }
            Effect::SignalExternal {
                workflow_id,
                signal_name,
                input,
            } => {
                let namespace = {
                    let runs = self.lock_runs();
                    runs.executions
                        .get(&run_id)
                        .map(|m| m.namespace.clone())
                        .unwrap_or_default()
                };
                if let Err(e) = self.signal_workflow(&namespace, &workflow_id, &signal_name, input)
                {
                    debug!(
                        run_id = %run_id,
                        target = %workflow_id,
                        signal_name = %signal_name,
                        error = %e,
                        "External signal target unavailable"
                    );
                }
                false
            }
            Effect::StartChild {
                child_workflow_id,
                child_run_id,
                workflow_type,
                input,
                task_queue,
            } => {
                self.start_child(
                    run_id,
                    child_workflow_id,
                    child_run_id,
                    workflow_type,
                    input,
                    task_queue,
                );
                false
            }
            Effect::ResolveUpdate { update_id, outcome } => {
                self.resolve_update_waiter(run_id, &update_id, outcome);
                false
            }
            Effect::ContinueAsNew { new_run_id, input } => {
                self.continue_as_new(run_id, new_run_id, input);
                true
            }
            Effect::Close { status } => {
                self.close_run(run_id, status);
                true
            }
        }
    }

    fn apply_activity_cancel(&self, run_id: Uuid, activity_id: &str) {
        use crate::activity::CancelEffect;
        match self.inner.supervisor.request_cancel(run_id, activity_id) {
            CancelEffect::CanceledNow => {
                if let Err(e) = self.inner.log.append(
                    run_id,
                    None,
                    vec![EventAttributes::ActivityTaskCanceled {
                        activity_id: activity_id.to_string(),
                    }],
                ) {
                    warn!(run_id = %run_id, activity_id, error = %e, "Failed to record activity cancel");
                    return;
                }
                self.schedule_workflow_task(run_id);
            }
            CancelEffect::FlagSet => {
                debug!(run_id = %run_id, activity_id, "Activity cancel flagged for next heartbeat");
            }
            CancelEffect::AlreadyClosed | CancelEffect::NotFound => {}
        }
    }

    fn start_child(
        &self,
        parent_run_id: Uuid,
        child_workflow_id: String,
        child_run_id: Uuid,
        workflow_type: String,
        input: serde_json::Value,
        task_queue: String,
    ) {
        let namespace = {
            let runs = self.lock_runs();
            match runs.executions.get(&parent_run_id) {
                Some(m) => m.namespace.clone(),
                None => return,
            }
        };
        let req = StartWorkflowRequest {
            namespace,
            workflow_id: child_workflow_id.clone(),
            workflow_type,
            task_queue,
            input,
            id_reuse_policy: WorkflowIdReusePolicy::AllowDuplicate,
            run_timeout: None,
            memo: Default::default(),
            search_attributes: Default::default(),
        };
        match self.start_child_run(
            req,
            child_run_id,
            ParentLink {
                run_id: parent_run_id,
                child_workflow_id: child_workflow_id.clone(),
            },
        ) {
            Ok(_) => {}
            Err(e) => {
                // Surface the start failure to the parent as a child failure.
                let outcome = Outcome::Failed {
                    failure: Failure::non_retryable(format!("child workflow start failed: {e}")),
                };
                if let Err(e) = self.inner.log.append(
                    parent_run_id,
                    None,
                    vec![EventAttributes::ChildWorkflowExecutionCompleted {
                        child_workflow_id,
                        child_run_id,
                        outcome,
                    }],
                ) {
                    warn!(run_id = %parent_run_id, error = %e, "Failed to record child start failure");
                    return;
                }
                self.schedule_workflow_task(parent_run_id);
            }
        }
    }

    fn continue_as_new(&self, run_id: Uuid, new_run_id: Uuid, input: serde_json::Value) {
        let (req, parent) = {
            let runs = self.lock_runs();
            let meta = match runs.executions.get(&run_id) {
                Some(m) => m,
                None => return,
            };
            (
                StartWorkflowRequest {
                    namespace: meta.namespace.clone(),
                    workflow_id: meta.workflow_id.clone(),
                    workflow_type: meta.workflow_type.clone(),
                    task_queue: meta.task_queue.clone(),
                    input,
                    id_reuse_policy: WorkflowIdReusePolicy::AllowDuplicate,
                    run_timeout: None,
                    memo: Default::default(),
                    search_attributes: Default::default(),
                },
                meta.parent.clone(),
            )
        };
        // Register the successor and point at it before waking any result
        // waiters on the predecessor's closure.
        self.register_run(&req, new_run_id, parent.clone());
        {
            let mut runs = self.lock_runs();
            if let Some(meta) = runs.executions.get_mut(&run_id) {
                meta.continued_to = Some(new_run_id);
            }
        }
        self.close_run(run_id, ExecutionStatus::ContinuedAsNew);
        if let Err(e) = self.launch_run(req, new_run_id, Some(run_id), parent) {
            warn!(run_id = %run_id, new_run_id = %new_run_id, error = %e, "Continue-as-new successor start failed");
        }
    }

    /// Start a child run under a caller-chosen run id, so the parent's
    /// initiating event can carry the id before the run exists.
    fn start_child_run(
        &self,
        req: StartWorkflowRequest,
        run_id: Uuid,
        parent: ParentLink,
    ) -> EngineResult<ExecutionRef> {
        let key = (req.namespace.clone(), req.workflow_id.clone());
        {
            let runs = self.lock_runs();
            if let Some(existing) = runs.current.get(&key).copied() {
                let open = runs
                    .executions
                    .get(&existing)
                    .map(|m| !m.status.is_terminal())
                    .unwrap_or(false);
                if open {
                    return Err(EngineError::AlreadyExists(format!(
                        "workflow {}/{} already exists with run {existing}",
                        req.namespace, req.workflow_id
                    )));
                }
            }
        }
        self.register_run(&req, run_id, Some(parent.clone()));
        self.launch_run(req, run_id, None, Some(parent))
    }

    /// Request cooperative cancellation of the current run and its open
    /// children. A no-op if the run already closed.
    pub fn cancel_workflow(
        &self,
        namespace: &str,
        workflow_id: &str,
        reason: &str,
    ) -> EngineResult<()> {
        let run_id = self.current_run_id(namespace, workflow_id)?;
        self.cancel_run(run_id, reason)
    }

    pub(crate) fn cancel_run(&self, run_id: Uuid, reason: &str) -> EngineResult<()> {
        let open_children: Vec<Uuid> = {
            let runs = self.lock_runs();
            let meta = runs
                .executions
                .get(&run_id)
                .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
            if meta.status.is_terminal() {
                return Ok(());
            }
            runs.executions
                .iter()
                .filter(|(_, m)| {
                    !m.status.is_terminal()
                        && m.parent.as_ref().map(|p| p.run_id) == Some(run_id)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        self.inner.log.append(
            run_id,
            None,
            vec![EventAttributes::WorkflowExecutionCancelRequested {
                reason: reason.to_string(),
            }],
        )?;
        info!(run_id = %run_id, reason, "Workflow cancellation requested");
        self.schedule_workflow_task(run_id);
        for child in open_children {
            if let Err(e) = self.cancel_run(child, reason) {
                debug!(run_id = %child, error = %e, "Child cancel request failed");
            }
        }
        Ok(())
    }

    /// Forcibly close the current run. The workflow gets no chance to react.
    pub fn terminate_workflow(
        &self,
        namespace: &str,
        workflow_id: &str,
        reason: &str,
    ) -> EngineResult<()> {
        let run_id = self.current_run_id(namespace, workflow_id)?;
        if self.run_status_or_not_found(run_id)?.is_terminal() {
            return Ok(());
        }
        self.inner.log.append(
            run_id,
            None,
            vec![EventAttributes::WorkflowExecutionTerminated {
                reason: reason.to_string(),
            }],
        )?;
        info!(run_id = %run_id, reason, "Workflow execution terminated");
        self.close_run(run_id, ExecutionStatus::Terminated);
        Ok(())
    }

    /// Forced close when the run-level timeout fires.
    pub(crate) fn force_run_timeout(&self, run_id: Uuid) {
        match self.run_status(run_id) {
            Some(status) if !status.is_terminal() => {}
            _ => return,
        }
        if let Err(e) = self.inner.log.append(
            run_id,
            None,
            vec![EventAttributes::WorkflowExecutionTimedOut {}],
        ) {
            warn!(run_id = %run_id, error = %e, "Failed to record run timeout");
            return;
        }
        info!(run_id = %run_id, "Workflow run timed out");
        self.close_run(run_id, ExecutionStatus::TimedOut);
    }

    /// Transition the run to a terminal status and fan out the consequences:
    /// close watchers, visibility, supervisor teardown, pending update
    /// waiters, and parent notification.
    pub(crate) fn close_run(&self, run_id: Uuid, status: ExecutionStatus) {
        let (parent, stale_token) = {
            let mut runs = self.lock_runs();
            let meta = match runs.executions.get_mut(&run_id) {
                Some(m) => m,
                None => return,
            };
            if meta.status.is_terminal() {
                return;
            }
            meta.status = status;
            meta.wft.again = false;
            let stale_token = meta.wft.outstanding.take();
            let _ = meta.close_tx.send(status);
            (meta.parent.clone(), stale_token)
        };
        if let Some(token) = stale_token {
            self.inner
                .tokens
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&token);
        }
        self.inner.visibility.close(run_id, status, Utc::now());
        self.inner.supervisor.remove_run(run_id);
        self.fail_pending_updates(run_id);
        info!(run_id = %run_id, status = %status, "Workflow run closed");

        // Continue-as-new hands the parent link to the successor instead.
        if status == ExecutionStatus::ContinuedAsNew {
            return;
        }
        if let Some(parent) = parent {
            self.notify_parent(run_id, parent, status);
        }
    }

    fn notify_parent(&self, child_run_id: Uuid, parent: ParentLink, status: ExecutionStatus) {
        let parent_open = self
            .run_status(parent.run_id)
            .map(|s| !s.is_terminal())
            .unwrap_or(false);
        if !parent_open {
            return;
        }
        let outcome = match status {
            ExecutionStatus::Completed => match self.run_result(child_run_id) {
                Ok(result) => Outcome::Completed { result },
                Err(EngineError::WorkflowFailure(failure)) => Outcome::Failed { failure },
                Err(e) => Outcome::Failed {
                    failure: Failure::application(e.to_string()),
                },
            },
            ExecutionStatus::Failed => match self.run_result(child_run_id) {
                Err(EngineError::WorkflowFailure(failure)) => Outcome::Failed { failure },
                _ => Outcome::Failed {
                    failure: Failure::application("child workflow failed"),
                },
            },
            ExecutionStatus::Canceled => Outcome::Failed {
                failure: Failure::canceled("child workflow canceled"),
            },
            ExecutionStatus::Terminated => Outcome::Failed {
                failure: Failure::terminated("child workflow terminated"),
            },
            ExecutionStatus::TimedOut => Outcome::Failed {
                failure: Failure::timeout(TimeoutKind::Run),
            },
            ExecutionStatus::Running | ExecutionStatus::ContinuedAsNew => return,
        };
        if let Err(e) = self.inner.log.append(
            parent.run_id,
            None,
            vec![EventAttributes::ChildWorkflowExecutionCompleted {
                child_workflow_id: parent.child_workflow_id,
                child_run_id,
                outcome,
            }],
        ) {
            warn!(run_id = %parent.run_id, error = %e, "Failed to record child completion");
            return;
        }
        self.schedule_workflow_task(parent.run_id);
    }
}

/// Execute one attempt of a local activity in-process, bypassing the matcher.
/// Retries re-enter through the deadline wheel like queued activities.
pub(crate) async fn run_local_attempt(
    engine: Engine,
    run_id: Uuid,
    activity_id: String,
    attempt: u32,
) {
    let task = match engine.begin_attempt(run_id, &activity_id, attempt) {
        Some(task) => task,
        None => return,
    };
    let handler = match engine.inner.registry.activity(&task.activity_type) {
        Some(h) => h,
        None => {
            engine.resolve_activity_failure(
                run_id,
                &activity_id,
                attempt,
                Failure::non_retryable(format!(
                    "activity type {} is not registered",
                    task.activity_type
                )),
            );
            return;
        }
    };
    let ctx = engine.activity_context(&task);
    let input = task.input.clone();
    let result = handler(ctx, input).await;
    match result {
        Ok(value) => {
            if let Err(e) = engine.complete_activity(run_id, &activity_id, attempt, value) {
                debug!(run_id = %run_id, activity_id = %activity_id, error = %e, "Local activity completion dropped");
            }
        }
        Err(failure) => {
            engine.resolve_activity_failure(run_id, &activity_id, attempt, failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerRegistry;
    use std::sync::Arc;

    fn test_engine() -> Engine {
        Engine::new(Arc::new(WorkerRegistry::new()))
    }

    fn start_req(workflow_id: &str) -> StartWorkflowRequest {
        StartWorkflowRequest::new("unit_wf", workflow_id, "unit-q", serde_json::Value::Null)
    }

    #[tokio::test]
    async fn test_start_rejects_duplicate_open_run() {
        let engine = test_engine();
        engine.start_workflow(start_req("dup")).unwrap();
        let err = engine.start_workflow(start_req("dup")).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_start_validates_required_fields() {
        let engine = test_engine();
        let mut req = start_req("v");
        req.workflow_type = String::new();
        assert!(matches!(
            engine.start_workflow(req),
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_workflow_task_collapses_while_outstanding() {
        let engine = test_engine();
        let handle = engine.start_workflow(start_req("collapse")).unwrap();
        // The start already scheduled one task; further triggers set the
        // again flag instead of enqueueing.
        engine.schedule_workflow_task(handle.run_id);
        engine.schedule_workflow_task(handle.run_id);
        assert_eq!(engine.inner.wf_matcher.depth("unit-q"), 1);
    }

    #[tokio::test]
    async fn test_stale_starting_event_id_is_rejected() {
        let engine = test_engine();
        let handle = engine.start_workflow(start_req("stale")).unwrap();
        let task = engine
            .poll_workflow_task("unit-q", std::time::Duration::from_millis(200))
            .await
            .unwrap();
        // A signal lands after the worker read history.
        engine
            .signal_workflow("default", "stale", "nudge", serde_json::json!(1))
            .unwrap();
        let err = engine
            .complete_workflow_task(task.task_token, task.last_event_id, vec![])
            .unwrap_err();
        assert!(matches!(err, EngineError::NonDeterminism(_)));
        // The engine scheduled a replacement task for the run.
        let replay = engine.replay(handle.run_id).unwrap();
        assert_eq!(replay.signals.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_command_must_be_last() {
        let engine = test_engine();
        engine.start_workflow(start_req("ordering")).unwrap();
        let task = engine
            .poll_workflow_task("unit-q", std::time::Duration::from_millis(200))
            .await
            .unwrap();
        let err = engine
            .complete_workflow_task(
                task.task_token,
                task.last_event_id,
                vec![
                    Command::complete(serde_json::json!("early")),
                    Command::start_timer("t", std::time::Duration::from_secs(1)),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_activity_id_is_nondeterminism() {
        let engine = test_engine();
        engine.start_workflow(start_req("dup-act")).unwrap();
        let task = engine
            .poll_workflow_task("unit-q", std::time::Duration::from_millis(200))
            .await
            .unwrap();
        let schedule = |id: &str| {
            Command::schedule_activity(id, "noop", serde_json::Value::Null, Default::default())
        };
        engine
            .complete_workflow_task(
                task.task_token,
                task.last_event_id,
                vec![schedule("a1")],
            )
            .unwrap();
        // Resolve nothing; grab the next task after signaling to force one.
        engine
            .signal_workflow("default", "dup-act", "go", serde_json::Value::Null)
            .unwrap();
        let task = engine
            .poll_workflow_task("unit-q", std::time::Duration::from_millis(200))
            .await
            .unwrap();
        let err = engine
            .complete_workflow_task(task.task_token, task.last_event_id, vec![schedule("a1")])
            .unwrap_err();
        assert!(matches!(err, EngineError::NonDeterminism(_)));
    }

    #[tokio::test]
    async fn test_terminate_is_forced_and_idempotent() {
        let engine = test_engine();
        let handle = engine.start_workflow(start_req("term")).unwrap();
        engine
            .terminate_workflow("default", "term", "operator request")
            .unwrap();
        assert_eq!(
            engine.run_status(handle.run_id),
            Some(ExecutionStatus::Terminated)
        );
        // Second terminate is a no-op.
        engine
            .terminate_workflow("default", "term", "again")
            .unwrap();
        // Result surfaces the termination as a failure.
        let err = engine.get_result("default", "term").await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowFailure(_)));
    }

    #[tokio::test]
    async fn test_cancel_on_closed_run_is_noop() {
        let engine = test_engine();
        engine.start_workflow(start_req("cnoop")).unwrap();
        engine
            .terminate_workflow("default", "cnoop", "first")
            .unwrap();
        engine.cancel_workflow("default", "cnoop", "late").unwrap();
    }

    #[tokio::test]
    async fn test_activity_completion_cannot_follow_terminal_event() {
        let engine = test_engine();
        let handle = engine.start_workflow(start_req("act-race")).unwrap();
        let task = engine
            .poll_workflow_task("unit-q", std::time::Duration::from_millis(200))
            .await
            .unwrap();
        engine
            .complete_workflow_task(
                task.task_token,
                task.last_event_id,
                vec![Command::schedule_activity(
                    "a1",
                    "noop",
                    serde_json::Value::Null,
                    Default::default(),
                )],
            )
            .unwrap();
        engine
            .poll_activity_task("unit-q", std::time::Duration::from_millis(200))
            .await
            .unwrap();
        // A terminal event lands in the log before the run table catches up,
        // as happens mid-terminate.
        engine
            .inner
            .log
            .append(
                handle.run_id,
                None,
                vec![EventAttributes::WorkflowExecutionTerminated {
                    reason: "operator".to_string(),
                }],
            )
            .unwrap();
        engine
            .complete_activity(handle.run_id, "a1", 1, serde_json::json!(5))
            .unwrap();
        let events = engine.get_history(handle.run_id).unwrap();
        assert!(matches!(
            events.last().map(|e| &e.attributes),
            Some(EventAttributes::WorkflowExecutionTerminated { .. })
        ));
    }

    #[tokio::test]
    async fn test_timer_fire_cannot_follow_terminal_event() {
        let engine = test_engine();
        let handle = engine.start_workflow(start_req("timer-race")).unwrap();
        let task = engine
            .poll_workflow_task("unit-q", std::time::Duration::from_millis(200))
            .await
            .unwrap();
        engine
            .complete_workflow_task(
                task.task_token,
                task.last_event_id,
                vec![Command::start_timer(
                    "t1",
                    std::time::Duration::from_secs(60),
                )],
            )
            .unwrap();
        engine
            .inner
            .log
            .append(
                handle.run_id,
                None,
                vec![EventAttributes::WorkflowExecutionTerminated {
                    reason: "operator".to_string(),
                }],
            )
            .unwrap();
        engine.handle_deadline(Deadline::WorkflowTimer {
            run_id: handle.run_id,
            timer_id: "t1".to_string(),
        });
        let events = engine.get_history(handle.run_id).unwrap();
        assert!(!events
            .iter()
            .any(|e| matches!(e.attributes, EventAttributes::TimerFired { .. })));
        assert!(matches!(
            events.last().map(|e| &e.attributes),
            Some(EventAttributes::WorkflowExecutionTerminated { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_records_request_without_closing() {
        let engine = test_engine();
        let handle = engine.start_workflow(start_req("creq")).unwrap();
        engine
            .cancel_workflow("default", "creq", "user asked")
            .unwrap();
        assert_eq!(
            engine.run_status(handle.run_id),
            Some(ExecutionStatus::Running)
        );
        let state = engine.replay(handle.run_id).unwrap();
        assert!(state.cancel_requested);
        assert_eq!(state.cancel_reason.as_deref(), Some("user asked"));
    }
}
