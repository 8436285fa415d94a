//! Worker surface: workflow definitions, activity handlers, and the poll
//! loops that drive them.
//!
//! A workflow definition is a pure decision function over replayed state.
//! It must be deterministic: no clocks, randomness, or I/O, only the state
//! handed to it. Activities are plain async functions and may do anything.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult, Failure};
use crate::machine::commands::Command;
use crate::machine::state::WorkflowState;

/// Outcome of one activity attempt.
pub type ActivityResult = Result<serde_json::Value, Failure>;

/// Boxed activity handler stored in the registry.
pub type ActivityHandlerFn =
    dyn Fn(ActivityContext, serde_json::Value) -> BoxFuture<'static, ActivityResult> + Send + Sync;

/// Deterministic workflow logic, invoked on every workflow task with the
/// state replayed from history.
pub trait WorkflowDefinition: Send + Sync {
    /// Produce the next batch of commands for the run. Returning no commands
    /// parks the run until the next triggering event.
    fn decide(&self, state: &WorkflowState) -> EngineResult<Vec<Command>>;

    /// Answer a read-only query against the replayed state.
    fn handle_query(
        &self,
        _state: &WorkflowState,
        query_name: &str,
        _args: &serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        Err(EngineError::Validation(format!(
            "unknown query: {query_name}"
        )))
    }

    /// Validate an update before it is accepted into history. Read-only;
    /// an error rejects the update synchronously with no history trace.
    fn validate_update(
        &self,
        _state: &WorkflowState,
        _update_name: &str,
        _input: &serde_json::Value,
    ) -> EngineResult<()> {
        Ok(())
    }
}

/// Registered workflow definitions and activity handlers, shared between the
/// engine (queries, update validation, local activities) and workers.
#[derive(Default)]
pub struct WorkerRegistry {
    workflows: RwLock<HashMap<String, Arc<dyn WorkflowDefinition>>>,
    activities: RwLock<HashMap<String, Arc<ActivityHandlerFn>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow(
        &self,
        workflow_type: impl Into<String>,
        definition: Arc<dyn WorkflowDefinition>,
    ) {
        self.workflows
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(workflow_type.into(), definition);
    }

    pub fn register_activity<F, Fut>(&self, activity_type: impl Into<String>, handler: F)
    where
        F: Fn(ActivityContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityResult> + Send + 'static,
    {
        let boxed: Arc<ActivityHandlerFn> =
            Arc::new(move |ctx, input| handler(ctx, input).boxed());
        self.activities
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(activity_type.into(), boxed);
    }

    pub fn workflow(&self, workflow_type: &str) -> Option<Arc<dyn WorkflowDefinition>> {
        self.workflows
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(workflow_type)
            .cloned()
    }

    pub fn activity(&self, activity_type: &str) -> Option<Arc<ActivityHandlerFn>> {
        self.activities
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(activity_type)
            .cloned()
    }
}

/// A claimed activity attempt delivered to a worker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActivityTask {
    pub run_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub attempt: u32,
    /// Details from the last heartbeat of a previous attempt, if any.
    pub heartbeat_details: Option<serde_json::Value>,
}

/// Handle given to activity handlers for heartbeating and cancellation
/// checks.
pub struct ActivityContext {
    engine: Engine,
    pub run_id: Uuid,
    pub activity_id: String,
    pub attempt: u32,
    /// Progress recorded by the previous attempt, for resumption.
    pub heartbeat_details: Option<serde_json::Value>,
}

impl ActivityContext {
    pub(crate) fn new(engine: Engine, task: &ActivityTask) -> Self {
        Self {
            engine,
            run_id: task.run_id,
            activity_id: task.activity_id.clone(),
            attempt: task.attempt,
            heartbeat_details: task.heartbeat_details.clone(),
        }
    }

    /// Record progress. Returns true when cancellation has been requested
    /// and the handler should stop cooperatively.
    pub fn record_heartbeat(&self, details: serde_json::Value) -> bool {
        self.engine
            .record_activity_heartbeat(self.run_id, &self.activity_id, self.attempt, Some(details))
            .unwrap_or(true)
    }

    /// Check the cancellation flag without recording new details.
    pub fn cancel_requested(&self) -> bool {
        self.engine
            .record_activity_heartbeat(self.run_id, &self.activity_id, self.attempt, None)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub task_queue: String,
    pub max_concurrent_activities: usize,
    pub poll_timeout: Duration,
}

impl WorkerOptions {
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            max_concurrent_activities: 16,
            poll_timeout: Duration::from_millis(500),
        }
    }
}

/// A worker bound to one task queue. `start` spawns one workflow-task loop
/// and one activity loop; both run until the handle is shut down.
pub struct Worker {
    engine: Engine,
    registry: Arc<WorkerRegistry>,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(engine: Engine, registry: Arc<WorkerRegistry>, options: WorkerOptions) -> Self {
        Self {
            engine,
            registry,
            options,
        }
    }

    pub fn start(self) -> WorkerHandle {
        let wf_loop = tokio::spawn(workflow_loop(
            self.engine.clone(),
            self.registry.clone(),
            self.options.clone(),
        ));
        let act_loop = tokio::spawn(activity_loop(
            self.engine,
            self.registry,
            self.options,
        ));
        WorkerHandle {
            tasks: vec![wf_loop, act_loop],
        }
    }
}

/// Aborts the poll loops on shutdown or drop.
pub struct WorkerHandle {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn workflow_loop(engine: Engine, registry: Arc<WorkerRegistry>, options: WorkerOptions) {
    loop {
        let task = match engine
            .poll_workflow_task(&options.task_queue, options.poll_timeout)
            .await
        {
            Some(task) => task,
            None => continue,
        };
        process_workflow_task(&engine, &registry, task).await;
    }
}

async fn process_workflow_task(
    engine: &Engine,
    registry: &WorkerRegistry,
    task: crate::dispatch::WorkflowTask,
) {
    let state = match engine.replay(task.run_id) {
        Ok(state) => state,
        Err(e) => {
            warn!(run_id = %task.run_id, error = %e, "Failed to replay run, dropping task");
            return;
        }
    };
    let definition = match registry.workflow(&state.workflow_type) {
        Some(d) => d,
        None => {
            error!(
                run_id = %task.run_id,
                workflow_type = %state.workflow_type,
                "No definition registered for workflow type"
            );
            let failure = Failure::non_retryable(format!(
                "workflow type {} is not registered",
                state.workflow_type
            ));
            if let Err(e) = engine.fail_workflow_task(task.task_token, failure) {
                debug!(run_id = %task.run_id, error = %e, "Workflow task failure report dropped");
            }
            return;
        }
    };
    let starting_event_id = state.last_event_id;
    let commands = match definition.decide(&state) {
        Ok(commands) => commands,
        Err(e) => vec![Command::fail(Failure::application(e.to_string()))],
    };
    match engine.complete_workflow_task(task.task_token, starting_event_id, commands) {
        Ok(()) => {}
        Err(EngineError::NonDeterminism(reason)) => {
            // History advanced under us; the engine rescheduled the task.
            debug!(run_id = %task.run_id, reason, "Workflow task superseded");
        }
        Err(e) => {
            warn!(run_id = %task.run_id, error = %e, "Workflow task completion rejected");
        }
    }
}

async fn activity_loop(engine: Engine, registry: Arc<WorkerRegistry>, options: WorkerOptions) {
    let slots = Arc::new(Semaphore::new(options.max_concurrent_activities));
    loop {
        let permit = match slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let task = match engine
            .poll_activity_task(&options.task_queue, options.poll_timeout)
            .await
        {
            Some(task) => task,
            None => continue,
        };
        let engine = engine.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            run_activity(&engine, &registry, task).await;
            drop(permit);
        });
    }
}

async fn run_activity(engine: &Engine, registry: &WorkerRegistry, task: ActivityTask) {
    let handler = match registry.activity(&task.activity_type) {
        Some(h) => h,
        None => {
            error!(
                run_id = %task.run_id,
                activity_type = %task.activity_type,
                "No handler registered for activity type"
            );
            let failure = Failure::non_retryable(format!(
                "activity type {} is not registered",
                task.activity_type
            ));
            if let Err(e) =
                engine.fail_activity(task.run_id, &task.activity_id, task.attempt, failure)
            {
                debug!(run_id = %task.run_id, error = %e, "Activity failure report dropped");
            }
            return;
        }
    };
    let ctx = engine.activity_context(&task);
    let result = handler(ctx, task.input.clone()).await;
    let report = match result {
        Ok(value) => engine.complete_activity(task.run_id, &task.activity_id, task.attempt, value),
        Err(failure) => {
            engine.fail_activity(task.run_id, &task.activity_id, task.attempt, failure)
        }
    };
    if let Err(e) = report {
        debug!(
            run_id = %task.run_id,
            activity_id = %task.activity_id,
            attempt = task.attempt,
            error = %e,
            "Activity report dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopWorkflow;

    impl WorkflowDefinition for NoopWorkflow {
        fn decide(&self, _state: &WorkflowState) -> EngineResult<Vec<Command>> {
            Ok(vec![Command::complete(serde_json::json!("ok"))])
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = WorkerRegistry::new();
        registry.register_workflow("noop", Arc::new(NoopWorkflow));
        registry.register_activity("echo", |_ctx, input| async move { Ok(input) });
        assert!(registry.workflow("noop").is_some());
        assert!(registry.workflow("other").is_none());
        assert!(registry.activity("echo").is_some());
        assert!(registry.activity("other").is_none());
    }

    #[test]
    fn test_default_query_handler_rejects_unknown() {
        let registry = WorkerRegistry::new();
        registry.register_workflow("noop", Arc::new(NoopWorkflow));
        let def = registry.workflow("noop").unwrap();
        let events = vec![crate::history::HistoryEvent {
            event_id: 1,
            timestamp: chrono::Utc::now(),
            attributes: crate::history::EventAttributes::WorkflowExecutionStarted {
                workflow_type: "noop".into(),
                workflow_id: "w".into(),
                task_queue: "q".into(),
                input: serde_json::Value::Null,
                continued_from_run_id: None,
                parent_run_id: None,
            },
        }];
        let state = WorkflowState::from_events(&events).unwrap();
        let err = def
            .handle_query(&state, "missing", &serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
