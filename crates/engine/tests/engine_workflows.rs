//! End-to-end scenarios driving the engine through real workers: activity
//! retries, timers, signals, queries, updates, children, sagas,
//! continue-as-new, cancellation, and visibility.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use windlass_engine::{
    ActivityOptions, Command, Engine, EngineError, EngineResult, ExecutionStatus, Failure,
    FailureKind, ListFilter, Outcome, RetryPolicy, StartWorkflowRequest, TimeoutKind, Worker,
    WorkerHandle, WorkerOptions, WorkerRegistry, WorkflowDefinition, WorkflowState,
};

struct Harness {
    engine: Engine,
    _worker: WorkerHandle,
}

fn harness(queue: &str, setup: impl FnOnce(&WorkerRegistry)) -> Harness {
    let registry = Arc::new(WorkerRegistry::new());
    setup(&registry);
    let engine = Engine::new(registry.clone());
    let worker = Worker::new(engine.clone(), registry, WorkerOptions::new(queue)).start();
    Harness {
        engine,
        _worker: worker,
    }
}

async fn result_of(engine: &Engine, workflow_id: &str) -> EngineResult<serde_json::Value> {
    tokio::time::timeout(
        Duration::from_secs(10),
        engine.get_result("default", workflow_id),
    )
    .await
    .expect("workflow did not close in time")
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(10),
        backoff_coefficient: 1.5,
        maximum_interval: Duration::from_millis(50),
        maximum_attempts: max_attempts,
        non_retryable_error_types: vec![],
    }
}

/// Schedules one activity and completes with whatever it produced.
struct SingleActivity {
    activity_type: &'static str,
    options: ActivityOptions,
}

impl WorkflowDefinition for SingleActivity {
    fn decide(&self, state: &WorkflowState) -> EngineResult<Vec<Command>> {
        if !state.activity_scheduled("a1") {
            return Ok(vec![Command::schedule_activity(
                "a1",
                self.activity_type,
                state.input.clone(),
                self.options.clone(),
            )]);
        }
        match state.activity_resolution("a1") {
            Some(Outcome::Completed { result }) => Ok(vec![Command::complete(result.clone())]),
            Some(Outcome::Failed { failure }) => Ok(vec![Command::fail(failure.clone())]),
            None => Ok(vec![]),
        }
    }
}

#[tokio::test]
async fn test_activity_completes_and_result_flows_through() {
    let h = harness("e2e-basic", |registry| {
        registry.register_workflow(
            "echo_wf",
            Arc::new(SingleActivity {
                activity_type: "echo",
                options: ActivityOptions::default(),
            }),
        );
        registry.register_activity("echo", |_ctx, input| async move { Ok(input) });
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "echo_wf",
            "basic-1",
            "e2e-basic",
            json!({"payload": 42}),
        ))
        .unwrap();
    let result = result_of(&h.engine, "basic-1").await.unwrap();
    assert_eq!(result, json!({"payload": 42}));
    let info = h.engine.describe_execution("default", "basic-1").unwrap();
    assert_eq!(info.status, ExecutionStatus::Completed);
    assert!(info.close_time.is_some());
}

#[tokio::test]
async fn test_activity_retries_until_third_attempt_succeeds() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_activity = calls.clone();
    let h = harness("e2e-retry", move |registry| {
        registry.register_workflow(
            "flaky_wf",
            Arc::new(SingleActivity {
                activity_type: "flaky",
                options: ActivityOptions {
                    retry_policy: fast_retries(5),
                    ..Default::default()
                },
            }),
        );
        registry.register_activity("flaky", move |_ctx, _input| {
            let calls = calls_in_activity.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    return Err(Failure::application(format!("transient failure {n}")));
                }
                Ok(json!(n))
            }
        });
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "flaky_wf",
            "retry-1",
            "e2e-retry",
            json!(null),
        ))
        .unwrap();
    let result = result_of(&h.engine, "retry-1").await.unwrap();
    assert_eq!(result, json!(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_activity_exhaustion_fails_the_workflow_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_activity = calls.clone();
    let h = harness("e2e-exhaust", move |registry| {
        registry.register_workflow(
            "doomed_wf",
            Arc::new(SingleActivity {
                activity_type: "doomed",
                options: ActivityOptions {
                    retry_policy: fast_retries(2),
                    ..Default::default()
                },
            }),
        );
        registry.register_activity("doomed", move |_ctx, _input| {
            let calls = calls_in_activity.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Failure::application("always broken"))
            }
        });
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "doomed_wf",
            "exhaust-1",
            "e2e-exhaust",
            json!(null),
        ))
        .unwrap();
    let err = result_of(&h.engine, "exhaust-1").await.unwrap_err();
    match err {
        EngineError::WorkflowFailure(failure) => {
            assert_eq!(failure.message, "always broken");
        }
        other => panic!("expected workflow failure, got {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_non_retryable_failure_skips_remaining_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_activity = calls.clone();
    let h = harness("e2e-nonretry", move |registry| {
        registry.register_workflow(
            "fatal_wf",
            Arc::new(SingleActivity {
                activity_type: "fatal",
                options: ActivityOptions {
                    retry_policy: fast_retries(5),
                    ..Default::default()
                },
            }),
        );
        registry.register_activity("fatal", move |_ctx, _input| {
            let calls = calls_in_activity.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Failure::non_retryable("invalid input, retrying is useless"))
            }
        });
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "fatal_wf",
            "fatal-1",
            "e2e-nonretry",
            json!(null),
        ))
        .unwrap();
    let err = result_of(&h.engine, "fatal-1").await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowFailure(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unpolled_activity_times_out_schedule_to_start() {
    let h = harness("e2e-s2s", |registry| {
        registry.register_workflow(
            "stranded_wf",
            Arc::new(SingleActivity {
                activity_type: "stranded",
                options: ActivityOptions {
                    // Dispatched to a queue nobody polls.
                    task_queue: Some("e2e-s2s-unstaffed".to_string()),
                    schedule_to_start_timeout: Some(Duration::from_millis(100)),
                    retry_policy: fast_retries(5),
                    ..Default::default()
                },
            }),
        );
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "stranded_wf",
            "s2s-1",
            "e2e-s2s",
            json!(null),
        ))
        .unwrap();
    let err = result_of(&h.engine, "s2s-1").await.unwrap_err();
    match err {
        EngineError::WorkflowFailure(failure) => {
            // No worker showed up; retrying would sit unmatched again, so
            // the timeout surfaces despite the remaining retry budget.
            assert!(matches!(
                failure.kind,
                FailureKind::Timeout {
                    timeout: TimeoutKind::ScheduleToStart
                }
            ));
        }
        other => panic!("expected workflow failure, got {other}"),
    }
}

#[tokio::test]
async fn test_heartbeat_timeout_retries_and_next_attempt_succeeds() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_activity = calls.clone();
    let h = harness("e2e-hb-timeout", move |registry| {
        registry.register_workflow(
            "silent_wf",
            Arc::new(SingleActivity {
                activity_type: "silent",
                options: ActivityOptions {
                    heartbeat_timeout: Some(Duration::from_millis(100)),
                    retry_policy: fast_retries(3),
                    ..Default::default()
                },
            }),
        );
        registry.register_activity("silent", move |ctx, _input| {
            let calls = calls_in_activity.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt == 1 {
                    // Never heartbeats; the deadline expires while it hangs.
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(json!(ctx.attempt))
            }
        });
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "silent_wf",
            "hb-timeout-1",
            "e2e-hb-timeout",
            json!(null),
        ))
        .unwrap();
    let result = result_of(&h.engine, "hb-timeout-1").await.unwrap();
    assert_eq!(result, json!(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Waits on one durable timer, then completes.
struct TimerWorkflow;

impl WorkflowDefinition for TimerWorkflow {
    fn decide(&self, state: &WorkflowState) -> EngineResult<Vec<Command>> {
        if state.timer("t1").is_none() {
            return Ok(vec![Command::start_timer("t1", Duration::from_millis(50))]);
        }
        if state.timer_fired("t1") {
            return Ok(vec![Command::complete(json!("timer-done"))]);
        }
        Ok(vec![])
    }
}

#[tokio::test]
async fn test_durable_timer_fires_and_resumes_the_run() {
    let h = harness("e2e-timer", |registry| {
        registry.register_workflow("timer_wf", Arc::new(TimerWorkflow));
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "timer_wf",
            "timer-1",
            "e2e-timer",
            json!(null),
        ))
        .unwrap();
    let result = result_of(&h.engine, "timer-1").await.unwrap();
    assert_eq!(result, json!("timer-done"));
}

/// Counts down through continue-as-new, one run per decrement.
struct CountdownWorkflow;

impl WorkflowDefinition for CountdownWorkflow {
    fn decide(&self, state: &WorkflowState) -> EngineResult<Vec<Command>> {
        let n = state.input.as_i64().unwrap_or(0);
        if n > 0 {
            return Ok(vec![Command::ContinueAsNew {
                input: json!(n - 1),
            }]);
        }
        Ok(vec![Command::complete(json!("done"))])
    }
}

#[tokio::test]
async fn test_continue_as_new_chains_to_a_fresh_run() {
    let h = harness("e2e-can", |registry| {
        registry.register_workflow("countdown_wf", Arc::new(CountdownWorkflow));
    });
    let first = h
        .engine
        .start_workflow(StartWorkflowRequest::new(
            "countdown_wf",
            "countdown-1",
            "e2e-can",
            json!(3),
        ))
        .unwrap();
    let result = result_of(&h.engine, "countdown-1").await.unwrap();
    assert_eq!(result, json!("done"));

    let final_run = h.engine.current_run_id("default", "countdown-1").unwrap();
    assert_ne!(final_run, first.run_id);
    let first_info = h.engine.describe_run(first.run_id).unwrap();
    assert_eq!(first_info.status, ExecutionStatus::ContinuedAsNew);
    // The successor's history starts fresh with its own start event.
    let final_history = h.engine.get_history(final_run).unwrap();
    assert_eq!(final_history[0].event_id, 1);
}

/// Accumulates "value" signals; exposes running statistics as a query.
struct StatsWorkflow;

impl WorkflowDefinition for StatsWorkflow {
    fn decide(&self, state: &WorkflowState) -> EngineResult<Vec<Command>> {
        if state.cancel_requested {
            return Ok(vec![Command::CancelWorkflow { details: None }]);
        }
        Ok(vec![])
    }

    fn handle_query(
        &self,
        state: &WorkflowState,
        query_name: &str,
        _args: &serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        if query_name != "stats" {
            return Err(EngineError::Validation(format!(
                "unknown query: {query_name}"
            )));
        }
        let values: Vec<i64> = state
            .signals_named("value")
            .filter_map(|s| s.as_i64())
            .collect();
        if values.is_empty() {
            return Ok(json!({"count": 0}));
        }
        let sum: i64 = values.iter().sum();
        Ok(json!({
            "count": values.len(),
            "sum": sum,
            "avg": sum / values.len() as i64,
            "min": values.iter().min(),
            "max": values.iter().max(),
        }))
    }
}

#[tokio::test]
async fn test_signals_accumulate_and_query_reads_consistent_stats() {
    let h = harness("e2e-stats", |registry| {
        registry.register_workflow("stats_wf", Arc::new(StatsWorkflow));
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "stats_wf",
            "stats-1",
            "e2e-stats",
            json!(null),
        ))
        .unwrap();
    h.engine
        .signal_workflow("default", "stats-1", "value", json!(10))
        .unwrap();
    h.engine
        .signal_workflow("default", "stats-1", "value", json!(20))
        .unwrap();
    let stats = h
        .engine
        .query_workflow("default", "stats-1", "stats", json!(null))
        .unwrap();
    assert_eq!(
        stats,
        json!({"count": 2, "sum": 30, "avg": 15, "min": 10, "max": 20})
    );
}

#[tokio::test]
async fn test_cooperative_cancel_closes_as_canceled() {
    let h = harness("e2e-cancel", |registry| {
        registry.register_workflow("stats_wf", Arc::new(StatsWorkflow));
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "stats_wf",
            "cancel-1",
            "e2e-cancel",
            json!(null),
        ))
        .unwrap();
    h.engine
        .cancel_workflow("default", "cancel-1", "user asked")
        .unwrap();
    let err = result_of(&h.engine, "cancel-1").await.unwrap_err();
    match err {
        EngineError::WorkflowFailure(failure) => {
            assert!(matches!(failure.kind, FailureKind::Canceled));
        }
        other => panic!("expected canceled failure, got {other}"),
    }
    let info = h.engine.describe_execution("default", "cancel-1").unwrap();
    assert_eq!(info.status, ExecutionStatus::Canceled);
}

#[tokio::test]
async fn test_terminate_forces_closure_without_workflow_code() {
    // No definition registered on purpose: terminate must not need one.
    let h = harness("e2e-term", |_registry| {});
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "absent_wf",
            "term-1",
            "e2e-term-other-queue",
            json!(null),
        ))
        .unwrap();
    h.engine
        .terminate_workflow("default", "term-1", "operator")
        .unwrap();
    let err = result_of(&h.engine, "term-1").await.unwrap_err();
    match err {
        EngineError::WorkflowFailure(failure) => {
            assert!(matches!(failure.kind, FailureKind::Terminated));
            assert_eq!(failure.message, "operator");
        }
        other => panic!("expected terminated failure, got {other}"),
    }
}

/// Tracks a single value settable through the "set" update; negative values
/// are rejected by the validator before reaching history.
struct SettableWorkflow;

impl WorkflowDefinition for SettableWorkflow {
    fn decide(&self, state: &WorkflowState) -> EngineResult<Vec<Command>> {
        let commands = state
            .pending_updates()
            .into_iter()
            .map(|u| Command::CompleteUpdate {
                update_id: u.update_id.clone(),
                outcome: Outcome::Completed {
                    result: u.input.clone(),
                },
            })
            .collect();
        Ok(commands)
    }

    fn handle_query(
        &self,
        state: &WorkflowState,
        query_name: &str,
        _args: &serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        if query_name != "value" {
            return Err(EngineError::Validation(format!(
                "unknown query: {query_name}"
            )));
        }
        let value = state
            .updates
            .iter()
            .rev()
            .find_map(|u| match &u.outcome {
                Some(Outcome::Completed { result }) => Some(result.clone()),
                _ => None,
            })
            .unwrap_or(serde_json::Value::Null);
        Ok(value)
    }

    fn validate_update(
        &self,
        _state: &WorkflowState,
        _update_name: &str,
        input: &serde_json::Value,
    ) -> EngineResult<()> {
        if input.as_i64().unwrap_or(0) < 0 {
            return Err(EngineError::Validation(
                "value must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_update_executes_in_workflow_and_resolves_caller() {
    let h = harness("e2e-update", |registry| {
        registry.register_workflow("settable_wf", Arc::new(SettableWorkflow));
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "settable_wf",
            "upd-1",
            "e2e-update",
            json!(null),
        ))
        .unwrap();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        h.engine.update_workflow("default", "upd-1", "set", json!(7)),
    )
    .await
    .expect("update did not resolve")
    .unwrap();
    assert_eq!(outcome, Outcome::Completed { result: json!(7) });
    let value = h
        .engine
        .query_workflow("default", "upd-1", "value", json!(null))
        .unwrap();
    assert_eq!(value, json!(7));

    // The validator rejects synchronously; nothing new lands in history.
    let err = h
        .engine
        .update_workflow("default", "upd-1", "set", json!(-10))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(
        h.engine
            .query_workflow("default", "upd-1", "value", json!(null))
            .unwrap(),
        json!(7)
    );
}

/// Parent that starts one child and completes with the child's result.
struct ParentWorkflow;

impl WorkflowDefinition for ParentWorkflow {
    fn decide(&self, state: &WorkflowState) -> EngineResult<Vec<Command>> {
        match state.child("doubler-child") {
            None => Ok(vec![Command::StartChildWorkflow {
                workflow_id: "doubler-child".to_string(),
                workflow_type: "doubler_wf".to_string(),
                input: state.input.clone(),
                task_queue: None,
            }]),
            Some(child) => match &child.outcome {
                Some(Outcome::Completed { result }) => Ok(vec![Command::complete(result.clone())]),
                Some(Outcome::Failed { failure }) => Ok(vec![Command::fail(failure.clone())]),
                None => Ok(vec![]),
            },
        }
    }
}

/// Child that doubles its numeric input.
struct DoublerWorkflow;

impl WorkflowDefinition for DoublerWorkflow {
    fn decide(&self, state: &WorkflowState) -> EngineResult<Vec<Command>> {
        let n = state.input.as_i64().unwrap_or(0);
        Ok(vec![Command::complete(json!(n * 2))])
    }
}

#[tokio::test]
async fn test_child_workflow_result_propagates_to_parent() {
    let h = harness("e2e-child", |registry| {
        registry.register_workflow("parent_wf", Arc::new(ParentWorkflow));
        registry.register_workflow("doubler_wf", Arc::new(DoublerWorkflow));
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "parent_wf",
            "parent-1",
            "e2e-child",
            json!(21),
        ))
        .unwrap();
    let result = result_of(&h.engine, "parent-1").await.unwrap();
    assert_eq!(result, json!(42));
    // The child is an execution of its own, linked to the parent.
    let child_info = h.engine.describe_execution("default", "doubler-child").unwrap();
    assert_eq!(child_info.status, ExecutionStatus::Completed);
    let parent_run = h.engine.current_run_id("default", "parent-1").unwrap();
    assert_eq!(child_info.parent_run_id, Some(parent_run));
}

/// Saga: reserve, then book (which always fails terminally), then compensate
/// with release before surfacing the booking failure.
struct TripSaga;

impl WorkflowDefinition for TripSaga {
    fn decide(&self, state: &WorkflowState) -> EngineResult<Vec<Command>> {
        let options = ActivityOptions {
            retry_policy: RetryPolicy::no_retries(),
            ..Default::default()
        };
        if !state.activity_scheduled("reserve") {
            return Ok(vec![Command::schedule_activity(
                "reserve",
                "reserve",
                json!(null),
                options.clone(),
            )]);
        }
        match state.activity_resolution("reserve") {
            Some(Outcome::Completed { .. }) => {}
            Some(Outcome::Failed { failure }) => {
                return Ok(vec![Command::fail(failure.clone())]);
            }
            None => return Ok(vec![]),
        }
        if !state.activity_scheduled("book") {
            return Ok(vec![Command::schedule_activity(
                "book", "book", json!(null), options.clone(),
            )]);
        }
        let booking_failure = match state.activity_resolution("book") {
            Some(Outcome::Completed { result }) => {
                return Ok(vec![Command::complete(result.clone())]);
            }
            Some(Outcome::Failed { failure }) => failure.clone(),
            None => return Ok(vec![]),
        };
        if !state.activity_scheduled("release") {
            return Ok(vec![Command::schedule_activity(
                "release", "release", json!(null), options,
            )]);
        }
        match state.activity_resolution("release") {
            Some(_) => Ok(vec![Command::fail(booking_failure)]),
            None => Ok(vec![]),
        }
    }
}

#[tokio::test]
async fn test_saga_compensates_before_failing() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let reserve_log = log.clone();
    let release_log = log.clone();
    let h = harness("e2e-saga", move |registry| {
        registry.register_workflow("trip_saga", Arc::new(TripSaga));
        registry.register_activity("reserve", move |_ctx, _input| {
            let log = reserve_log.clone();
            async move {
                log.lock().unwrap().push("reserve");
                Ok(json!("reserved"))
            }
        });
        registry.register_activity("book", |_ctx, _input| async move {
            Err(Failure::non_retryable("no seats left"))
        });
        registry.register_activity("release", move |_ctx, _input| {
            let log = release_log.clone();
            async move {
                log.lock().unwrap().push("release");
                Ok(json!("released"))
            }
        });
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "trip_saga",
            "saga-1",
            "e2e-saga",
            json!(null),
        ))
        .unwrap();
    let err = result_of(&h.engine, "saga-1").await.unwrap_err();
    match err {
        EngineError::WorkflowFailure(failure) => assert_eq!(failure.message, "no seats left"),
        other => panic!("expected booking failure, got {other}"),
    }
    assert_eq!(*log.lock().unwrap(), vec!["reserve", "release"]);
}

#[tokio::test]
async fn test_heartbeat_details_resume_the_next_attempt() {
    let h = harness("e2e-heartbeat", |registry| {
        registry.register_workflow(
            "resumable_wf",
            Arc::new(SingleActivity {
                activity_type: "resumable",
                options: ActivityOptions {
                    retry_policy: fast_retries(3),
                    heartbeat_timeout: Some(Duration::from_secs(5)),
                    ..Default::default()
                },
            }),
        );
        registry.register_activity("resumable", |ctx, _input| async move {
            match ctx.heartbeat_details.as_ref().and_then(|d| d.as_i64()) {
                // First attempt: checkpoint progress, then crash.
                None => {
                    ctx.record_heartbeat(json!(5));
                    Err(Failure::application("crash after checkpoint"))
                }
                // Retry resumes from the checkpoint instead of restarting.
                Some(progress) => Ok(json!(progress + 5)),
            }
        });
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "resumable_wf",
            "hb-1",
            "e2e-heartbeat",
            json!(null),
        ))
        .unwrap();
    let result = result_of(&h.engine, "hb-1").await.unwrap();
    assert_eq!(result, json!(10));
}

#[tokio::test]
async fn test_local_activity_runs_without_queue_roundtrip() {
    let h = harness("e2e-local", |registry| {
        registry.register_workflow(
            "local_wf",
            Arc::new(SingleActivity {
                activity_type: "quickly",
                options: ActivityOptions {
                    local: true,
                    retry_policy: fast_retries(3),
                    ..Default::default()
                },
            }),
        );
        registry.register_activity("quickly", |_ctx, input| async move {
            Ok(json!(input.as_i64().unwrap_or(0) + 1))
        });
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "local_wf",
            "local-1",
            "e2e-local",
            json!(41),
        ))
        .unwrap();
    let result = result_of(&h.engine, "local-1").await.unwrap();
    assert_eq!(result, json!(42));
}

#[tokio::test]
async fn test_run_timeout_forces_timed_out_closure() {
    let h = harness("e2e-runtimeout", |registry| {
        registry.register_workflow("stats_wf", Arc::new(StatsWorkflow));
    });
    let mut req = StartWorkflowRequest::new("stats_wf", "rt-1", "e2e-runtimeout", json!(null));
    req.run_timeout = Some(Duration::from_millis(100));
    h.engine.start_workflow(req).unwrap();
    let err = result_of(&h.engine, "rt-1").await.unwrap_err();
    match err {
        EngineError::WorkflowFailure(failure) => {
            assert!(matches!(failure.kind, FailureKind::Timeout { .. }));
        }
        other => panic!("expected timeout failure, got {other}"),
    }
    let info = h.engine.describe_execution("default", "rt-1").unwrap();
    assert_eq!(info.status, ExecutionStatus::TimedOut);
}

#[tokio::test]
async fn test_visibility_list_and_count_with_filters() {
    let h = harness("e2e-vis", |registry| {
        registry.register_workflow("stats_wf", Arc::new(StatsWorkflow));
        registry.register_workflow("countdown_wf", Arc::new(CountdownWorkflow));
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "stats_wf",
            "orders-1",
            "e2e-vis",
            json!(null),
        ))
        .unwrap();
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "countdown_wf",
            "billing-1",
            "e2e-vis",
            json!(0),
        ))
        .unwrap();
    result_of(&h.engine, "billing-1").await.unwrap();

    let all = ListFilter {
        namespace: Some("default".to_string()),
        ..Default::default()
    };
    assert_eq!(h.engine.count_executions(&all), 2);

    let running = ListFilter {
        status: Some(ExecutionStatus::Running),
        ..Default::default()
    };
    let open = h.engine.list_executions(&running);
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].workflow_id, "orders-1");

    let by_prefix = ListFilter {
        workflow_id_prefix: Some("bill".to_string()),
        ..Default::default()
    };
    let billed = h.engine.list_executions(&by_prefix);
    assert_eq!(billed.len(), 1);
    assert_eq!(billed[0].workflow_type, "countdown_wf");
}

#[tokio::test]
async fn test_id_reuse_policy_applies_after_closure() {
    let h = harness("e2e-reuse", |registry| {
        registry.register_workflow("countdown_wf", Arc::new(CountdownWorkflow));
    });
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "countdown_wf",
            "reuse-1",
            "e2e-reuse",
            json!(0),
        ))
        .unwrap();
    result_of(&h.engine, "reuse-1").await.unwrap();

    let mut rejected = StartWorkflowRequest::new("countdown_wf", "reuse-1", "e2e-reuse", json!(0));
    rejected.id_reuse_policy = windlass_engine::WorkflowIdReusePolicy::RejectDuplicate;
    assert!(matches!(
        h.engine.start_workflow(rejected),
        Err(EngineError::AlreadyExists(_))
    ));

    let mut failed_only =
        StartWorkflowRequest::new("countdown_wf", "reuse-1", "e2e-reuse", json!(0));
    failed_only.id_reuse_policy = windlass_engine::WorkflowIdReusePolicy::AllowDuplicateFailedOnly;
    assert!(matches!(
        h.engine.start_workflow(failed_only),
        Err(EngineError::AlreadyExists(_))
    ));

    // The default policy allows reuse once the previous run closed.
    h.engine
        .start_workflow(StartWorkflowRequest::new(
            "countdown_wf",
            "reuse-1",
            "e2e-reuse",
            json!(0),
        ))
        .unwrap();
    result_of(&h.engine, "reuse-1").await.unwrap();
}
