//! Message routing into running workflows: signals, queries, and two-phase
//! updates.
//!
//! Signals are fire-and-forget history appends. Queries never touch history;
//! they replay the run and call the definition's query handler, which works
//! on closed runs too. Updates go through a synchronous validator first;
//! accepted updates land in history and resolve through a waiter once the
//! workflow completes them in a later task.

use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult, Failure};
use crate::history::{EventAttributes, Outcome};

impl Engine {
    /// Deliver a signal to the current run of a workflow id.
    pub fn signal_workflow(
        &self,
        namespace: &str,
        workflow_id: &str,
        signal_name: &str,
        input: serde_json::Value,
    ) -> EngineResult<()> {
        if signal_name.is_empty() {
            return Err(EngineError::Validation("signal_name is required".into()));
        }
        let run_id = self.current_run_id(namespace, workflow_id)?;
        if self.run_status_or_not_found(run_id)?.is_terminal() {
            return Err(EngineError::NotFound(format!(
                "workflow {namespace}/{workflow_id} has closed"
            )));
        }
        self.inner.log.append(
            run_id,
            None,
            vec![EventAttributes::WorkflowExecutionSignaled {
                signal_name: signal_name.to_string(),
                input,
            }],
        )?;
        debug!(run_id = %run_id, signal_name, "Signal delivered");
        self.schedule_workflow_task(run_id);
        Ok(())
    }

    /// Run a read-only query against the current run. Works on closed runs;
    /// the state is whatever the final history folds to.
    pub fn query_workflow(
        &self,
        namespace: &str,
        workflow_id: &str,
        query_name: &str,
        args: serde_json::Value,
    ) -> EngineResult<serde_json::Value> {
        let run_id = self.current_run_id(namespace, workflow_id)?;
        let state = self.replay(run_id)?;
        let definition = self
            .inner
            .registry
            .workflow(&state.workflow_type)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "workflow type {} is not registered",
                    state.workflow_type
                ))
            })?;
        definition.handle_query(&state, query_name, &args)
    }

    /// Send an update and await its outcome. The definition's validator runs
    /// first against current state; a validation error rejects the update
    /// with no history trace. Accepted updates are durable and resolve when
    /// the workflow completes them.
    pub async fn update_workflow(
        &self,
        namespace: &str,
        workflow_id: &str,
        update_name: &str,
        input: serde_json::Value,
    ) -> EngineResult<Outcome> {
        if update_name.is_empty() {
            return Err(EngineError::Validation("update_name is required".into()));
        }
        let run_id = self.current_run_id(namespace, workflow_id)?;
        if self.run_status_or_not_found(run_id)?.is_terminal() {
            return Err(EngineError::NotFound(format!(
                "workflow {namespace}/{workflow_id} has closed"
            )));
        }
        let state = self.replay(run_id)?;
        let definition = self
            .inner
            .registry
            .workflow(&state.workflow_type)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "workflow type {} is not registered",
                    state.workflow_type
                ))
            })?;
        definition.validate_update(&state, update_name, &input)?;

        let update_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self
                .inner
                .update_waiters
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            waiters
                .entry(run_id)
                .or_default()
                .insert(update_id.clone(), tx);
        }
        if let Err(e) = self.inner.log.append(
            run_id,
            None,
            vec![EventAttributes::WorkflowExecutionUpdateAccepted {
                update_id: update_id.clone(),
                update_name: update_name.to_string(),
                input,
            }],
        ) {
            let mut waiters = self
                .inner
                .update_waiters
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if let Some(for_run) = waiters.get_mut(&run_id) {
                for_run.remove(&update_id);
            }
            return Err(e);
        }
        info!(run_id = %run_id, update_name, update_id = %update_id, "Update accepted");
        self.schedule_workflow_task(run_id);

        rx.await
            .map_err(|_| EngineError::Internal("update waiter dropped".to_string()))
    }

    /// Resolve the caller waiting on an update, if still present.
    pub(crate) fn resolve_update_waiter(&self, run_id: Uuid, update_id: &str, outcome: Outcome) {
        let sender = {
            let mut waiters = self
                .inner
                .update_waiters
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            waiters.get_mut(&run_id).and_then(|m| m.remove(update_id))
        };
        if let Some(tx) = sender {
            let _ = tx.send(outcome);
        }
    }

    /// Fail every update still pending when the run closes.
    pub(crate) fn fail_pending_updates(&self, run_id: Uuid) {
        let drained = {
            let mut waiters = self
                .inner
                .update_waiters
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            waiters.remove(&run_id)
        };
        if let Some(for_run) = drained {
            for (update_id, tx) in for_run {
                debug!(run_id = %run_id, update_id = %update_id, "Failing update on run close");
                let _ = tx.send(Outcome::Failed {
                    failure: Failure::canceled("workflow run closed before the update completed"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::commands::Command;
    use crate::machine::state::WorkflowState;
    use crate::types::StartWorkflowRequest;
    use crate::worker::{WorkerRegistry, WorkflowDefinition};
    use std::sync::Arc;
    use std::time::Duration;

    /// Counts signals named "add"; answers the "count" query; rejects the
    /// "set" update for negative values.
    struct CounterWorkflow;

    impl WorkflowDefinition for CounterWorkflow {
        fn decide(&self, _state: &WorkflowState) -> EngineResult<Vec<Command>> {
            Ok(vec![])
        }

        fn handle_query(
            &self,
            state: &WorkflowState,
            query_name: &str,
            _args: &serde_json::Value,
        ) -> EngineResult<serde_json::Value> {
            match query_name {
                "count" => Ok(serde_json::json!(state.signals_named("add").count())),
                other => Err(EngineError::Validation(format!("unknown query: {other}"))),
            }
        }

        fn validate_update(
            &self,
            _state: &WorkflowState,
            _update_name: &str,
            input: &serde_json::Value,
        ) -> EngineResult<()> {
            if input.as_i64().unwrap_or(0) < 0 {
                return Err(EngineError::Validation("value must be non-negative".into()));
            }
            Ok(())
        }
    }

    fn counter_engine() -> Engine {
        let registry = Arc::new(WorkerRegistry::new());
        registry.register_workflow("counter", Arc::new(CounterWorkflow));
        Engine::new(registry)
    }

    fn start(engine: &Engine, workflow_id: &str) {
        engine
            .start_workflow(StartWorkflowRequest::new(
                "counter",
                workflow_id,
                "router-q",
                serde_json::Value::Null,
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_unknown_workflow_is_not_found() {
        let engine = counter_engine();
        let err = engine
            .signal_workflow("default", "missing", "add", serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_sees_signals_in_order() {
        let engine = counter_engine();
        start(&engine, "q1");
        engine
            .signal_workflow("default", "q1", "add", serde_json::json!(10))
            .unwrap();
        engine
            .signal_workflow("default", "q1", "add", serde_json::json!(20))
            .unwrap();
        let count = engine
            .query_workflow("default", "q1", "count", serde_json::Value::Null)
            .unwrap();
        assert_eq!(count, serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_query_rejects_unknown_name() {
        let engine = counter_engine();
        start(&engine, "q2");
        let err = engine
            .query_workflow("default", "q2", "nope", serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_validator_rejects_without_history_trace() {
        let engine = counter_engine();
        start(&engine, "u1");
        let before = engine.inner.log.tail(engine.current_run_id("default", "u1").unwrap());
        let err = engine
            .update_workflow("default", "u1", "set", serde_json::json!(-10))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let after = engine.inner.log.tail(engine.current_run_id("default", "u1").unwrap());
        assert_eq!(before.unwrap(), after.unwrap());
    }

    #[tokio::test]
    async fn test_accepted_update_fails_when_run_closes() {
        let engine = counter_engine();
        start(&engine, "u2");
        let engine2 = engine.clone();
        let pending = tokio::spawn(async move {
            engine2
                .update_workflow("default", "u2", "set", serde_json::json!(5))
                .await
        });
        // Let the update land in history before terminating.
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine
            .terminate_workflow("default", "u2", "test teardown")
            .unwrap();
        let outcome = pending.await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
    }
}
