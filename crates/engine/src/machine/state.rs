//! Workflow state reconstruction from history.
//!
//! `WorkflowState::from_events` is a pure fold: feeding the same event prefix
//! always yields identical derived state. This is the determinism contract
//! the whole engine rests on — workflow code only ever sees this view, never
//! wall clocks or live engine state. Collections are `BTreeMap`s so iteration
//! order is stable across replays.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, Failure};
use crate::history::{EventAttributes, HistoryEvent, Outcome};
use crate::types::{EventId, ExecutionStatus};

/// Derived state of one scheduled activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityView {
    pub activity_id: String,
    pub activity_type: String,
    pub scheduled_event_id: EventId,
    /// Highest attempt number observed so far (0 before the first start).
    pub attempt: u32,
    /// Terminal outcome; `None` while the activity is still pending.
    pub resolution: Option<Outcome>,
    pub cancel_requested: bool,
}

impl ActivityView {
    pub fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }
}

/// Derived state of one timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerView {
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
    pub fired: bool,
    pub canceled: bool,
}

impl TimerView {
    pub fn is_pending(&self) -> bool {
        !self.fired && !self.canceled
    }
}

/// Derived state of one child workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildView {
    pub child_workflow_id: String,
    pub child_run_id: Uuid,
    pub workflow_type: String,
    pub outcome: Option<Outcome>,
}

/// One received signal, in log-accept order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalView {
    pub event_id: EventId,
    pub name: String,
    pub input: serde_json::Value,
}

/// One accepted update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateView {
    pub update_id: String,
    pub name: String,
    pub input: serde_json::Value,
    /// Set once the workflow completed the update.
    pub outcome: Option<Outcome>,
}

/// Complete run state reconstructed from history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub status: ExecutionStatus,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub activities: BTreeMap<String, ActivityView>,
    pub timers: BTreeMap<String, TimerView>,
    pub children: BTreeMap<String, ChildView>,
    pub signals: Vec<SignalView>,
    pub updates: Vec<UpdateView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continued_from: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    /// Timestamp of the last applied event. The only notion of "now"
    /// workflow code may use.
    pub current_time: DateTime<Utc>,
    pub last_event_id: EventId,
}

impl WorkflowState {
    /// Reconstruct state by folding `events` in order. Fails if the history
    /// is empty or does not begin with a start event.
    pub fn from_events(events: &[HistoryEvent]) -> EngineResult<Self> {
        let first = events
            .first()
            .ok_or_else(|| EngineError::Validation("empty history".to_string()))?;

        let mut state = match &first.attributes {
            EventAttributes::WorkflowExecutionStarted {
                workflow_type,
                workflow_id,
                task_queue,
                input,
                continued_from_run_id,
                ..
            } => Self {
                workflow_id: workflow_id.clone(),
                workflow_type: workflow_type.clone(),
                task_queue: task_queue.clone(),
                input: input.clone(),
                status: ExecutionStatus::Running,
                cancel_requested: false,
                cancel_reason: None,
                activities: BTreeMap::new(),
                timers: BTreeMap::new(),
                children: BTreeMap::new(),
                signals: Vec::new(),
                updates: Vec::new(),
                continued_from: *continued_from_run_id,
                started_at: first.timestamp,
                current_time: first.timestamp,
                last_event_id: first.event_id,
            },
            other => {
                return Err(EngineError::Validation(format!(
                    "history does not begin with a start event: {}",
                    other.event_type()
                )))
            }
        };

        for event in &events[1..] {
            state.apply_event(event);
        }
        Ok(state)
    }

    /// Apply a single event to the derived state.
    pub fn apply_event(&mut self, event: &HistoryEvent) {
        self.current_time = event.timestamp;
        self.last_event_id = event.event_id;

        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted { .. } => {
                // Only valid as event 1, handled in from_events.
            }
            EventAttributes::WorkflowTaskScheduled {}
            | EventAttributes::WorkflowTaskCompleted { .. } => {}
            EventAttributes::ActivityTaskScheduled {
                activity_id,
                activity_type,
                ..
            } => {
                self.activities.insert(
                    activity_id.clone(),
                    ActivityView {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        scheduled_event_id: event.event_id,
                        attempt: 0,
                        resolution: None,
                        cancel_requested: false,
                    },
                );
            }
            EventAttributes::ActivityTaskStarted {
                activity_id,
                attempt,
            } => {
                if let Some(a) = self.activities.get_mut(activity_id) {
                    a.attempt = a.attempt.max(*attempt);
                }
            }
            EventAttributes::ActivityTaskCompleted {
                activity_id,
                attempt,
                result,
            } => {
                if let Some(a) = self.activities.get_mut(activity_id) {
                    a.attempt = a.attempt.max(*attempt);
                    a.resolution = Some(Outcome::Completed {
                        result: result.clone(),
                    });
                }
            }
            EventAttributes::ActivityTaskFailed {
                activity_id,
                attempt,
                failure,
            } => {
                if let Some(a) = self.activities.get_mut(activity_id) {
                    a.attempt = a.attempt.max(*attempt);
                    a.resolution = Some(Outcome::Failed {
                        failure: failure.clone(),
                    });
                }
            }
            EventAttributes::ActivityTaskTimedOut {
                activity_id,
                attempt,
                timeout,
            } => {
                if let Some(a) = self.activities.get_mut(activity_id) {
                    a.attempt = a.attempt.max(*attempt);
                    a.resolution = Some(Outcome::Failed {
                        failure: Failure::timeout(*timeout),
                    });
                }
            }
            EventAttributes::ActivityTaskCancelRequested { activity_id } => {
                if let Some(a) = self.activities.get_mut(activity_id) {
                    a.cancel_requested = true;
                }
            }
            EventAttributes::ActivityTaskCanceled { activity_id } => {
                if let Some(a) = self.activities.get_mut(activity_id) {
                    a.resolution = Some(Outcome::Failed {
                        failure: Failure::canceled("activity canceled"),
                    });
                }
            }
            EventAttributes::TimerStarted { timer_id, fire_at } => {
                self.timers.insert(
                    timer_id.clone(),
                    TimerView {
                        timer_id: timer_id.clone(),
                        fire_at: *fire_at,
                        fired: false,
                        canceled: false,
                    },
                );
            }
            EventAttributes::TimerFired { timer_id } => {
                if let Some(t) = self.timers.get_mut(timer_id) {
                    t.fired = true;
                }
            }
            EventAttributes::TimerCanceled { timer_id } => {
                if let Some(t) = self.timers.get_mut(timer_id) {
                    t.canceled = true;
                }
            }
            EventAttributes::WorkflowExecutionSignaled { signal_name, input } => {
                self.signals.push(SignalView {
                    event_id: event.event_id,
                    name: signal_name.clone(),
                    input: input.clone(),
                });
            }
            EventAttributes::WorkflowExecutionUpdateAccepted {
                update_id,
                update_name,
                input,
            } => {
                self.updates.push(UpdateView {
                    update_id: update_id.clone(),
                    name: update_name.clone(),
                    input: input.clone(),
                    outcome: None,
                });
            }
            EventAttributes::WorkflowExecutionUpdateCompleted { update_id, outcome } => {
                if let Some(u) = self.updates.iter_mut().find(|u| &u.update_id == update_id) {
                    u.outcome = Some(outcome.clone());
                }
            }
            EventAttributes::ChildWorkflowExecutionInitiated {
                child_workflow_id,
                child_run_id,
                workflow_type,
            } => {
                self.children.insert(
                    child_workflow_id.clone(),
                    ChildView {
                        child_workflow_id: child_workflow_id.clone(),
                        child_run_id: *child_run_id,
                        workflow_type: workflow_type.clone(),
                        outcome: None,
                    },
                );
            }
            EventAttributes::ChildWorkflowExecutionCompleted {
                child_workflow_id,
                outcome,
                ..
            } => {
                if let Some(c) = self.children.get_mut(child_workflow_id) {
                    c.outcome = Some(outcome.clone());
                }
            }
            EventAttributes::WorkflowExecutionCancelRequested { reason } => {
                self.cancel_requested = true;
                self.cancel_reason = Some(reason.clone());
            }
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                self.status = ExecutionStatus::ContinuedAsNew;
            }
            EventAttributes::WorkflowExecutionCompleted { .. } => {
                self.status = ExecutionStatus::Completed;
            }
            EventAttributes::WorkflowExecutionFailed { .. } => {
                self.status = ExecutionStatus::Failed;
            }
            EventAttributes::WorkflowExecutionCanceled { .. } => {
                self.status = ExecutionStatus::Canceled;
            }
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                self.status = ExecutionStatus::Terminated;
            }
            EventAttributes::WorkflowExecutionTimedOut {} => {
                self.status = ExecutionStatus::TimedOut;
            }
        }
    }

    /// The activity view for `activity_id`, if it was ever scheduled.
    pub fn activity(&self, activity_id: &str) -> Option<&ActivityView> {
        self.activities.get(activity_id)
    }

    /// Terminal outcome of an activity, if resolved.
    pub fn activity_resolution(&self, activity_id: &str) -> Option<&Outcome> {
        self.activities
            .get(activity_id)
            .and_then(|a| a.resolution.as_ref())
    }

    pub fn activity_scheduled(&self, activity_id: &str) -> bool {
        self.activities.contains_key(activity_id)
    }

    pub fn timer(&self, timer_id: &str) -> Option<&TimerView> {
        self.timers.get(timer_id)
    }

    pub fn timer_fired(&self, timer_id: &str) -> bool {
        self.timers.get(timer_id).map(|t| t.fired).unwrap_or(false)
    }

    pub fn child(&self, child_workflow_id: &str) -> Option<&ChildView> {
        self.children.get(child_workflow_id)
    }

    /// Inputs of all signals with the given name, in log order.
    pub fn signals_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a serde_json::Value> {
        self.signals
            .iter()
            .filter(move |s| s.name == name)
            .map(|s| &s.input)
    }

    /// Updates accepted but not yet completed, in acceptance order.
    pub fn pending_updates(&self) -> Vec<&UpdateView> {
        self.updates.iter().filter(|u| u.outcome.is_none()).collect()
    }

    /// Whether any scheduled work (activity, timer, child) is unresolved.
    pub fn has_pending_work(&self) -> bool {
        self.activities.values().any(|a| a.is_pending())
            || self.timers.values().any(|t| t.is_pending())
            || self.children.values().any(|c| c.outcome.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeoutKind;
    use crate::types::ActivityOptions;

    fn history(attrs: Vec<EventAttributes>) -> Vec<HistoryEvent> {
        let ts = Utc::now();
        attrs
            .into_iter()
            .enumerate()
            .map(|(i, attributes)| HistoryEvent {
                event_id: i as EventId + 1,
                timestamp: ts,
                attributes,
            })
            .collect()
    }

    fn started() -> EventAttributes {
        EventAttributes::WorkflowExecutionStarted {
            workflow_type: "order".to_string(),
            workflow_id: "order-1".to_string(),
            task_queue: "main".to_string(),
            input: serde_json::json!({"qty": 2}),
            continued_from_run_id: None,
            parent_run_id: None,
        }
    }

    fn scheduled(id: &str) -> EventAttributes {
        EventAttributes::ActivityTaskScheduled {
            activity_id: id.to_string(),
            activity_type: "charge".to_string(),
            input: serde_json::Value::Null,
            options: ActivityOptions::default(),
        }
    }

    #[test]
    fn test_replay_is_deterministic() {
        let events = history(vec![
            started(),
            EventAttributes::WorkflowTaskScheduled {},
            scheduled("a1"),
            EventAttributes::ActivityTaskStarted {
                activity_id: "a1".to_string(),
                attempt: 1,
            },
            EventAttributes::WorkflowExecutionSignaled {
                signal_name: "add_value".to_string(),
                input: serde_json::json!([10]),
            },
            EventAttributes::ActivityTaskCompleted {
                activity_id: "a1".to_string(),
                attempt: 2,
                result: serde_json::json!("ok"),
            },
        ]);

        // Same prefix twice yields identical state, for every prefix length.
        for k in 1..=events.len() {
            let a = WorkflowState::from_events(&events[..k]).unwrap();
            let b = WorkflowState::from_events(&events[..k]).unwrap();
            assert_eq!(a, b, "replay diverged at prefix {k}");
            assert_eq!(
                serde_json::to_string(&a).unwrap(),
                serde_json::to_string(&b).unwrap()
            );
        }
    }

    #[test]
    fn test_activity_lifecycle_fold() {
        let events = history(vec![
            started(),
            scheduled("a1"),
            EventAttributes::ActivityTaskStarted {
                activity_id: "a1".to_string(),
                attempt: 3,
            },
            EventAttributes::ActivityTaskCompleted {
                activity_id: "a1".to_string(),
                attempt: 3,
                result: serde_json::json!(42),
            },
        ]);
        let state = WorkflowState::from_events(&events).unwrap();
        let a = state.activity("a1").unwrap();
        assert_eq!(a.attempt, 3);
        assert_eq!(
            state.activity_resolution("a1"),
            Some(&Outcome::Completed {
                result: serde_json::json!(42)
            })
        );
        assert!(!state.has_pending_work());
    }

    #[test]
    fn test_activity_timeout_fold() {
        let events = history(vec![
            started(),
            scheduled("a1"),
            EventAttributes::ActivityTaskTimedOut {
                activity_id: "a1".to_string(),
                attempt: 2,
                timeout: TimeoutKind::StartToClose,
            },
        ]);
        let state = WorkflowState::from_events(&events).unwrap();
        match state.activity_resolution("a1") {
            Some(Outcome::Failed { failure }) => {
                assert!(failure.is_timeout(TimeoutKind::StartToClose))
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn test_signals_in_log_order() {
        let events = history(vec![
            started(),
            EventAttributes::WorkflowExecutionSignaled {
                signal_name: "add_value".to_string(),
                input: serde_json::json!([10]),
            },
            EventAttributes::WorkflowExecutionSignaled {
                signal_name: "other".to_string(),
                input: serde_json::json!([99]),
            },
            EventAttributes::WorkflowExecutionSignaled {
                signal_name: "add_value".to_string(),
                input: serde_json::json!([20]),
            },
        ]);
        let state = WorkflowState::from_events(&events).unwrap();
        let values: Vec<_> = state.signals_named("add_value").collect();
        assert_eq!(
            values,
            vec![&serde_json::json!([10]), &serde_json::json!([20])]
        );
    }

    #[test]
    fn test_cancel_request_is_not_terminal() {
        let events = history(vec![
            started(),
            EventAttributes::WorkflowExecutionCancelRequested {
                reason: "user".to_string(),
            },
        ]);
        let state = WorkflowState::from_events(&events).unwrap();
        assert!(state.cancel_requested);
        assert_eq!(state.status, ExecutionStatus::Running);
    }

    #[test]
    fn test_update_lifecycle_fold() {
        let events = history(vec![
            started(),
            EventAttributes::WorkflowExecutionUpdateAccepted {
                update_id: "u1".to_string(),
                update_name: "set_value".to_string(),
                input: serde_json::json!(5),
            },
        ]);
        let state = WorkflowState::from_events(&events).unwrap();
        assert_eq!(state.pending_updates().len(), 1);

        let mut events = events;
        events.push(HistoryEvent {
            event_id: 3,
            timestamp: Utc::now(),
            attributes: EventAttributes::WorkflowExecutionUpdateCompleted {
                update_id: "u1".to_string(),
                outcome: Outcome::Completed {
                    result: serde_json::json!(5),
                },
            },
        });
        let state = WorkflowState::from_events(&events).unwrap();
        assert!(state.pending_updates().is_empty());
    }

    #[test]
    fn test_rejects_history_without_start() {
        let events = history(vec![EventAttributes::WorkflowTaskScheduled {}]);
        assert!(WorkflowState::from_events(&events).is_err());
    }
}
