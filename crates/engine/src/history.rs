//! History event model.
//!
//! All run state is derived from history events. Events are immutable,
//! strictly ordered per run (1-based `event_id`, no gaps), and only ever
//! appended through the event log's conditional-append primitive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Failure, TimeoutKind};
use crate::types::{ActivityOptions, EventId};

/// Result of a unit of work that can end in success or failure, carried in
/// child-completion and update-completion events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed { result: serde_json::Value },
    Failed { failure: Failure },
}

impl Outcome {
    pub fn into_result(self) -> Result<serde_json::Value, Failure> {
        match self {
            Outcome::Completed { result } => Ok(result),
            Outcome::Failed { failure } => Err(failure),
        }
    }
}

/// Event type discriminant, used for logging and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowTaskScheduled,
    WorkflowTaskCompleted,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskTimedOut,
    ActivityTaskCancelRequested,
    ActivityTaskCanceled,
    TimerStarted,
    TimerFired,
    TimerCanceled,
    WorkflowExecutionSignaled,
    WorkflowExecutionUpdateAccepted,
    WorkflowExecutionUpdateCompleted,
    ChildWorkflowExecutionInitiated,
    ChildWorkflowExecutionCompleted,
    WorkflowExecutionCancelRequested,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionCanceled,
    WorkflowExecutionTerminated,
    WorkflowExecutionTimedOut,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WorkflowExecutionStarted => "workflow_execution_started",
            Self::WorkflowTaskScheduled => "workflow_task_scheduled",
            Self::WorkflowTaskCompleted => "workflow_task_completed",
            Self::ActivityTaskScheduled => "activity_task_scheduled",
            Self::ActivityTaskStarted => "activity_task_started",
            Self::ActivityTaskCompleted => "activity_task_completed",
            Self::ActivityTaskFailed => "activity_task_failed",
            Self::ActivityTaskTimedOut => "activity_task_timed_out",
            Self::ActivityTaskCancelRequested => "activity_task_cancel_requested",
            Self::ActivityTaskCanceled => "activity_task_canceled",
            Self::TimerStarted => "timer_started",
            Self::TimerFired => "timer_fired",
            Self::TimerCanceled => "timer_canceled",
            Self::WorkflowExecutionSignaled => "workflow_execution_signaled",
            Self::WorkflowExecutionUpdateAccepted => "workflow_execution_update_accepted",
            Self::WorkflowExecutionUpdateCompleted => "workflow_execution_update_completed",
            Self::ChildWorkflowExecutionInitiated => "child_workflow_execution_initiated",
            Self::ChildWorkflowExecutionCompleted => "child_workflow_execution_completed",
            Self::WorkflowExecutionCancelRequested => "workflow_execution_cancel_requested",
            Self::WorkflowExecutionContinuedAsNew => "workflow_execution_continued_as_new",
            Self::WorkflowExecutionCompleted => "workflow_execution_completed",
            Self::WorkflowExecutionFailed => "workflow_execution_failed",
            Self::WorkflowExecutionCanceled => "workflow_execution_canceled",
            Self::WorkflowExecutionTerminated => "workflow_execution_terminated",
            Self::WorkflowExecutionTimedOut => "workflow_execution_timed_out",
        };
        write!(f, "{}", s)
    }
}

/// Typed attributes for each event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        workflow_id: String,
        task_queue: String,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        continued_from_run_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<Uuid>,
    },
    WorkflowTaskScheduled {},
    WorkflowTaskCompleted {
        /// Tail event id the worker replayed through; the conditional append
        /// is keyed on this to reject stale or concurrent workers.
        starting_event_id: EventId,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },
    ActivityTaskStarted {
        activity_id: String,
        attempt: u32,
    },
    ActivityTaskCompleted {
        activity_id: String,
        attempt: u32,
        result: serde_json::Value,
    },
    ActivityTaskFailed {
        activity_id: String,
        attempt: u32,
        failure: Failure,
    },
    ActivityTaskTimedOut {
        activity_id: String,
        attempt: u32,
        timeout: TimeoutKind,
    },
    ActivityTaskCancelRequested {
        activity_id: String,
    },
    ActivityTaskCanceled {
        activity_id: String,
    },
    TimerStarted {
        timer_id: String,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: String,
    },
    TimerCanceled {
        timer_id: String,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        input: serde_json::Value,
    },
    WorkflowExecutionUpdateAccepted {
        update_id: String,
        update_name: String,
        input: serde_json::Value,
    },
    WorkflowExecutionUpdateCompleted {
        update_id: String,
        outcome: Outcome,
    },
    ChildWorkflowExecutionInitiated {
        child_workflow_id: String,
        child_run_id: Uuid,
        workflow_type: String,
    },
    ChildWorkflowExecutionCompleted {
        child_workflow_id: String,
        child_run_id: Uuid,
        outcome: Outcome,
    },
    WorkflowExecutionCancelRequested {
        reason: String,
    },
    WorkflowExecutionContinuedAsNew {
        new_run_id: Uuid,
        input: serde_json::Value,
    },
    WorkflowExecutionCompleted {
        result: serde_json::Value,
    },
    WorkflowExecutionFailed {
        failure: Failure,
    },
    WorkflowExecutionCanceled {
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    WorkflowExecutionTerminated {
        reason: String,
    },
    WorkflowExecutionTimedOut {},
}

impl EventAttributes {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            Self::WorkflowTaskScheduled {} => EventType::WorkflowTaskScheduled,
            Self::WorkflowTaskCompleted { .. } => EventType::WorkflowTaskCompleted,
            Self::ActivityTaskScheduled { .. } => EventType::ActivityTaskScheduled,
            Self::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
            Self::ActivityTaskCompleted { .. } => EventType::ActivityTaskCompleted,
            Self::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
            Self::ActivityTaskTimedOut { .. } => EventType::ActivityTaskTimedOut,
            Self::ActivityTaskCancelRequested { .. } => EventType::ActivityTaskCancelRequested,
            Self::ActivityTaskCanceled { .. } => EventType::ActivityTaskCanceled,
            Self::TimerStarted { .. } => EventType::TimerStarted,
            Self::TimerFired { .. } => EventType::TimerFired,
            Self::TimerCanceled { .. } => EventType::TimerCanceled,
            Self::WorkflowExecutionSignaled { .. } => EventType::WorkflowExecutionSignaled,
            Self::WorkflowExecutionUpdateAccepted { .. } => {
                EventType::WorkflowExecutionUpdateAccepted
            }
            Self::WorkflowExecutionUpdateCompleted { .. } => {
                EventType::WorkflowExecutionUpdateCompleted
            }
            Self::ChildWorkflowExecutionInitiated { .. } => {
                EventType::ChildWorkflowExecutionInitiated
            }
            Self::ChildWorkflowExecutionCompleted { .. } => {
                EventType::ChildWorkflowExecutionCompleted
            }
            Self::WorkflowExecutionCancelRequested { .. } => {
                EventType::WorkflowExecutionCancelRequested
            }
            Self::WorkflowExecutionContinuedAsNew { .. } => {
                EventType::WorkflowExecutionContinuedAsNew
            }
            Self::WorkflowExecutionCompleted { .. } => EventType::WorkflowExecutionCompleted,
            Self::WorkflowExecutionFailed { .. } => EventType::WorkflowExecutionFailed,
            Self::WorkflowExecutionCanceled { .. } => EventType::WorkflowExecutionCanceled,
            Self::WorkflowExecutionTerminated { .. } => EventType::WorkflowExecutionTerminated,
            Self::WorkflowExecutionTimedOut {} => EventType::WorkflowExecutionTimedOut,
        }
    }

    /// Whether this event closes the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowExecutionContinuedAsNew { .. }
                | Self::WorkflowExecutionCompleted { .. }
                | Self::WorkflowExecutionFailed { .. }
                | Self::WorkflowExecutionCanceled { .. }
                | Self::WorkflowExecutionTerminated { .. }
                | Self::WorkflowExecutionTimedOut {}
        )
    }
}

/// One immutable record in a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }
}
