//! Commands emitted by workflow code.
//!
//! A workflow task completion carries an ordered list of commands; the state
//! machine translates them into history events in emission order. Commands
//! are data only — side effects (enqueueing tasks, arming timers, spawning
//! children) happen after the translated batch is durably appended.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Failure;
use crate::history::Outcome;
use crate::types::ActivityOptions;

/// One instruction from a workflow decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Schedule an activity. The id must be unique within the run.
    ScheduleActivity {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },
    /// Request cooperative cancellation of a pending activity.
    RequestCancelActivity { activity_id: String },
    /// Start a durable timer. The id must be unique within the run.
    StartTimer { timer_id: String, delay: Duration },
    /// Cancel a pending timer.
    CancelTimer { timer_id: String },
    /// Signal another workflow in the same namespace.
    SignalExternal {
        workflow_id: String,
        signal_name: String,
        input: serde_json::Value,
    },
    /// Start a child workflow linked for completion propagation.
    StartChildWorkflow {
        workflow_id: String,
        workflow_type: String,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_queue: Option<String>,
    },
    /// Record the outcome of a pending update.
    CompleteUpdate { update_id: String, outcome: Outcome },
    /// Close the run successfully.
    CompleteWorkflow { result: serde_json::Value },
    /// Close the run as failed.
    FailWorkflow { failure: Failure },
    /// Close the run as canceled (after compensations, if any).
    CancelWorkflow {
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    /// Close this run and continue under a fresh run with new input.
    ContinueAsNew { input: serde_json::Value },
}

impl Command {
    /// Whether this command closes the run. At most one terminal command is
    /// allowed per completion, and it must come last.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Command::CompleteWorkflow { .. }
                | Command::FailWorkflow { .. }
                | Command::CancelWorkflow { .. }
                | Command::ContinueAsNew { .. }
        )
    }

    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Command::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    pub fn start_timer(timer_id: impl Into<String>, delay: Duration) -> Self {
        Command::StartTimer {
            timer_id: timer_id.into(),
            delay,
        }
    }

    pub fn complete(result: serde_json::Value) -> Self {
        Command::CompleteWorkflow { result }
    }

    pub fn fail(failure: Failure) -> Self {
        Command::FailWorkflow { failure }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_commands() {
        assert!(Command::complete(serde_json::json!("done")).is_terminal());
        assert!(Command::fail(Failure::application("boom")).is_terminal());
        assert!(Command::ContinueAsNew {
            input: serde_json::Value::Null
        }
        .is_terminal());
        assert!(!Command::start_timer("t1", Duration::from_secs(1)).is_terminal());
    }

    #[test]
    fn test_command_serialization() {
        let cmd = Command::schedule_activity(
            "a1",
            "charge",
            serde_json::json!({"amount": 10}),
            ActivityOptions::default(),
        );
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"command\":\"schedule_activity\""));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }
}
