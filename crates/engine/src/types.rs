//! Core identifiers, statuses, and policy types shared across the engine.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monotonic, 1-based position of an event within a run's history.
pub type EventId = i64;

/// Status of one workflow run. All variants except `Running` are terminal;
/// `ContinuedAsNew` is terminal for the run but the execution chain carries
/// on under a successor run id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Canceled,
    Terminated,
    TimedOut,
    ContinuedAsNew,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
            Self::Terminated => write!(f, "terminated"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::ContinuedAsNew => write!(f, "continued_as_new"),
        }
    }
}

impl From<&str> for ExecutionStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            "terminated" => Self::Terminated,
            "timed_out" => Self::TimedOut,
            "continued_as_new" => Self::ContinuedAsNew,
            _ => Self::Running,
        }
    }
}

/// What a new start may do when a run already exists for the workflow id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowIdReusePolicy {
    /// A new run may follow any terminal run.
    #[default]
    AllowDuplicate,
    /// A new run may only follow a run that did not complete successfully.
    AllowDuplicateFailedOnly,
    /// The workflow id can never be started again, even after a terminal run.
    RejectDuplicate,
}

/// Retry policy snapshot attached to each scheduled activity.
///
/// Backoff for attempt `n` is `initial_interval * backoff_coefficient^(n-1)`,
/// capped at `maximum_interval`. `maximum_attempts == 0` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 0,
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            maximum_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based) failures.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self.initial_interval.as_secs_f64();
        let raw = base * self.backoff_coefficient.powi(exponent as i32);
        let capped = raw.min(self.maximum_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether `attempt` failures have used up the attempt budget.
    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        self.maximum_attempts != 0 && attempt >= self.maximum_attempts
    }

    /// Whether the error type matches the non-retryable list.
    pub fn is_non_retryable_type(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(t) => self.non_retryable_error_types.iter().any(|nt| nt == t),
            None => false,
        }
    }
}

/// Options attached to a scheduled activity, snapshotted into history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Queue to dispatch on; `None` means the workflow's own queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_to_start_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_to_close_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    /// Local activities skip task-queue matching and run in-process, with
    /// identical retry and timeout accounting.
    #[serde(default)]
    pub local: bool,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            task_queue: None,
            schedule_to_start_timeout: None,
            start_to_close_timeout: Some(Duration::from_secs(60)),
            heartbeat_timeout: None,
            retry_policy: RetryPolicy::default(),
            local: false,
        }
    }
}

/// Request to start a new workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub id_reuse_policy: WorkflowIdReusePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub memo: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub search_attributes: HashMap<String, serde_json::Value>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl StartWorkflowRequest {
    pub fn new(
        workflow_type: impl Into<String>,
        workflow_id: impl Into<String>,
        task_queue: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            namespace: default_namespace(),
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            input,
            id_reuse_policy: WorkflowIdReusePolicy::default(),
            run_timeout: None,
            memo: HashMap::new(),
            search_attributes: HashMap::new(),
        }
    }
}

/// Reference to a concrete workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRef {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!ExecutionStatus::Running.is_terminal());
        for s in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Canceled,
            ExecutionStatus::Terminated,
            ExecutionStatus::TimedOut,
            ExecutionStatus::ContinuedAsNew,
        ] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(10),
            maximum_attempts: 0,
            non_retryable_error_types: Vec::new(),
        };
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_secs(4));
        // Never exceeds maximum_interval regardless of attempt count.
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_secs(10));
        assert_eq!(policy.backoff_for_attempt(1000), Duration::from_secs(10));
    }

    #[test]
    fn test_attempts_exhausted() {
        let mut policy = RetryPolicy::default();
        policy.maximum_attempts = 3;
        assert!(!policy.attempts_exhausted(2));
        assert!(policy.attempts_exhausted(3));

        // Zero means unlimited.
        policy.maximum_attempts = 0;
        assert!(!policy.attempts_exhausted(1_000_000));
    }

    #[test]
    fn test_non_retryable_type_match() {
        let policy = RetryPolicy {
            non_retryable_error_types: vec!["ValueError".to_string()],
            ..RetryPolicy::default()
        };
        assert!(policy.is_non_retryable_type(Some("ValueError")));
        assert!(!policy.is_non_retryable_type(Some("IOError")));
        assert!(!policy.is_non_retryable_type(None));
    }
}
