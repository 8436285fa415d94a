//! Error types for the Windlass engine.
//!
//! Two layers live here. [`EngineError`] covers engine operations (start
//! conflicts, missing runs, history races, bad requests). [`Failure`] is the
//! durable outcome value carried inside history events and returned to
//! awaiting callers: it tags why an activity or a whole run failed so callers
//! can branch on the kind instead of matching message strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A non-terminal run already exists for the workflow id.
    #[error("workflow already exists: {0}")]
    AlreadyExists(String),

    /// Execution, run, task, or schedule not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request rejected before any state was touched.
    #[error("validation error: {0}")]
    Validation(String),

    /// Conditional append lost a race against a concurrent writer.
    #[error("history conflict on run {run_id}: expected tail {expected}, found {actual}")]
    LogConflict {
        run_id: uuid::Uuid,
        expected: i64,
        actual: i64,
    },

    /// A worker's replay diverged from recorded history.
    #[error("non-deterministic workflow task: {0}")]
    NonDeterminism(String),

    /// The workflow run closed with a non-success status.
    #[error("workflow failure: {0}")]
    WorkflowFailure(Failure),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;

/// Which deadline produced a timeout failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Task sat unmatched on its queue past the schedule-to-start deadline.
    ScheduleToStart,
    /// An attempt ran longer than its start-to-close timeout.
    StartToClose,
    /// No heartbeat arrived within the heartbeat timeout.
    Heartbeat,
    /// The whole run exceeded its run timeout.
    Run,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScheduleToStart => write!(f, "schedule_to_start"),
            Self::StartToClose => write!(f, "start_to_close"),
            Self::Heartbeat => write!(f, "heartbeat"),
            Self::Run => write!(f, "run"),
        }
    }
}

/// Why a failure happened, as a tagged kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Business logic raised an error. Retryable unless flagged otherwise
    /// or the error type matches the policy's non-retryable list.
    Application {
        #[serde(skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
        non_retryable: bool,
    },
    /// A deadline fired.
    Timeout { timeout: TimeoutKind },
    /// The work was canceled.
    Canceled,
    /// The run was terminated from outside.
    Terminated,
}

/// Durable failure value carried in history events and surfaced to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    #[serde(flatten)]
    pub kind: FailureKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Failure {
    /// Retryable application failure.
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Application {
                error_type: None,
                non_retryable: false,
            },
            details: None,
        }
    }

    /// Application failure with an error type for non-retryable-type matching.
    pub fn typed(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Application {
                error_type: Some(error_type.into()),
                non_retryable: false,
            },
            details: None,
        }
    }

    /// Application failure explicitly marked non-retryable.
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Application {
                error_type: None,
                non_retryable: true,
            },
            details: None,
        }
    }

    /// Timeout failure.
    pub fn timeout(timeout: TimeoutKind) -> Self {
        Self {
            message: format!("{} timeout", timeout),
            kind: FailureKind::Timeout { timeout },
            details: None,
        }
    }

    /// Cancellation failure.
    pub fn canceled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Canceled,
            details: None,
        }
    }

    /// Termination failure.
    pub fn terminated(reason: impl Into<String>) -> Self {
        Self {
            message: reason.into(),
            kind: FailureKind::Terminated,
            details: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The error type, if this is a typed application failure.
    pub fn error_type(&self) -> Option<&str> {
        match &self.kind {
            FailureKind::Application { error_type, .. } => error_type.as_deref(),
            _ => None,
        }
    }

    /// Whether the retry policy may retry this failure at all.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            FailureKind::Application { non_retryable, .. } => !non_retryable,
            // Start-to-close and heartbeat timeouts go through the normal
            // retry decision. Schedule-to-start means no worker showed up,
            // so a retry would just sit unmatched again; run timeouts are
            // terminal by nature.
            FailureKind::Timeout { timeout } => matches!(
                timeout,
                TimeoutKind::StartToClose | TimeoutKind::Heartbeat
            ),
            FailureKind::Canceled | FailureKind::Terminated => false,
        }
    }

    /// Whether this failure is a timeout of the given kind.
    pub fn is_timeout(&self, kind: TimeoutKind) -> bool {
        matches!(&self.kind, FailureKind::Timeout { timeout } if *timeout == kind)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::Application { error_type, .. } => match error_type {
                Some(t) => write!(f, "{} ({})", self.message, t),
                None => write!(f, "{}", self.message),
            },
            FailureKind::Timeout { timeout } => write!(f, "{}: {}", self.message, timeout),
            FailureKind::Canceled => write!(f, "canceled: {}", self.message),
            FailureKind::Terminated => write!(f, "terminated: {}", self.message),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}
