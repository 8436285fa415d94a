//! Activity execution supervisor.
//!
//! Owns the retry/timeout/heartbeat lifecycle of every scheduled activity,
//! keyed by (run id, activity id). The supervisor is a state table plus
//! decision logic; the engine drives it and performs the side effects
//! (enqueueing attempts, arming deadlines, appending terminal events).
//!
//! Retryable failures are invisible to the workflow: it observes only the
//! eventual success or the single terminal exhaustion failure. Attempt
//! numbers strictly increase; completions reported for a superseded attempt
//! are stale and dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::Failure;
use crate::types::ActivityOptions;

/// Where an activity currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    /// Waiting on a task queue (or for a local runner slot).
    Queued,
    /// An attempt is in flight on a worker.
    Running,
    /// The last attempt failed; waiting out the retry backoff.
    Backoff,
    /// Terminal: completed, exhausted, timed out, or canceled.
    Closed,
}

/// Supervisor record for one activity within one run.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub run_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    /// Queue the attempts dispatch on (workflow's queue unless overridden).
    pub task_queue: String,
    pub attempt: u32,
    pub phase: AttemptPhase,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Latest-wins heartbeat details, preserved across attempts so the next
    /// attempt can resume from recorded progress.
    pub heartbeat_details: Option<serde_json::Value>,
    pub cancel_requested: bool,
}

/// Everything the engine needs to hand an attempt to a worker.
#[derive(Debug, Clone)]
pub struct StartGrant {
    pub activity_type: String,
    pub input: serde_json::Value,
    pub attempt: u32,
    pub heartbeat_details: Option<serde_json::Value>,
    pub start_to_close_deadline: Option<DateTime<Utc>>,
    pub heartbeat_deadline: Option<DateTime<Utc>>,
}

/// Outcome of consulting the retry policy after an attempt failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Retry after `delay` as attempt `next_attempt`.
    Retry { delay: Duration, next_attempt: u32 },
    /// No more attempts; surface one terminal failure to the workflow.
    Exhausted,
    /// The report referred to a superseded or closed attempt; drop it.
    Stale,
}

/// Outcome of a heartbeat-deadline check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// A heartbeat arrived in time; re-arm the check.
    Live { recheck_at: DateTime<Utc> },
    /// No heartbeat within the window; treat like an attempt failure.
    TimedOut,
    /// The attempt is no longer running.
    Stale,
}

/// Dispatch info for the attempt that follows a backoff.
#[derive(Debug, Clone)]
pub struct RetryDispatch {
    pub task_queue: String,
    pub local: bool,
    pub attempt: u32,
    pub schedule_to_start_deadline: Option<DateTime<Utc>>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelEffect {
    /// The activity is in flight; the flag is set and the attempt learns of
    /// it through its next heartbeat.
    FlagSet,
    /// The activity was between attempts; it is closed immediately.
    CanceledNow,
    /// Already terminal, nothing to do.
    AlreadyClosed,
    /// No such activity.
    NotFound,
}

#[derive(Default)]
pub struct ActivitySupervisor {
    records: Mutex<HashMap<(Uuid, String), ActivityRecord>>,
}

impl ActivitySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly scheduled activity in `Queued` phase, attempt 1.
    pub fn register(
        &self,
        run_id: Uuid,
        activity_id: &str,
        activity_type: &str,
        input: serde_json::Value,
        options: ActivityOptions,
        default_queue: &str,
    ) {
        let task_queue = options
            .task_queue
            .clone()
            .unwrap_or_else(|| default_queue.to_string());
        let mut records = self.lock();
        records.insert(
            (run_id, activity_id.to_string()),
            ActivityRecord {
                run_id,
                activity_id: activity_id.to_string(),
                activity_type: activity_type.to_string(),
                input,
                options,
                task_queue,
                attempt: 1,
                phase: AttemptPhase::Queued,
                scheduled_at: Utc::now(),
                started_at: None,
                last_heartbeat_at: None,
                heartbeat_details: None,
                cancel_requested: false,
            },
        );
    }

    /// Claim the attempt for execution. Returns `None` if the queued entry
    /// went stale (attempt superseded, canceled, or closed).
    pub fn try_start(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Option<StartGrant> {
        let mut records = self.lock();
        let record = records.get_mut(&(run_id, activity_id.to_string()))?;
        if record.phase != AttemptPhase::Queued || record.attempt != attempt {
            debug!(
                run_id = %run_id,
                activity_id,
                attempt,
                current_attempt = record.attempt,
                "Dropping stale activity task"
            );
            return None;
        }
        record.phase = AttemptPhase::Running;
        record.started_at = Some(now);
        record.last_heartbeat_at = Some(now);
        Some(StartGrant {
            activity_type: record.activity_type.clone(),
            input: record.input.clone(),
            attempt: record.attempt,
            heartbeat_details: record.heartbeat_details.clone(),
            start_to_close_deadline: record
                .options
                .start_to_close_timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .map(|t| now + t),
            heartbeat_deadline: record
                .options
                .heartbeat_timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .map(|t| now + t),
        })
    }

    /// Record a heartbeat: resets the liveness clock and overwrites previous
    /// details (latest-wins). Returns whether cancellation was requested so
    /// the activity can react cooperatively.
    pub fn record_heartbeat(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
        details: Option<serde_json::Value>,
    ) -> Option<bool> {
        let mut records = self.lock();
        let record = records.get_mut(&(run_id, activity_id.to_string()))?;
        if record.phase != AttemptPhase::Running || record.attempt != attempt {
            return None;
        }
        record.last_heartbeat_at = Some(Utc::now());
        if details.is_some() {
            record.heartbeat_details = details;
        }
        Some(record.cancel_requested)
    }

    /// Close the activity on successful completion. Returns `false` for a
    /// stale attempt.
    pub fn complete(&self, run_id: Uuid, activity_id: &str, attempt: u32) -> bool {
        let mut records = self.lock();
        match records.get_mut(&(run_id, activity_id.to_string())) {
            Some(record)
                if record.attempt == attempt && record.phase != AttemptPhase::Closed =>
            {
                record.phase = AttemptPhase::Closed;
                true
            }
            _ => false,
        }
    }

    /// Apply the retry policy after an attempt failure or enforcement
    /// timeout. On `Retry` the record moves to `Backoff` with the attempt
    /// counter advanced; the engine arms the retry deadline.
    pub fn on_failure(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
        failure: &Failure,
    ) -> FailureVerdict {
        let mut records = self.lock();
        let record = match records.get_mut(&(run_id, activity_id.to_string())) {
            Some(r) => r,
            None => return FailureVerdict::Stale,
        };
        if record.phase == AttemptPhase::Closed || record.attempt != attempt {
            return FailureVerdict::Stale;
        }

        let policy = &record.options.retry_policy;
        let exhausted = !failure.is_retryable()
            || policy.is_non_retryable_type(failure.error_type())
            || policy.attempts_exhausted(attempt)
            || record.cancel_requested;

        if exhausted {
            record.phase = AttemptPhase::Closed;
            return FailureVerdict::Exhausted;
        }

        let delay = policy.backoff_for_attempt(attempt);
        record.attempt = attempt + 1;
        record.phase = AttemptPhase::Backoff;
        record.started_at = None;
        FailureVerdict::Retry {
            delay,
            next_attempt: record.attempt,
        }
    }

    /// Backoff elapsed; move back to `Queued` and return dispatch info.
    pub fn on_retry_due(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Option<RetryDispatch> {
        let mut records = self.lock();
        let record = records.get_mut(&(run_id, activity_id.to_string()))?;
        if record.phase != AttemptPhase::Backoff || record.attempt != attempt {
            return None;
        }
        record.phase = AttemptPhase::Queued;
        record.scheduled_at = now;
        Some(RetryDispatch {
            task_queue: record.task_queue.clone(),
            local: record.options.local,
            attempt: record.attempt,
            schedule_to_start_deadline: record
                .options
                .schedule_to_start_timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .map(|t| now + t),
        })
    }

    /// Check liveness when a heartbeat deadline fires.
    pub fn check_heartbeat(
        &self,
        run_id: Uuid,
        activity_id: &str,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> HeartbeatVerdict {
        let records = self.lock();
        let record = match records.get(&(run_id, activity_id.to_string())) {
            Some(r) => r,
            None => return HeartbeatVerdict::Stale,
        };
        if record.phase != AttemptPhase::Running || record.attempt != attempt {
            return HeartbeatVerdict::Stale;
        }
        let timeout = match record
            .options
            .heartbeat_timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
        {
            Some(t) => t,
            None => return HeartbeatVerdict::Stale,
        };
        let last = record.last_heartbeat_at.unwrap_or(record.scheduled_at);
        if last + timeout > now {
            HeartbeatVerdict::Live {
                recheck_at: last + timeout,
            }
        } else {
            HeartbeatVerdict::TimedOut
        }
    }

    /// Request cancellation.
    pub fn request_cancel(&self, run_id: Uuid, activity_id: &str) -> CancelEffect {
        let mut records = self.lock();
        let record = match records.get_mut(&(run_id, activity_id.to_string())) {
            Some(r) => r,
            None => return CancelEffect::NotFound,
        };
        match record.phase {
            AttemptPhase::Closed => CancelEffect::AlreadyClosed,
            AttemptPhase::Running => {
                record.cancel_requested = true;
                CancelEffect::FlagSet
            }
            AttemptPhase::Queued | AttemptPhase::Backoff => {
                record.cancel_requested = true;
                record.phase = AttemptPhase::Closed;
                CancelEffect::CanceledNow
            }
        }
    }

    /// Whether the attempt is still the live one in the given phase.
    pub fn is_current(&self, run_id: Uuid, activity_id: &str, attempt: u32) -> bool {
        let records = self.lock();
        records
            .get(&(run_id, activity_id.to_string()))
            .map(|r| r.attempt == attempt && r.phase != AttemptPhase::Closed)
            .unwrap_or(false)
    }

    /// Attempt telemetry for describe calls and tests.
    pub fn attempt_count(&self, run_id: Uuid, activity_id: &str) -> Option<u32> {
        let records = self.lock();
        records
            .get(&(run_id, activity_id.to_string()))
            .map(|r| r.attempt)
    }

    /// Drop every record belonging to a closed run; in-flight attempts are
    /// abandoned and their late reports become stale.
    pub fn remove_run(&self, run_id: Uuid) {
        let mut records = self.lock();
        records.retain(|(rid, _), _| *rid != run_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(Uuid, String), ActivityRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RetryPolicy;

    fn supervisor_with(options: ActivityOptions) -> (ActivitySupervisor, Uuid) {
        let sup = ActivitySupervisor::new();
        let run = Uuid::new_v4();
        sup.register(run, "a1", "charge", serde_json::json!(1), options, "main");
        (sup, run)
    }

    fn options_with_max_attempts(n: u32) -> ActivityOptions {
        ActivityOptions {
            retry_policy: RetryPolicy {
                initial_interval: Duration::from_millis(10),
                maximum_attempts: n,
                ..RetryPolicy::default()
            },
            ..ActivityOptions::default()
        }
    }

    #[test]
    fn test_retry_until_exhaustion() {
        let (sup, run) = supervisor_with(options_with_max_attempts(3));
        let failure = Failure::application("flaky");

        // Attempts 1 and 2 fail and are retried with increasing attempts.
        for attempt in 1..3 {
            sup.try_start(run, "a1", attempt, Utc::now()).unwrap();
            match sup.on_failure(run, "a1", attempt, &failure) {
                FailureVerdict::Retry { next_attempt, .. } => {
                    assert_eq!(next_attempt, attempt + 1)
                }
                other => panic!("unexpected verdict: {other:?}"),
            }
            assert!(sup.on_retry_due(run, "a1", attempt + 1, Utc::now()).is_some());
        }

        // Attempt 3 exhausts the budget.
        sup.try_start(run, "a1", 3, Utc::now()).unwrap();
        assert_eq!(
            sup.on_failure(run, "a1", 3, &failure),
            FailureVerdict::Exhausted
        );
        assert!(!sup.is_current(run, "a1", 3));
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let (sup, run) = supervisor_with(options_with_max_attempts(0));
        sup.try_start(run, "a1", 1, Utc::now()).unwrap();
        assert_eq!(
            sup.on_failure(run, "a1", 1, &Failure::non_retryable("bad input")),
            FailureVerdict::Exhausted
        );
    }

    #[test]
    fn test_non_retryable_type_list() {
        let options = ActivityOptions {
            retry_policy: RetryPolicy {
                non_retryable_error_types: vec!["ValueError".to_string()],
                ..RetryPolicy::default()
            },
            ..ActivityOptions::default()
        };
        let (sup, run) = supervisor_with(options);
        sup.try_start(run, "a1", 1, Utc::now()).unwrap();
        assert_eq!(
            sup.on_failure(run, "a1", 1, &Failure::typed("bad", "ValueError")),
            FailureVerdict::Exhausted
        );
    }

    #[test]
    fn test_stale_attempt_reports_are_dropped() {
        let (sup, run) = supervisor_with(options_with_max_attempts(5));
        sup.try_start(run, "a1", 1, Utc::now()).unwrap();
        assert!(matches!(
            sup.on_failure(run, "a1", 1, &Failure::application("x")),
            FailureVerdict::Retry { .. }
        ));
        // A late report for attempt 1 after the retry was decided is stale.
        assert_eq!(
            sup.on_failure(run, "a1", 1, &Failure::application("late")),
            FailureVerdict::Stale
        );
        assert!(!sup.complete(run, "a1", 1));
    }

    #[test]
    fn test_heartbeat_details_survive_retries() {
        let (sup, run) = supervisor_with(options_with_max_attempts(0));
        sup.try_start(run, "a1", 1, Utc::now()).unwrap();
        sup.record_heartbeat(run, "a1", 1, Some(serde_json::json!({"progress": 40})));
        // Latest-wins, not accumulated.
        sup.record_heartbeat(run, "a1", 1, Some(serde_json::json!({"progress": 70})));

        sup.on_failure(run, "a1", 1, &Failure::application("x"));
        sup.on_retry_due(run, "a1", 2, Utc::now()).unwrap();
        let grant = sup.try_start(run, "a1", 2, Utc::now()).unwrap();
        assert_eq!(
            grant.heartbeat_details,
            Some(serde_json::json!({"progress": 70}))
        );
    }

    #[test]
    fn test_heartbeat_liveness_check() {
        let options = ActivityOptions {
            heartbeat_timeout: Some(Duration::from_secs(10)),
            ..options_with_max_attempts(0)
        };
        let (sup, run) = supervisor_with(options);
        let started = Utc::now();
        sup.try_start(run, "a1", 1, started).unwrap();

        // Within the window: live, recheck later.
        match sup.check_heartbeat(run, "a1", 1, started + chrono::Duration::seconds(5)) {
            HeartbeatVerdict::Live { .. } => {}
            other => panic!("unexpected verdict: {other:?}"),
        }
        // Past the window with no heartbeat: timed out.
        assert_eq!(
            sup.check_heartbeat(run, "a1", 1, started + chrono::Duration::seconds(11)),
            HeartbeatVerdict::TimedOut
        );
    }

    #[test]
    fn test_cancel_between_attempts_closes_immediately() {
        let (sup, run) = supervisor_with(options_with_max_attempts(0));
        sup.try_start(run, "a1", 1, Utc::now()).unwrap();
        sup.on_failure(run, "a1", 1, &Failure::application("x"));
        // In backoff now.
        assert_eq!(sup.request_cancel(run, "a1"), CancelEffect::CanceledNow);
        assert!(sup.on_retry_due(run, "a1", 2, Utc::now()).is_none());
    }

    #[test]
    fn test_cancel_running_sets_flag_seen_by_heartbeat() {
        let (sup, run) = supervisor_with(options_with_max_attempts(0));
        sup.try_start(run, "a1", 1, Utc::now()).unwrap();
        assert_eq!(sup.request_cancel(run, "a1"), CancelEffect::FlagSet);
        assert_eq!(sup.record_heartbeat(run, "a1", 1, None), Some(true));
    }
}
