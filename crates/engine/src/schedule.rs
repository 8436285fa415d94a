//! Interval schedules: periodically start workflow executions from a stored
//! template.
//!
//! Ticks ride the deadline wheel like every other time-driven obligation.
//! Overlap policy is skip: a tick whose previous started execution is still
//! open takes no action and waits for the next interval.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::timers::Deadline;
use crate::types::{StartWorkflowRequest, WorkflowIdReusePolicy};

/// What a schedule starts on each action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub schedule_id: String,
    pub namespace: String,
    pub interval: Duration,
    pub workflow_type: String,
    /// Base workflow id; each action appends the action number.
    pub workflow_id: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    #[serde(default)]
    pub paused: bool,
}

/// Schedule description returned by list and describe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub spec: ScheduleSpec,
    pub action_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action_at: Option<DateTime<Utc>>,
    pub next_action_at: DateTime<Utc>,
}

struct ScheduleEntry {
    spec: ScheduleSpec,
    action_count: u64,
    last_action_at: Option<DateTime<Utc>>,
    last_started_run: Option<Uuid>,
    next_action_at: DateTime<Utc>,
}

/// In-memory schedule table.
#[derive(Default)]
pub struct ScheduleStore {
    entries: Mutex<HashMap<String, ScheduleEntry>>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Engine {
    /// Create a schedule and arm its first tick one interval from now.
    pub fn create_schedule(&self, spec: ScheduleSpec) -> EngineResult<()> {
        if spec.schedule_id.is_empty() {
            return Err(EngineError::Validation("schedule_id is required".into()));
        }
        if spec.interval.is_zero() {
            return Err(EngineError::Validation(
                "schedule interval must be positive".into(),
            ));
        }
        let interval =
            chrono::Duration::from_std(spec.interval).map_err(|_| {
                EngineError::Validation("schedule interval out of range".into())
            })?;
        let next_action_at = Utc::now() + interval;
        {
            let mut entries = self.inner.schedules.lock();
            if entries.contains_key(&spec.schedule_id) {
                return Err(EngineError::AlreadyExists(format!(
                    "schedule {}",
                    spec.schedule_id
                )));
            }
            entries.insert(
                spec.schedule_id.clone(),
                ScheduleEntry {
                    spec: spec.clone(),
                    action_count: 0,
                    last_action_at: None,
                    last_started_run: None,
                    next_action_at,
                },
            );
        }
        info!(
            schedule_id = %spec.schedule_id,
            workflow_type = %spec.workflow_type,
            interval_secs = spec.interval.as_secs(),
            "Schedule created"
        );
        self.inner.wheel.schedule(
            next_action_at,
            Deadline::ScheduleDue {
                schedule_id: spec.schedule_id,
            },
        );
        Ok(())
    }

    /// Delete a schedule. Already-started executions are unaffected.
    pub fn delete_schedule(&self, schedule_id: &str) -> EngineResult<()> {
        let removed = self.inner.schedules.lock().remove(schedule_id);
        match removed {
            Some(_) => {
                info!(schedule_id, "Schedule deleted");
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("schedule {schedule_id}"))),
        }
    }

    /// Pause ticking. Ticks that fire while paused take no action.
    pub fn pause_schedule(&self, schedule_id: &str) -> EngineResult<()> {
        self.set_schedule_paused(schedule_id, true)
    }

    /// Resume ticking from the next armed tick.
    pub fn unpause_schedule(&self, schedule_id: &str) -> EngineResult<()> {
        self.set_schedule_paused(schedule_id, false)
    }

    fn set_schedule_paused(&self, schedule_id: &str, paused: bool) -> EngineResult<()> {
        let mut entries = self.inner.schedules.lock();
        let entry = entries
            .get_mut(schedule_id)
            .ok_or_else(|| EngineError::NotFound(format!("schedule {schedule_id}")))?;
        entry.spec.paused = paused;
        info!(schedule_id, paused, "Schedule pause state changed");
        Ok(())
    }

    /// Take one action immediately, regardless of pause state or interval.
    pub fn trigger_schedule(&self, schedule_id: &str) -> EngineResult<()> {
        let spec = {
            let entries = self.inner.schedules.lock();
            entries
                .get(schedule_id)
                .map(|e| e.spec.clone())
                .ok_or_else(|| EngineError::NotFound(format!("schedule {schedule_id}")))?
        };
        self.take_schedule_action(&spec, true);
        Ok(())
    }

    /// All schedules, with action telemetry.
    pub fn list_schedules(&self) -> Vec<ScheduleInfo> {
        let entries = self.inner.schedules.lock();
        let mut infos: Vec<ScheduleInfo> = entries
            .values()
            .map(|e| ScheduleInfo {
                spec: e.spec.clone(),
                action_count: e.action_count,
                last_action_at: e.last_action_at,
                next_action_at: e.next_action_at,
            })
            .collect();
        infos.sort_by(|a, b| a.spec.schedule_id.cmp(&b.spec.schedule_id));
        infos
    }

    pub fn describe_schedule(&self, schedule_id: &str) -> EngineResult<ScheduleInfo> {
        let entries = self.inner.schedules.lock();
        entries
            .get(schedule_id)
            .map(|e| ScheduleInfo {
                spec: e.spec.clone(),
                action_count: e.action_count,
                last_action_at: e.last_action_at,
                next_action_at: e.next_action_at,
            })
            .ok_or_else(|| EngineError::NotFound(format!("schedule {schedule_id}")))
    }

    /// Wheel callback for a due tick: act unless paused or overlapping, then
    /// re-arm the next tick.
    pub(crate) fn handle_schedule_due(&self, schedule_id: &str) {
        let (spec, skip) = {
            let mut entries = self.inner.schedules.lock();
            let entry = match entries.get_mut(schedule_id) {
                Some(e) => e,
                None => return, // deleted; let the tick die
            };
            let interval = chrono::Duration::from_std(entry.spec.interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            entry.next_action_at = Utc::now() + interval;
            let overlapping = entry
                .last_started_run
                .and_then(|run| self.run_status(run))
                .map(|s| !s.is_terminal())
                .unwrap_or(false);
            (entry.spec.clone(), entry.spec.paused || overlapping)
        };
        if skip {
            debug!(schedule_id, "Schedule tick skipped");
        } else {
            self.take_schedule_action(&spec, false);
        }
        let next_at = {
            let entries = self.inner.schedules.lock();
            entries.get(schedule_id).map(|e| e.next_action_at)
        };
        if let Some(at) = next_at {
            self.inner.wheel.schedule(
                at,
                Deadline::ScheduleDue {
                    schedule_id: schedule_id.to_string(),
                },
            );
        }
    }

    fn take_schedule_action(&self, spec: &ScheduleSpec, manual: bool) {
        let action = {
            let mut entries = self.inner.schedules.lock();
            match entries.get_mut(&spec.schedule_id) {
                Some(entry) => {
                    entry.action_count += 1;
                    entry.action_count
                }
                None => return,
            }
        };
        let req = StartWorkflowRequest {
            namespace: spec.namespace.clone(),
            workflow_id: format!("{}-{}", spec.workflow_id, action),
            workflow_type: spec.workflow_type.clone(),
            task_queue: spec.task_queue.clone(),
            input: spec.input.clone(),
            id_reuse_policy: WorkflowIdReusePolicy::AllowDuplicate,
            run_timeout: None,
            memo: HashMap::new(),
            search_attributes: HashMap::new(),
        };
        match self.start_workflow(req) {
            Ok(handle) => {
                let mut entries = self.inner.schedules.lock();
                if let Some(entry) = entries.get_mut(&spec.schedule_id) {
                    entry.last_action_at = Some(Utc::now());
                    entry.last_started_run = Some(handle.run_id);
                }
                debug!(
                    schedule_id = %spec.schedule_id,
                    run_id = %handle.run_id,
                    manual,
                    "Schedule action started execution"
                );
            }
            Err(e) => {
                warn!(schedule_id = %spec.schedule_id, error = %e, "Schedule action failed");
            }
        }
    }
}
