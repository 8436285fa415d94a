//! Durable event log abstraction.
//!
//! The log is the single source of truth and the only shared mutable
//! resource: all mutation goes through `append`, and concurrent writers are
//! serialized by the expected-tail check. The engine ships an in-memory
//! implementation; durable backends implement the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::history::{EventAttributes, HistoryEvent};
use crate::types::EventId;

/// Append-only, strongly ordered per-run event log.
///
/// Constraints every implementation must hold:
/// - `append` is atomic: the whole batch lands or none of it does.
/// - Event ids are assigned by the store, 1-based and gap-free per run.
/// - `read` returns events ordered ascending by event id.
/// - With `expected_tail = Some(n)`, the append succeeds only if the run's
///   current tail is exactly `n`; otherwise it fails with `LogConflict` and
///   writes nothing. `None` appends at whatever the current tail is.
pub trait EventLogStore: Send + Sync {
    /// Append a batch for the run, returning the id of the last written event.
    fn append(
        &self,
        run_id: Uuid,
        expected_tail: Option<EventId>,
        batch: Vec<EventAttributes>,
    ) -> EngineResult<EventId>;

    /// Read events from `from` (inclusive, 1-based) to the tail.
    fn read(&self, run_id: Uuid, from: EventId) -> EngineResult<Vec<HistoryEvent>>;

    /// Current tail event id (0 for an empty or unknown run).
    fn tail(&self, run_id: Uuid) -> EngineResult<EventId>;
}

/// In-memory event log used by the engine and tests.
#[derive(Default)]
pub struct InMemoryEventLog {
    runs: Mutex<HashMap<Uuid, Vec<HistoryEvent>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLogStore for InMemoryEventLog {
    fn append(
        &self,
        run_id: Uuid,
        expected_tail: Option<EventId>,
        batch: Vec<EventAttributes>,
    ) -> EngineResult<EventId> {
        if batch.is_empty() {
            return Err(EngineError::Validation("empty append batch".to_string()));
        }
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        let events = runs.entry(run_id).or_default();
        let tail = events.len() as EventId;
        if let Some(expected) = expected_tail {
            if tail != expected {
                return Err(EngineError::LogConflict {
                    run_id,
                    expected,
                    actual: tail,
                });
            }
        }
        let now = Utc::now();
        for (offset, attributes) in batch.into_iter().enumerate() {
            events.push(HistoryEvent {
                event_id: tail + offset as EventId + 1,
                timestamp: now,
                attributes,
            });
        }
        Ok(events.len() as EventId)
    }

    fn read(&self, run_id: Uuid, from: EventId) -> EngineResult<Vec<HistoryEvent>> {
        let runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        let events = match runs.get(&run_id) {
            Some(events) => events,
            None => return Ok(Vec::new()),
        };
        let skip = (from.max(1) - 1) as usize;
        Ok(events.iter().skip(skip).cloned().collect())
    }

    fn tail(&self, run_id: Uuid) -> EngineResult<EventId> {
        let runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        Ok(runs.get(&run_id).map(|e| e.len() as EventId).unwrap_or(0))
    }
}
