//! Deadline wheel.
//!
//! One min-heap serves every time-driven obligation in the engine: durable
//! workflow timers, activity schedule-to-start / start-to-close / heartbeat
//! deadlines, retry backoff wakeups, run timeouts, and schedule ticks. The
//! engine's sweeper loop pops due deadlines and dispatches them; inserting an
//! earlier deadline nudges the sleeping sweeper via `Notify`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

/// A due obligation. Firing is always checked against current engine state —
/// a deadline may be stale (attempt superseded, run closed, timer canceled)
/// in which case it is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deadline {
    /// A durable workflow timer should fire.
    WorkflowTimer { run_id: Uuid, timer_id: String },
    /// An activity sat unmatched past its schedule-to-start timeout.
    ActivityScheduleToStart {
        run_id: Uuid,
        activity_id: String,
        attempt: u32,
    },
    /// An in-flight attempt ran past its start-to-close timeout.
    ActivityStartToClose {
        run_id: Uuid,
        activity_id: String,
        attempt: u32,
    },
    /// Heartbeat liveness check for an in-flight attempt.
    ActivityHeartbeat {
        run_id: Uuid,
        activity_id: String,
        attempt: u32,
    },
    /// Backoff elapsed; the next attempt should be scheduled.
    ActivityRetry {
        run_id: Uuid,
        activity_id: String,
        attempt: u32,
    },
    /// The run exceeded its run timeout.
    RunTimeout { run_id: Uuid },
    /// An interval schedule is due.
    ScheduleDue { schedule_id: String },
}

struct HeapEntry {
    at: DateTime<Utc>,
    seq: u64,
    deadline: Deadline,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct WheelInner {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    seq: u64,
}

/// Shared deadline heap. Insertions are cheap; cancellation is lazy (stale
/// deadlines are discarded when they fire).
#[derive(Default)]
pub struct DeadlineWheel {
    inner: Mutex<WheelInner>,
    notify: Notify,
}

impl DeadlineWheel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline at `at`.
    pub fn schedule(&self, at: DateTime<Utc>, deadline: Deadline) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.seq += 1;
        let seq = inner.seq;
        let wakes_earlier = inner
            .heap
            .peek()
            .map(|Reverse(e)| at < e.at)
            .unwrap_or(true);
        inner.heap.push(Reverse(HeapEntry { at, seq, deadline }));
        drop(inner);
        if wakes_earlier {
            self.notify.notify_one();
        }
    }

    /// Pop every deadline due at or before `now`.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Deadline> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = inner.heap.peek() {
            if entry.at > now {
                break;
            }
            let Reverse(entry) = inner.heap.pop().unwrap_or_else(|| unreachable!());
            due.push(entry.deadline);
        }
        due
    }

    /// When the next deadline fires, if any.
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.heap.peek().map(|Reverse(e)| e.at)
    }

    /// Await a nudge from an earlier-than-head insertion.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
