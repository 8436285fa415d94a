//! Task dispatch and matching.
//!
//! Pairs pending task-queue entries with polling workers. Entries are FIFO
//! per queue, delivered exactly once: the queue lock makes the claim atomic,
//! so two racing polls can never both receive the same entry. A poller that
//! arrives before any entry parks on the queue; a later enqueue hands the
//! task straight to the parked poller (sync match), which is what makes
//! eager starts cheap.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::types::EventId;

/// Kind of a task-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Workflow,
    Activity,
}

/// A workflow task handed to a polling worker. The worker replays the run's
/// history and reports back commands keyed on `last_event_id`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkflowTask {
    pub task_token: Uuid,
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub last_event_id: EventId,
}

/// A queued activity attempt awaiting a worker. Hydrated into a full
/// [`crate::worker::ActivityTask`] by the engine on delivery, after the
/// supervisor confirms the attempt is still live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedActivity {
    pub run_id: Uuid,
    pub activity_id: String,
    pub attempt: u32,
}

struct Entry<T> {
    task: T,
    deadline: Option<DateTime<Utc>>,
}

struct QueueState<T> {
    entries: VecDeque<Entry<T>>,
    waiters: VecDeque<oneshot::Sender<T>>,
    /// Entries that expired while sitting unmatched; drained by the sweeper.
    expired: Vec<T>,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            waiters: VecDeque::new(),
            expired: Vec::new(),
        }
    }
}

/// FIFO matcher for one task kind across named queues.
pub struct TaskMatcher<T> {
    queues: Mutex<HashMap<String, QueueState<T>>>,
}

impl<T> Default for TaskMatcher<T> {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Send + 'static> TaskMatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task, delivering synchronously to a parked poller when one
    /// is waiting.
    pub fn enqueue(&self, queue: &str, task: T, deadline: Option<DateTime<Utc>>) {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let state = queues.entry(queue.to_string()).or_default();

        let mut task = task;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(task) {
                // Sync match: a long-poller was parked on the queue.
                Ok(()) => return,
                // Poller gave up; try the next one.
                Err(returned) => task = returned,
            }
        }
        state.entries.push_back(Entry { task, deadline });
    }

    /// Block up to `timeout` for the oldest unexpired entry. Returns `None`
    /// on timeout; the worker re-polls.
    pub async fn poll(&self, queue: &str, timeout: Duration) -> Option<T> {
        let rx = {
            let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            let state = queues.entry(queue.to_string()).or_default();

            let now = Utc::now();
            while let Some(entry) = state.entries.pop_front() {
                match entry.deadline {
                    Some(deadline) if deadline <= now => state.expired.push(entry.task),
                    _ => return Some(entry.task),
                }
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut rx = rx;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(task)) => Some(task),
            Ok(Err(_)) => None,
            Err(_elapsed) => {
                // An enqueue may have matched us in the race window between
                // the timeout elapsing and the receiver being dropped.
                rx.try_recv().ok()
            }
        }
    }

    /// Remove and return every entry whose schedule-to-start deadline has
    /// passed, across all queues.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<T> {
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        for state in queues.values_mut() {
            out.append(&mut state.expired);
            let mut keep = VecDeque::with_capacity(state.entries.len());
            for entry in state.entries.drain(..) {
                match entry.deadline {
                    Some(deadline) if deadline <= now => out.push(entry.task),
                    _ => keep.push_back(entry),
                }
            }
            state.entries = keep;
        }
        out
    }

    /// Number of entries currently queued (tests only care about this).
    pub fn depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues.get(queue).map(|s| s.entries.len()).unwrap_or(0)
    }
}
