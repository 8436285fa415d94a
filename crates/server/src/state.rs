//! Shared application state passed to all handlers via Axum's state
//! management.

use std::sync::Arc;
use std::time::Duration;

use windlass_engine::{Engine, WorkerRegistry};

use crate::config::ServerConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The workflow execution core
    pub engine: Engine,

    /// Registered workflow definitions and activity handlers
    pub registry: Arc<WorkerRegistry>,

    /// Server configuration
    pub config: Arc<ServerConfig>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(engine: Engine, registry: Arc<WorkerRegistry>, config: ServerConfig) -> Self {
        Self {
            engine,
            registry,
            config: Arc::new(config),
            start_time: std::time::Instant::now(),
        }
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Long-poll timeout for task polls.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.config.poll_timeout_secs)
    }
}
