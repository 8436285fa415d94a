//! Windlass engine: a durable, replay-based workflow execution core.
//!
//! Workflow runs are event-sourced. The append-only history log is the only
//! durable truth; everything else (activity attempt state, task queues,
//! deadlines, visibility) is derived bookkeeping that can be rebuilt from the
//! log. Workflow code is a deterministic fold over history: every workflow
//! task replays the run's events into a [`machine::state::WorkflowState`]
//! and the definition's decision function emits commands against it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use windlass_engine::{
//!     Command, Engine, EngineResult, StartWorkflowRequest, Worker, WorkerOptions,
//!     WorkerRegistry, WorkflowDefinition, WorkflowState,
//! };
//!
//! struct Greeter;
//!
//! impl WorkflowDefinition for Greeter {
//!     fn decide(&self, state: &WorkflowState) -> EngineResult<Vec<Command>> {
//!         if !state.activity_scheduled("say-hello") {
//!             return Ok(vec![Command::schedule_activity(
//!                 "say-hello",
//!                 "greet",
//!                 state.input.clone(),
//!                 Default::default(),
//!             )]);
//!         }
//!         match state.activity_resolution("say-hello") {
//!             Some(outcome) => Ok(vec![Command::complete(
//!                 outcome.clone().into_result().unwrap_or_default(),
//!             )]),
//!             None => Ok(vec![]),
//!         }
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = Arc::new(WorkerRegistry::new());
//! registry.register_workflow("greeter", Arc::new(Greeter));
//! registry.register_activity("greet", |_ctx, input| async move {
//!     Ok(serde_json::json!(format!("hello, {input}")))
//! });
//! let engine = Engine::new(registry.clone());
//! let _worker = Worker::new(engine.clone(), registry, WorkerOptions::new("greetings")).start();
//! engine.start_workflow(StartWorkflowRequest::new(
//!     "greeter",
//!     "greeting-1",
//!     "greetings",
//!     serde_json::json!("world"),
//! ))?;
//! let result = engine.get_result("default", "greeting-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod history;
pub mod machine;
pub mod router;
pub mod schedule;
pub mod store;
pub mod timers;
pub mod types;
pub mod visibility;
pub mod worker;

pub use engine::Engine;
pub use error::{EngineError, EngineResult, Failure, FailureKind, TimeoutKind};
pub use history::{EventAttributes, EventType, HistoryEvent, Outcome};
pub use machine::commands::Command;
pub use machine::state::WorkflowState;
pub use schedule::{ScheduleInfo, ScheduleSpec};
pub use store::{EventLogStore, InMemoryEventLog};
pub use types::{
    ActivityOptions, EventId, ExecutionRef, ExecutionStatus, RetryPolicy, StartWorkflowRequest,
    WorkflowIdReusePolicy,
};
pub use visibility::{ExecutionInfo, ListFilter};
pub use worker::{
    ActivityContext, ActivityResult, ActivityTask, Worker, WorkerHandle, WorkerOptions,
    WorkerRegistry, WorkflowDefinition,
};
