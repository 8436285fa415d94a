//! Windlass server library: HTTP API over the workflow execution core.

pub mod config;
pub mod error;
pub mod handlers;
pub mod state;
