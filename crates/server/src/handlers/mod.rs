//! HTTP handlers for the Windlass API.

pub mod executions;
pub mod health;
pub mod schedules;
pub mod tasks;

pub use health::health_check;
