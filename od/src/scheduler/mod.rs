//! Scheduler: the top-level control loop
//!
//! Recomputes the ready set each tick, claims units while pool capacity
//! remains, spawns one lifecycle task per claim, reaps terminal tasks,
//! and runs checkpoint-based stall detection on its own cadence.

mod config;
mod core;

pub use config::SchedulerConfig;
pub use core::{ProjectSummary, Scheduler};
