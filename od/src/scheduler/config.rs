//! Scheduler configuration

use serde::{Deserialize, Serialize};

/// Configuration for the scheduler control loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Main loop tick interval
    #[serde(rename = "tick-interval-ms")]
    pub tick_interval_ms: u64,

    /// Cadence of sandbox head observations (stall detection)
    #[serde(rename = "checkpoint-interval-ms")]
    pub checkpoint_interval_ms: u64,

    /// A sandbox whose head has not moved for this long stalls its feature
    #[serde(rename = "stall-timeout-ms")]
    pub stall_timeout_ms: u64,

    /// How long shutdown waits for in-flight lifecycles before aborting
    #[serde(rename = "shutdown-timeout-ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            checkpoint_interval_ms: 30_000,
            stall_timeout_ms: 900_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}
