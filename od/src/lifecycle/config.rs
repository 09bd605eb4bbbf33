//! Lifecycle configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::worker::WorkerKind;

/// Configuration for the lifecycle engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Budget for the code-validate loop, shared across review cycles
    #[serde(rename = "max-code-test-iterations")]
    pub max_code_test_iterations: u32,

    /// Attempts per feature before it fails for good
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Base delay before a retry re-enters pending
    #[serde(rename = "backoff-base-ms")]
    pub backoff_base_ms: u64,

    /// Cap on the retry delay
    #[serde(rename = "backoff-max-ms")]
    pub backoff_max_ms: u64,

    /// Keep sandboxes of permanently failed features for postmortem
    #[serde(rename = "retain-failed-sandboxes")]
    pub retain_failed_sandboxes: bool,

    /// Hard wall-clock timeout per coder invocation
    #[serde(rename = "coder-timeout-ms")]
    pub coder_timeout_ms: u64,

    /// Hard wall-clock timeout per validator invocation
    #[serde(rename = "validator-timeout-ms")]
    pub validator_timeout_ms: u64,

    /// Hard wall-clock timeout per reviewer invocation
    #[serde(rename = "reviewer-timeout-ms")]
    pub reviewer_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_code_test_iterations: 10,
            max_attempts: 2,
            backoff_base_ms: 5_000,
            backoff_max_ms: 300_000,
            retain_failed_sandboxes: true,
            coder_timeout_ms: 600_000,
            validator_timeout_ms: 300_000,
            reviewer_timeout_ms: 300_000,
        }
    }
}

impl LifecycleConfig {
    /// Timeout for one invocation of the given worker kind
    pub fn timeout_for(&self, kind: WorkerKind) -> Duration {
        let ms = match kind {
            WorkerKind::Coder => self.coder_timeout_ms,
            WorkerKind::Validator => self.validator_timeout_ms,
            WorkerKind::Reviewer => self.reviewer_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Retry delay for the given attempt number (exponential with jitter)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.backoff_base_ms.saturating_mul(1u64 << exp);
        let capped = base.min(self.backoff_max_ms);
        let jitter = rand::rng().random_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }
}
