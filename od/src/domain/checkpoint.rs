//! Checkpoint domain type
//!
//! A periodic observation of a sandbox's head commit. Checkpoints feed
//! stall detection only; nothing correctness-critical reads them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use unitstore::{IndexValue, Record, now_ms};

use super::id::generate_event_id;

/// Liveness observation of an active sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier
    pub id: String,

    /// Project the feature belongs to
    pub project: String,

    /// Feature whose sandbox was observed
    pub feature: String,

    /// Head commit id at observation time
    pub head: String,

    /// Observation timestamp (Unix milliseconds)
    pub observed_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Checkpoint {
    /// Record an observation of a sandbox head
    pub fn observe(project: impl Into<String>, feature: impl Into<String>, head: impl Into<String>) -> Self {
        let feature = feature.into();
        let now = now_ms();
        Self {
            id: generate_event_id("ckpt", &feature),
            project: project.into(),
            feature,
            head: head.into(),
            observed_at: now,
            updated_at: now,
        }
    }
}

impl Record for Checkpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "checkpoints"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project".to_string(), IndexValue::String(self.project.clone()));
        fields.insert("feature".to_string(), IndexValue::String(self.feature.clone()));
        fields
    }
}
