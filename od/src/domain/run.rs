//! Run domain type
//!
//! One Run is one worker invocation against one feature. Runs are opened,
//! then closed exactly once; closed runs are never mutated again, so the
//! per-feature history is append-only.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use unitstore::{IndexValue, Record, now_ms};

use super::id::generate_event_id;

/// Terminal status of a worker invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Invocation in flight
    #[default]
    Running,
    Success,
    Failed,
    TimedOut,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Record of one worker invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier
    pub id: String,

    /// Project the feature belongs to
    pub project: String,

    /// Feature this run worked on
    pub feature: String,

    /// Worker kind tag ("coder", "validator", "reviewer")
    pub worker: String,

    /// Start timestamp (Unix milliseconds)
    pub started_at: i64,

    /// End timestamp, set when the run closes
    pub ended_at: Option<i64>,

    /// Terminal status
    pub status: RunStatus,

    /// Opaque structured result payload; the core never interprets it
    pub payload: serde_json::Value,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Run {
    /// Open a new run for a worker invocation
    pub fn open(project: impl Into<String>, feature: impl Into<String>, worker: impl Into<String>) -> Self {
        let feature = feature.into();
        let worker = worker.into();
        let now = now_ms();
        Self {
            id: generate_event_id("run", &format!("{}-{}", worker, feature)),
            project: project.into(),
            feature,
            worker,
            started_at: now,
            ended_at: None,
            status: RunStatus::Running,
            payload: serde_json::Value::Null,
            updated_at: now,
        }
    }

    /// Close the run with its terminal status and payload
    ///
    /// A closed run stays closed: calling this again is a no-op.
    pub fn close(&mut self, status: RunStatus, payload: serde_json::Value) {
        if self.ended_at.is_some() {
            return;
        }
        self.status = status;
        self.payload = payload;
        self.ended_at = Some(now_ms());
        self.updated_at = now_ms();
    }

    /// Check if the run has been closed
    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }
}

impl Record for Run {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "runs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project".to_string(), IndexValue::String(self.project.clone()));
        fields.insert("feature".to_string(), IndexValue::String(self.feature.clone()));
        fields.insert("worker".to_string(), IndexValue::String(self.worker.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }
}
