//! Feature domain type
//!
//! A Feature is one schedulable unit of work: it carries its acceptance
//! criteria, its dependency set, and the bookkeeping the lifecycle engine
//! needs (sandbox binding, iteration and attempt counters, timestamps).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use unitstore::{IndexValue, Record, now_ms};

use super::id::generate_id;
use super::priority::Priority;

/// Feature status in the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    /// Waiting for dependencies and a pool slot
    #[default]
    Pending,
    /// Claimed; the code-validate loop is running in a sandbox
    InProgress,
    /// Validation passed; awaiting review or merge (or escalated on conflict)
    Review,
    /// Merged to trunk
    Completed,
    /// Terminal unless the retry policy re-enters Pending
    Failed,
}

impl FeatureStatus {
    /// Terminal states (Review-with-escalation is handled separately)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Review => write!(f, "review"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Verification tier for an acceptance criterion
///
/// Tiers run in declaration order and short-circuit: logic checks gate
/// behavior checks, and appearance criteria only ever capture evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Logic,
    Behavior,
    Appearance,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Logic => write!(f, "logic"),
            Self::Behavior => write!(f, "behavior"),
            Self::Appearance => write!(f, "appearance"),
        }
    }
}

/// One acceptance criterion, tagged with its verification tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub text: String,
    #[serde(default)]
    pub tier: Tier,
}

impl Criterion {
    pub fn new(text: impl Into<String>, tier: Tier) -> Self {
        Self { text: text.into(), tier }
    }
}

/// A schedulable unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    /// Unique identifier (e.g. "01a4f2-feat-player-movement")
    pub id: String,

    /// Project this feature belongs to
    pub project: String,

    /// Human-readable name
    pub name: String,

    /// What to build
    pub description: String,

    /// Ordered acceptance criteria
    pub criteria: Vec<Criterion>,

    /// Current lifecycle status
    pub status: FeatureStatus,

    /// Priority for claim ordering
    pub priority: Priority,

    /// Feature IDs that must be Completed before this can start
    pub deps: Vec<String>,

    /// Sandbox working directory (populated only while active)
    pub sandbox_path: Option<String>,

    /// Sandbox branch name (populated only while active)
    pub branch: Option<String>,

    /// Code-validate iterations spent in the current attempt (1-indexed)
    pub iteration: u32,

    /// Attempt number (incremented on each claim)
    pub attempt: u32,

    /// Set when a merge conflict survived auto-resolution; the feature
    /// holds in Review until an operator intervenes
    pub conflict_escalated: bool,

    /// Last error message (if any)
    pub last_error: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// When the current attempt started
    pub started_at: Option<i64>,

    /// When the feature reached Completed
    pub completed_at: Option<i64>,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Feature {
    /// Create a new Feature with generated ID
    pub fn new(project: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        let now = now_ms();
        Self {
            id: generate_id("feat", &name),
            project: project.into(),
            name,
            description: description.into(),
            criteria: Vec::new(),
            status: FeatureStatus::Pending,
            priority: Priority::Normal,
            deps: Vec::new(),
            sandbox_path: None,
            branch: None,
            iteration: 0,
            attempt: 0,
            conflict_escalated: false,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Create with a specific ID (tests and recovery)
    pub fn with_id(id: impl Into<String>, project: impl Into<String>, name: impl Into<String>) -> Self {
        let mut feature = Self::new(project, name, "");
        feature.id = id.into();
        feature
    }

    /// Add a dependency
    pub fn add_dependency(&mut self, dep_id: impl Into<String>) {
        self.deps.push(dep_id.into());
        self.updated_at = now_ms();
    }

    /// Add an acceptance criterion
    pub fn add_criterion(&mut self, criterion: Criterion) {
        self.criteria.push(criterion);
        self.updated_at = now_ms();
    }

    /// Update the status
    pub fn set_status(&mut self, status: FeatureStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    /// Set the last error
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.updated_at = now_ms();
    }

    /// Bind the sandbox created for the current attempt
    pub fn bind_sandbox(&mut self, path: impl Into<String>, branch: impl Into<String>) {
        self.sandbox_path = Some(path.into());
        self.branch = Some(branch.into());
        self.updated_at = now_ms();
    }

    /// Clear the sandbox binding
    pub fn clear_sandbox(&mut self) {
        self.sandbox_path = None;
        self.branch = None;
        self.updated_at = now_ms();
    }

    /// Begin a fresh attempt: Pending -> InProgress with attempt counter bump
    pub fn begin_attempt(&mut self) {
        self.status = FeatureStatus::InProgress;
        self.attempt += 1;
        self.iteration = 0;
        self.conflict_escalated = false;
        self.last_error = None;
        self.started_at = Some(now_ms());
        self.updated_at = now_ms();
    }

    /// Reset a failed feature for retry: sandbox and counters cleared so
    /// nothing from the failed attempt is reused
    pub fn reset_for_retry(&mut self) {
        self.status = FeatureStatus::Pending;
        self.iteration = 0;
        self.sandbox_path = None;
        self.branch = None;
        self.started_at = None;
        self.updated_at = now_ms();
    }

    /// Check if the feature is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the feature is claimable given the set of completed ids
    pub fn is_ready(&self, completed: &[&str]) -> bool {
        self.status == FeatureStatus::Pending && self.deps.iter().all(|dep| completed.contains(&dep.as_str()))
    }

    /// Criteria belonging to one tier
    pub fn criteria_for(&self, tier: Tier) -> Vec<&Criterion> {
        self.criteria.iter().filter(|c| c.tier == tier).collect()
    }
}

impl Record for Feature {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "features"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project".to_string(), IndexValue::String(self.project.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("priority".to_string(), IndexValue::String(self.priority.to_string()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_new() {
        let feature = Feature::new("proj-1", "Player Movement", "WASD controls");
        assert!(feature.id.contains("-feat-"));
        assert_eq!(feature.status, FeatureStatus::Pending);
        assert_eq!(feature.iteration, 0);
        assert_eq!(feature.attempt, 0);
        assert!(feature.sandbox_path.is_none());
    }

    #[test]
    fn test_feature_is_ready() {
        let mut feature = Feature::with_id("f-1", "proj", "Test");
        feature.add_dependency("d-1");
        feature.add_dependency("d-2");

        assert!(!feature.is_ready(&["d-1"]));
        assert!(feature.is_ready(&["d-1", "d-2"]));

        feature.set_status(FeatureStatus::InProgress);
        assert!(!feature.is_ready(&["d-1", "d-2"]));
    }

    #[test]
    fn test_feature_no_deps_is_ready() {
        let feature = Feature::with_id("f-1", "proj", "Test");
        assert!(feature.is_ready(&[]));
    }

    #[test]
    fn test_begin_attempt() {
        let mut feature = Feature::with_id("f-1", "proj", "Test");
        feature.iteration = 4;
        feature.set_error("old failure");
        feature.conflict_escalated = true;

        feature.begin_attempt();
        assert_eq!(feature.status, FeatureStatus::InProgress);
        assert_eq!(feature.attempt, 1);
        assert_eq!(feature.iteration, 0);
        assert!(feature.last_error.is_none());
        assert!(!feature.conflict_escalated);
        assert!(feature.started_at.is_some());
    }

    #[test]
    fn test_reset_for_retry_discards_sandbox_state() {
        let mut feature = Feature::with_id("f-1", "proj", "Test");
        feature.begin_attempt();
        feature.bind_sandbox("/tmp/sb/f-1", "orchd/f-1");
        feature.iteration = 3;
        feature.set_status(FeatureStatus::Failed);

        feature.reset_for_retry();
        assert_eq!(feature.status, FeatureStatus::Pending);
        assert_eq!(feature.iteration, 0);
        assert!(feature.sandbox_path.is_none());
        assert!(feature.branch.is_none());
        // Attempt count survives so retries are visible
        assert_eq!(feature.attempt, 1);
    }

    #[test]
    fn test_is_terminal() {
        let mut feature = Feature::with_id("f-1", "proj", "Test");
        assert!(!feature.is_terminal());

        feature.set_status(FeatureStatus::Review);
        assert!(!feature.is_terminal());

        feature.set_status(FeatureStatus::Completed);
        assert!(feature.is_terminal());

        feature.set_status(FeatureStatus::Failed);
        assert!(feature.is_terminal());
    }

    #[test]
    fn test_criteria_for_tier() {
        let mut feature = Feature::with_id("f-1", "proj", "Test");
        feature.add_criterion(Criterion::new("score increments", Tier::Logic));
        feature.add_criterion(Criterion::new("enemy moves left", Tier::Behavior));
        feature.add_criterion(Criterion::new("HUD is legible", Tier::Appearance));
        feature.add_criterion(Criterion::new("score persists", Tier::Logic));

        assert_eq!(feature.criteria_for(Tier::Logic).len(), 2);
        assert_eq!(feature.criteria_for(Tier::Behavior).len(), 1);
        assert_eq!(feature.criteria_for(Tier::Appearance).len(), 1);
    }

    #[test]
    fn test_feature_indexed_fields() {
        let feature = Feature::with_id("f-1", "proj-9", "Test");
        let fields = feature.indexed_fields();
        assert_eq!(fields.get("project"), Some(&IndexValue::String("proj-9".to_string())));
        assert_eq!(fields.get("status"), Some(&IndexValue::String("pending".to_string())));
    }

    #[test]
    fn test_feature_serde_roundtrip() {
        let mut feature = Feature::new("proj", "Test Feature", "description");
        feature.add_criterion(Criterion::new("works", Tier::Logic));
        feature.add_dependency("dep-1");

        let json = serde_json::to_string(&feature).unwrap();
        let back: Feature = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, feature.id);
        assert_eq!(back.criteria, feature.criteria);
        assert_eq!(back.deps, feature.deps);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(FeatureStatus::InProgress.to_string(), "in_progress");
        assert_eq!(FeatureStatus::Review.to_string(), "review");
    }
}
