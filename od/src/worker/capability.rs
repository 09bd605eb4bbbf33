//! Capability trait and worker types

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Criterion;

/// Worker kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Coder,
    Validator,
    Reviewer,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coder => write!(f, "coder"),
            Self::Validator => write!(f, "validator"),
            Self::Reviewer => write!(f, "reviewer"),
        }
    }
}

/// Task handed to a worker invocation
#[derive(Debug, Clone)]
pub struct WorkerTask {
    /// Project id
    pub project: String,

    /// Feature id
    pub feature_id: String,

    /// What to do
    pub description: String,

    /// Acceptance criteria relevant to this invocation
    pub criteria: Vec<Criterion>,

    /// Root of the sandbox the worker owns for this invocation
    pub sandbox_root: PathBuf,

    /// Failure output from earlier invocations, as fix input
    pub prior_failures: Vec<String>,
}

impl WorkerTask {
    pub fn new(
        project: impl Into<String>,
        feature_id: impl Into<String>,
        description: impl Into<String>,
        sandbox_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            project: project.into(),
            feature_id: feature_id.into(),
            description: description.into(),
            criteria: Vec::new(),
            sandbox_root: sandbox_root.into(),
            prior_failures: Vec::new(),
        }
    }

    pub fn with_criteria(mut self, criteria: Vec<Criterion>) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_prior_failures(mut self, failures: Vec<String>) -> Self {
        self.prior_failures = failures;
        self
    }
}

/// Structured result returned by a worker
///
/// `notes` is opaque to the core: it is recorded on the Run and fed back
/// to later invocations, never interpreted.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerOutcome {
    pub success: bool,

    #[serde(default)]
    pub artifacts_changed: Vec<String>,

    #[serde(default)]
    pub notes: String,
}

/// Errors from a worker invocation (timeouts are enforced by the pool)
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("worker failed to launch: {0}")]
    Launch(String),

    #[error("worker exited abnormally: {0}")]
    Crashed(String),

    #[error("malformed worker result: {0}")]
    MalformedResult(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An external worker capability
///
/// Implementations may take arbitrarily long; the pool wraps every invoke
/// in a hard wall-clock timeout.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Which kind of worker this is
    fn kind(&self) -> WorkerKind;

    /// Run the task against the sandbox
    async fn invoke(&self, task: &WorkerTask) -> Result<WorkerOutcome, CapabilityError>;
}

/// The three capabilities the lifecycle engine dispatches over
#[derive(Clone)]
pub struct WorkerSet {
    pub coder: Arc<dyn Capability>,
    pub validator: Arc<dyn Capability>,
    pub reviewer: Arc<dyn Capability>,
}

impl WorkerSet {
    pub fn new(coder: Arc<dyn Capability>, validator: Arc<dyn Capability>, reviewer: Arc<dyn Capability>) -> Self {
        Self {
            coder,
            validator,
            reviewer,
        }
    }

    /// Select a capability by kind
    pub fn get(&self, kind: WorkerKind) -> &Arc<dyn Capability> {
        match kind {
            WorkerKind::Coder => &self.coder,
            WorkerKind::Validator => &self.validator,
            WorkerKind::Reviewer => &self.reviewer,
        }
    }
}
