//! State manager messages
//!
//! Commands and responses for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{Checkpoint, Feature, FeatureStatus, Run};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for {id}: {reason}")]
    InvalidTransition { id: String, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Channel error")]
    Channel,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Feature operations
    CreateFeature {
        feature: Feature,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetFeature {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Feature>>>,
    },
    ListFeatures {
        project: Option<String>,
        status: Option<FeatureStatus>,
        reply: oneshot::Sender<StateResponse<Vec<Feature>>>,
    },

    // Atomic transitions, keyed by feature id
    /// Pending -> InProgress with attempt bump; returns None if the feature
    /// was not claimable (already claimed by a racing caller, or terminal)
    ClaimFeature {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Feature>>>,
    },
    BindSandbox {
        id: String,
        path: String,
        branch: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    MarkReview {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    MarkInProgress {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    BumpIteration {
        id: String,
        reply: oneshot::Sender<StateResponse<u32>>,
    },
    CompleteFeature {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    FailFeature {
        id: String,
        error: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    EscalateConflict {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ResetForRetry {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Run history (append-only)
    CreateRun {
        run: Run,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    UpdateRun {
        run: Run,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListRuns {
        feature: String,
        reply: oneshot::Sender<StateResponse<Vec<Run>>>,
    },

    // Checkpoints
    CreateCheckpoint {
        checkpoint: Checkpoint,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    ListCheckpoints {
        feature: String,
        reply: oneshot::Sender<StateResponse<Vec<Checkpoint>>>,
    },

    // Shutdown
    Shutdown,
}
