//! orchd - feature-graph build orchestrator
//!
//! orchd coordinates the autonomous construction of a software deliverable:
//! a plan manifest is decomposed into a dependency graph of features, and
//! each feature is driven through an isolated build-test-review lifecycle
//! in its own git worktree, in parallel, until the whole graph is settled.
//!
//! The hard part is orchestration under partial failure, not code
//! generation (that is delegated to external worker commands):
//!
//! - **Ready set as a query**: completing a feature never writes to its
//!   dependents; eligibility is recomputed from status snapshots each tick
//! - **One sandbox per feature**: claims are atomic test-and-set through a
//!   single state actor
//! - **Serialized trunk**: merges hold one global lock; a conflict leaves
//!   trunk untouched
//! - **Failure stays local**: a feature's failure never propagates to
//!   sibling sandboxes; retries re-enter with a fresh sandbox
//!
//! # Modules
//!
//! - [`graph`] - dependency graph and ready-set computation
//! - [`worktree`] - sandbox isolation and the serialized trunk merge
//! - [`pool`] - bounded worker slots with hard invocation timeouts
//! - [`lifecycle`] - the per-feature state machine
//! - [`scheduler`] - the top-level control loop
//! - [`worker`] - the external capability interface (coder/validator/reviewer)

pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod graph;
pub mod lifecycle;
pub mod manifest;
pub mod pool;
pub mod scheduler;
pub mod state;
pub mod telemetry;
pub mod worker;
pub mod worktree;

// Re-export commonly used types
pub use config::{Config, PoolSettings, StorageConfig, TelemetryConfig, WorkersConfig};
pub use domain::{Checkpoint, Criterion, Feature, FeatureStatus, Priority, Run, RunStatus, Tier};
pub use graph::{FeatureGraph, GraphError};
pub use lifecycle::{FeatureTaskResult, LifecycleConfig, LifecycleEngine};
pub use manifest::Manifest;
pub use pool::{InvokeError, PoolError, Slot, WorkerPool};
pub use scheduler::{ProjectSummary, Scheduler, SchedulerConfig};
pub use state::{StateError, StateManager};
pub use telemetry::TelemetrySink;
pub use worker::{Capability, CapabilityError, CommandCapability, WorkerKind, WorkerOutcome, WorkerSet, WorkerTask};
pub use worktree::{MergeResult, Sandbox, SandboxError, WorktreeConfig, WorktreeManager};
