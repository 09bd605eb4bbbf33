//! Scheduler implementation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{Checkpoint, FeatureStatus};
use crate::graph::FeatureGraph;
use crate::lifecycle::{FeatureTaskResult, LifecycleConfig, LifecycleEngine};
use crate::pool::WorkerPool;
use crate::state::StateManager;
use crate::telemetry::TelemetrySink;
use crate::worker::WorkerSet;
use crate::worktree::{SandboxError, WorktreeManager};

use super::config::SchedulerConfig;

/// Final tally for a project run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSummary {
    pub completed: usize,
    pub failed: usize,
    /// Held in Review with a conflict flag, awaiting an operator
    pub escalated: usize,
    /// Still Pending at quiescence (a failed or escalated dependency)
    pub blocked: usize,
}

/// Per-feature stall tracking
struct StallEntry {
    head: String,
    since: Instant,
}

/// The scheduler drives one project to quiescence
pub struct Scheduler {
    project: String,
    config: SchedulerConfig,
    lifecycle_config: LifecycleConfig,
    state: StateManager,
    pool: Arc<WorkerPool>,
    workers: WorkerSet,
    worktree: Arc<WorktreeManager>,
    telemetry: TelemetrySink,

    /// Running lifecycle tasks by feature id
    tasks: HashMap<String, JoinHandle<FeatureTaskResult>>,

    /// Delayed retry resets in flight
    retry_tasks: Vec<JoinHandle<()>>,

    /// Stall tracking for active sandboxes
    stall: HashMap<String, StallEntry>,

    cancel_tx: mpsc::Sender<String>,
    cancel_rx: mpsc::Receiver<String>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: impl Into<String>,
        config: SchedulerConfig,
        lifecycle_config: LifecycleConfig,
        state: StateManager,
        pool: Arc<WorkerPool>,
        workers: WorkerSet,
        worktree: Arc<WorktreeManager>,
        telemetry: TelemetrySink,
    ) -> Self {
        let (cancel_tx, cancel_rx) = mpsc::channel(16);
        Self {
            project: project.into(),
            config,
            lifecycle_config,
            state,
            pool,
            workers,
            worktree,
            telemetry,
            tasks: HashMap::new(),
            retry_tasks: Vec::new(),
            stall: HashMap::new(),
            cancel_tx,
            cancel_rx,
        }
    }

    /// Handle for requesting cancellation of a feature while running
    pub fn cancel_handle(&self) -> mpsc::Sender<String> {
        self.cancel_tx.clone()
    }

    /// Run the control loop until the project is quiescent or shutdown is
    /// signalled
    pub async fn run(&mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<ProjectSummary> {
        info!(project = %self.project, "Scheduler starting");

        // Graph errors are fatal before any unit is claimed
        self.validate_graph().await?;
        self.recover_interrupted().await?;

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        let mut checkpoint_tick = tokio::time::interval(Duration::from_millis(self.config.checkpoint_interval_ms));

        // The receiver moves out of self so select can poll it while the
        // arm bodies borrow self
        let (_dead_tx, dead_rx) = mpsc::channel(1);
        let mut cancel_rx = std::mem::replace(&mut self.cancel_rx, dead_rx);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.reap_retries();
                    self.reap_completed().await;
                    self.claim_ready().await?;
                    if self.quiescent().await? {
                        info!(project = %self.project, "Project quiescent");
                        break;
                    }
                }
                _ = checkpoint_tick.tick() => {
                    self.observe_checkpoints().await;
                }
                Some(feature_id) = cancel_rx.recv() => {
                    self.cancel(&feature_id).await;
                }
                Some(()) = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    self.shutdown().await;
                    break;
                }
            }
        }

        self.summary().await
    }

    /// Load the full graph and fail fast on cycles or missing deps
    async fn validate_graph(&self) -> Result<()> {
        let features = self
            .state
            .list_features(Some(self.project.clone()), None)
            .await
            .map_err(|e| eyre::eyre!("list features: {}", e))?;

        if features.is_empty() {
            eyre::bail!("project {} has no features", self.project);
        }

        FeatureGraph::from_features(features).context("dependency graph rejected")?;
        Ok(())
    }

    /// Reset features stranded mid-flight by a crash and clean up leaked
    /// sandboxes. Nothing from an interrupted attempt is reused.
    async fn recover_interrupted(&self) -> Result<()> {
        let features = self
            .state
            .list_features(Some(self.project.clone()), None)
            .await
            .map_err(|e| eyre::eyre!("list features: {}", e))?;

        for feature in &features {
            let stranded = feature.status == FeatureStatus::InProgress
                || (feature.status == FeatureStatus::Review && !feature.conflict_escalated);
            if !stranded {
                continue;
            }

            info!(feature = %feature.id, status = %feature.status, "Recovering interrupted feature");
            let _ = self
                .worktree
                .discard(&self.worktree.sandbox_for(&feature.id), false)
                .await;
            let _ = self.state.fail_feature(&feature.id, "interrupted by restart").await;
            let _ = self.state.reset_for_retry(&feature.id).await;
        }

        // Sandboxes still bound to a feature (escalated reviews, retained
        // failures) survive; everything else is a leak
        let keep: Vec<String> = self
            .state
            .list_features(Some(self.project.clone()), None)
            .await
            .map_err(|e| eyre::eyre!("list features: {}", e))?
            .into_iter()
            .filter(|f| f.sandbox_path.is_some())
            .map(|f| f.id)
            .collect();
        if let Ok(cleaned) = self.worktree.cleanup_orphaned(&keep).await
            && cleaned > 0
        {
            info!(cleaned, "Removed orphaned sandboxes");
        }

        Ok(())
    }

    /// Claim ready units while pool capacity remains
    async fn claim_ready(&mut self) -> Result<()> {
        let features = self
            .state
            .list_features(Some(self.project.clone()), None)
            .await
            .map_err(|e| eyre::eyre!("list features: {}", e))?;
        let graph = FeatureGraph::from_features(features)?;

        let ready: Vec<String> = graph.ready_units().iter().map(|f| f.id.clone()).collect();
        for feature_id in ready {
            let Some(slot) = self.pool.try_acquire() else {
                debug!("Pool exhausted, deferring remaining ready units");
                break;
            };

            // Atomic test-and-set: a racing tick loses here, not later
            let claimed = match self.state.claim_feature(&feature_id).await {
                Ok(Some(feature)) => feature,
                Ok(None) => continue,
                Err(e) => {
                    warn!(feature = %feature_id, error = %e, "Claim failed");
                    continue;
                }
            };

            self.telemetry
                .emit(&feature_id, "claimed", json!({"attempt": claimed.attempt}));

            let sandbox = match self.create_sandbox(&feature_id).await {
                Ok(sandbox) => sandbox,
                Err(e) => {
                    let reason = format!("sandbox creation failed: {}", e);
                    error!(feature = %feature_id, %reason, "Releasing claim");
                    let _ = self.state.fail_feature(&feature_id, &reason).await;
                    self.apply_failure_policy(&feature_id).await;
                    continue;
                }
            };

            if let Err(e) = self
                .state
                .bind_sandbox(&feature_id, &sandbox.path.display().to_string(), &sandbox.branch)
                .await
            {
                warn!(feature = %feature_id, error = %e, "Bind sandbox failed");
            }

            let engine = LifecycleEngine::new(
                claimed,
                sandbox,
                slot,
                self.lifecycle_config.clone(),
                self.workers.clone(),
                self.pool.clone(),
                self.state.clone(),
                self.worktree.clone(),
                self.telemetry.clone(),
            );
            let handle = tokio::spawn(engine.run());
            self.tasks.insert(feature_id.clone(), handle);
            info!(feature = %feature_id, active = self.tasks.len(), "Spawned lifecycle");
        }

        Ok(())
    }

    /// Create the sandbox, retrying once after clearing a leaked one
    async fn create_sandbox(&self, feature_id: &str) -> Result<crate::worktree::Sandbox, SandboxError> {
        match self.worktree.create(feature_id).await {
            Ok(sandbox) => Ok(sandbox),
            Err(SandboxError::Collision(_)) => {
                warn!(feature = %feature_id, "Sandbox collision (leak from a previous crash), clearing and retrying once");
                self.worktree
                    .discard(&self.worktree.sandbox_for(feature_id), false)
                    .await?;
                self.worktree.create(feature_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Reap finished lifecycle tasks and release their bookkeeping
    async fn reap_completed(&mut self) {
        let finished: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for feature_id in finished {
            let Some(handle) = self.tasks.remove(&feature_id) else { continue };
            self.stall.remove(&feature_id);

            match handle.await {
                Ok(FeatureTaskResult::Completed { iterations, .. }) => {
                    info!(feature = %feature_id, iterations, "Lifecycle completed");
                }
                Ok(FeatureTaskResult::Escalated { files, .. }) => {
                    warn!(feature = %feature_id, ?files, "Lifecycle escalated, awaiting operator");
                }
                Ok(FeatureTaskResult::Failed { reason, .. }) => {
                    warn!(feature = %feature_id, %reason, "Lifecycle failed");
                    self.apply_failure_policy(&feature_id).await;
                }
                Err(e) if e.is_cancelled() => {
                    // Stall detection or cancellation already updated state
                    debug!(feature = %feature_id, "Lifecycle task aborted");
                    self.apply_failure_policy(&feature_id).await;
                }
                Err(e) => {
                    error!(feature = %feature_id, error = %e, "Lifecycle task panicked");
                    let _ = self.state.fail_feature(&feature_id, "lifecycle task panicked").await;
                    self.apply_failure_policy(&feature_id).await;
                }
            }
        }
    }

    /// Retry or finalize a failed feature
    ///
    /// While attempts remain: discard the sandbox now (a fresh one is
    /// created on the next claim) and schedule a delayed re-entry to
    /// Pending. Otherwise the failure stands; the sandbox is retained or
    /// discarded per config.
    async fn apply_failure_policy(&mut self, feature_id: &str) {
        let Ok(Some(feature)) = self.state.get_feature(feature_id).await else {
            return;
        };
        if feature.status != FeatureStatus::Failed {
            return;
        }

        if feature.attempt < self.lifecycle_config.max_attempts {
            let _ = self
                .worktree
                .discard(&self.worktree.sandbox_for(feature_id), false)
                .await;

            let delay = self.lifecycle_config.backoff_for(feature.attempt);
            info!(feature = %feature_id, attempt = feature.attempt, ?delay, "Scheduling retry");
            self.telemetry.emit(
                feature_id,
                "retry_scheduled",
                json!({"attempt": feature.attempt, "delay_ms": delay.as_millis() as u64}),
            );

            let state = self.state.clone();
            let id = feature_id.to_string();
            self.retry_tasks.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = state.reset_for_retry(&id).await {
                    warn!(feature = %id, error = %e, "Retry reset failed");
                }
            }));
        } else {
            let retain = self.lifecycle_config.retain_failed_sandboxes;
            let _ = self
                .worktree
                .discard(&self.worktree.sandbox_for(feature_id), retain)
                .await;
            warn!(
                feature = %feature_id,
                attempts = feature.attempt,
                "Retries exhausted, failure is final"
            );
            self.telemetry
                .emit(feature_id, "retries_exhausted", json!({"attempts": feature.attempt}));
        }
    }

    /// Drop finished retry timers
    fn reap_retries(&mut self) {
        self.retry_tasks.retain(|handle| !handle.is_finished());
    }

    /// Observe active sandbox heads; force-fail features whose sandbox has
    /// not moved within the stall window. Liveness only: checkpoints never
    /// gate correctness.
    async fn observe_checkpoints(&mut self) {
        let active: Vec<String> = self.tasks.keys().cloned().collect();
        for feature_id in active {
            let sandbox = self.worktree.sandbox_for(&feature_id);
            let head = match self.worktree.head(&sandbox.path).await {
                Ok(head) => head,
                Err(e) => {
                    debug!(feature = %feature_id, error = %e, "Checkpoint skipped");
                    continue;
                }
            };

            let _ = self
                .state
                .create_checkpoint(Checkpoint::observe(&self.project, &feature_id, &head))
                .await;

            let now = Instant::now();
            let entry = self.stall.entry(feature_id.clone()).or_insert_with(|| StallEntry {
                head: head.clone(),
                since: now,
            });
            if entry.head != head {
                entry.head = head;
                entry.since = now;
                continue;
            }

            if now.duration_since(entry.since) > Duration::from_millis(self.config.stall_timeout_ms) {
                let stalled_for = now.duration_since(entry.since);
                warn!(feature = %feature_id, ?stalled_for, "Sandbox stalled, forcing failure");
                let _ = self
                    .state
                    .fail_feature(
                        &feature_id,
                        &format!("stalled: no new commits for {}s", stalled_for.as_secs()),
                    )
                    .await;
                if let Some(handle) = self.tasks.get(&feature_id) {
                    handle.abort();
                }
                self.telemetry.emit(&feature_id, "stalled", json!({}));
            }
        }
    }

    /// Cancel a feature: abort the in-flight worker, release the slot (it
    /// drops with the task), discard the sandbox, and apply retry policy
    async fn cancel(&mut self, feature_id: &str) {
        info!(feature = %feature_id, "Cancel requested");
        if let Some(handle) = self.tasks.remove(feature_id) {
            handle.abort();
            let _ = handle.await;
        }
        self.stall.remove(feature_id);

        let _ = self.state.fail_feature(feature_id, "operator abort").await;
        self.telemetry.emit(feature_id, "cancelled", json!({}));
        self.apply_failure_policy(feature_id).await;
    }

    /// Nothing running, nothing scheduled to retry, nothing claimable:
    /// no transition can ever fire again
    async fn quiescent(&mut self) -> Result<bool> {
        if !self.tasks.is_empty() || !self.retry_tasks.is_empty() {
            return Ok(false);
        }
        let features = self
            .state
            .list_features(Some(self.project.clone()), None)
            .await
            .map_err(|e| eyre::eyre!("list features: {}", e))?;
        let graph = FeatureGraph::from_features(features)?;
        Ok(graph.ready_units().is_empty())
    }

    /// Wait briefly for in-flight lifecycles, then abort the rest
    async fn shutdown(&mut self) {
        info!(active = self.tasks.len(), "Scheduler shutting down");

        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        while !self.tasks.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.reap_completed().await;
        }

        if !self.tasks.is_empty() {
            warn!(remaining = self.tasks.len(), "Aborting remaining lifecycles");
            let drained: Vec<(String, JoinHandle<FeatureTaskResult>)> = self.tasks.drain().collect();
            for (feature_id, handle) in &drained {
                handle.abort();
                let _ = self.state.fail_feature(feature_id, "shutdown abort").await;
            }
            let _ = futures::future::join_all(drained.into_iter().map(|(_, handle)| handle)).await;
        }

        for handle in self.retry_tasks.drain(..) {
            handle.abort();
        }
    }

    async fn summary(&self) -> Result<ProjectSummary> {
        let features = self
            .state
            .list_features(Some(self.project.clone()), None)
            .await
            .map_err(|e| eyre::eyre!("list features: {}", e))?;

        let mut summary = ProjectSummary::default();
        for feature in &features {
            match feature.status {
                FeatureStatus::Completed => summary.completed += 1,
                FeatureStatus::Failed => summary.failed += 1,
                FeatureStatus::Review if feature.conflict_escalated => summary.escalated += 1,
                FeatureStatus::Pending => summary.blocked += 1,
                _ => {}
            }
        }
        Ok(summary)
    }
}
