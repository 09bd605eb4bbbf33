//! LifecycleEngine - drives one claimed feature to a terminal state
//!
//! One engine instance owns one sandbox and one pool slot, and issues
//! strictly sequential worker invocations: implement, then the bounded
//! code-validate loop, then review, then merge. Every invocation is
//! recorded as a Run before the engine branches on its result.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::domain::{Criterion, Feature, Run, RunStatus, Tier};
use crate::pool::{InvokeError, Slot, WorkerPool};
use crate::state::StateManager;
use crate::telemetry::TelemetrySink;
use crate::worker::{WorkerKind, WorkerOutcome, WorkerSet, WorkerTask};
use crate::worktree::{MergeResult, Sandbox, WorktreeManager};

use super::config::LifecycleConfig;

/// Terminal result of one lifecycle task
#[derive(Debug)]
pub enum FeatureTaskResult {
    /// Merged to trunk
    Completed { feature_id: String, iterations: u32 },
    /// Attempt failed; the retry policy decides what happens next
    Failed { feature_id: String, reason: String },
    /// Merge conflict survived auto-resolution; feature holds in Review
    Escalated { feature_id: String, files: Vec<String> },
}

/// Outcome of one tier pass over the acceptance criteria
#[derive(Debug, Default)]
pub struct TierReport {
    /// All blocking tiers passed
    pub passed: bool,
    /// Accumulated failure notes from the first failing tier
    pub failures: Vec<String>,
    /// Appearance-tier notes; recorded, never blocking
    pub evidence: Vec<String>,
}

/// A worker invocation as the engine sees it
enum Invoked {
    Outcome(WorkerOutcome),
    TimedOut(std::time::Duration),
    Crashed(String),
}

/// Tier pass result: a report, or a fatal worker problem
enum TierRun {
    Report(TierReport),
    Fatal(String),
}

/// Engine driving one feature's lifecycle
pub struct LifecycleEngine {
    feature: Feature,
    config: LifecycleConfig,
    workers: WorkerSet,
    pool: Arc<WorkerPool>,
    slot: Slot,
    state: StateManager,
    worktree: Arc<WorktreeManager>,
    sandbox: Sandbox,
    telemetry: TelemetrySink,
}

impl LifecycleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feature: Feature,
        sandbox: Sandbox,
        slot: Slot,
        config: LifecycleConfig,
        workers: WorkerSet,
        pool: Arc<WorkerPool>,
        state: StateManager,
        worktree: Arc<WorktreeManager>,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            feature,
            config,
            workers,
            pool,
            slot,
            state,
            worktree,
            sandbox,
            telemetry,
        }
    }

    /// Run the lifecycle to a terminal result
    ///
    /// Never panics the task: internal errors (store loss, git breakage)
    /// collapse into a Failed result so the scheduler can apply policy.
    pub async fn run(mut self) -> FeatureTaskResult {
        let feature_id = self.feature.id.clone();
        info!(feature = %feature_id, attempt = self.feature.attempt, "Lifecycle starting");

        match self.drive().await {
            Ok(result) => result,
            Err(e) => {
                let reason = format!("internal error: {}", e);
                warn!(feature = %feature_id, %reason, "Lifecycle aborted");
                let _ = self.state.fail_feature(&feature_id, &reason).await;
                FeatureTaskResult::Failed { feature_id, reason }
            }
        }
    }

    async fn drive(&mut self) -> eyre::Result<FeatureTaskResult> {
        let id = self.feature.id.clone();
        self.telemetry
            .emit(&id, "attempt_started", json!({"attempt": self.feature.attempt}));

        // Initial implementation
        match self
            .invoke_worker(WorkerKind::Coder, self.feature.description.clone(), self.feature.criteria.clone(), Vec::new())
            .await?
        {
            Invoked::Outcome(_) => {}
            Invoked::TimedOut(d) => return self.fail_attempt(format!("coder timed out after {:?}", d)).await,
            Invoked::Crashed(e) => return self.fail_attempt(format!("coder failed: {}", e)).await,
        }

        // Code-validate loop; the budget is shared across review cycles
        let mut iterations_used = self.feature.iteration;
        loop {
            if iterations_used >= self.config.max_code_test_iterations {
                return self
                    .fail_attempt(format!(
                        "max iterations exceeded ({} code-test iterations)",
                        iterations_used
                    ))
                    .await;
            }
            iterations_used = self.state.bump_iteration(&id).await?;

            let report = match self.run_validation_tiers().await? {
                TierRun::Report(report) => report,
                TierRun::Fatal(reason) => return self.fail_attempt(reason).await,
            };

            if !report.evidence.is_empty() {
                self.telemetry
                    .emit(&id, "appearance_evidence", json!({"evidence": report.evidence}));
            }

            if !report.passed {
                self.telemetry.emit(
                    &id,
                    "validation_failed",
                    json!({"iteration": iterations_used, "failures": report.failures}),
                );
                match self
                    .invoke_worker(
                        WorkerKind::Coder,
                        self.feature.description.clone(),
                        self.feature.criteria.clone(),
                        report.failures,
                    )
                    .await?
                {
                    Invoked::Outcome(_) => continue,
                    Invoked::TimedOut(d) => {
                        return self.fail_attempt(format!("coder timed out after {:?}", d)).await;
                    }
                    Invoked::Crashed(e) => return self.fail_attempt(format!("coder failed: {}", e)).await,
                }
            }

            // Validation passed: hand over to review
            self.state.mark_review(&id).await?;
            self.telemetry.emit(&id, "review_requested", json!({"iteration": iterations_used}));

            let review = match self
                .invoke_worker(WorkerKind::Reviewer, self.feature.description.clone(), self.feature.criteria.clone(), Vec::new())
                .await?
            {
                Invoked::Outcome(outcome) => outcome,
                Invoked::TimedOut(d) => return self.fail_attempt(format!("reviewer timed out after {:?}", d)).await,
                Invoked::Crashed(e) => return self.fail_attempt(format!("reviewer failed: {}", e)).await,
            };

            if !review.success {
                // Changes requested: back to the loop, budget keeps counting
                self.telemetry
                    .emit(&id, "changes_requested", json!({"notes": review.notes}));
                self.state.mark_in_progress(&id).await?;
                match self
                    .invoke_worker(
                        WorkerKind::Coder,
                        self.feature.description.clone(),
                        self.feature.criteria.clone(),
                        vec![format!("review requested changes: {}", review.notes)],
                    )
                    .await?
                {
                    Invoked::Outcome(_) => continue,
                    Invoked::TimedOut(d) => {
                        return self.fail_attempt(format!("coder timed out after {:?}", d)).await;
                    }
                    Invoked::Crashed(e) => return self.fail_attempt(format!("coder failed: {}", e)).await,
                }
            }

            return self.merge_approved(iterations_used).await;
        }
    }

    /// Tiered validation: logic gates behavior; appearance never blocks
    async fn run_validation_tiers(&self) -> eyre::Result<TierRun> {
        let mut evidence = Vec::new();

        for tier in [Tier::Logic, Tier::Behavior] {
            let criteria: Vec<Criterion> = self.feature.criteria_for(tier).into_iter().cloned().collect();
            if criteria.is_empty() {
                continue;
            }

            match self
                .invoke_worker(
                    WorkerKind::Validator,
                    format!("Verify {} acceptance criteria for: {}", tier, self.feature.name),
                    criteria,
                    Vec::new(),
                )
                .await?
            {
                Invoked::Outcome(outcome) if outcome.success => {}
                Invoked::Outcome(outcome) => {
                    // Short-circuit: remaining tiers are skipped
                    return Ok(TierRun::Report(TierReport {
                        passed: false,
                        failures: vec![format!("{} tier: {}", tier, outcome.notes)],
                        evidence,
                    }));
                }
                Invoked::TimedOut(d) => {
                    return Ok(TierRun::Fatal(format!("validator timed out after {:?}", d)));
                }
                Invoked::Crashed(e) => return Ok(TierRun::Fatal(format!("validator failed: {}", e))),
            }
        }

        let appearance: Vec<Criterion> = self.feature.criteria_for(Tier::Appearance).into_iter().cloned().collect();
        if !appearance.is_empty() {
            match self
                .invoke_worker(
                    WorkerKind::Validator,
                    format!("Capture appearance evidence for: {}", self.feature.name),
                    appearance,
                    Vec::new(),
                )
                .await?
            {
                Invoked::Outcome(outcome) => evidence.push(outcome.notes),
                Invoked::TimedOut(_) => evidence.push("appearance capture timed out".to_string()),
                Invoked::Crashed(e) => evidence.push(format!("appearance capture failed: {}", e)),
            }
        }

        Ok(TierRun::Report(TierReport {
            passed: true,
            failures: Vec::new(),
            evidence,
        }))
    }

    /// Review approved: merge, with one bounded auto-resolve pass
    async fn merge_approved(&self, iterations: u32) -> eyre::Result<FeatureTaskResult> {
        let id = self.feature.id.clone();

        let first = match self.worktree.merge(&self.sandbox).await {
            Ok(result) => result,
            Err(e) => return self.fail_attempt(format!("merge failed: {}", e)).await,
        };

        let files = match first {
            MergeResult::Clean => return self.completed(iterations).await,
            MergeResult::Conflict { files } => files,
        };

        self.telemetry.emit(&id, "merge_conflict", json!({"files": files}));

        // One auto-resolve pass: re-invoke the coder with the conflict as
        // context, then re-attempt the merge once. A broken resolver is
        // treated the same as an unresolved conflict.
        let context = format!(
            "merge into trunk conflicted in: {}; update this sandbox so it merges cleanly against the current trunk",
            files.join(", ")
        );
        let resolver_ran = matches!(
            self.invoke_worker(WorkerKind::Coder, self.feature.description.clone(), self.feature.criteria.clone(), vec![context])
                .await?,
            Invoked::Outcome(_)
        );

        if resolver_ran {
            match self.worktree.merge(&self.sandbox).await {
                Ok(MergeResult::Clean) => return self.completed(iterations).await,
                Ok(MergeResult::Conflict { files }) => {
                    return self.escalate(files).await;
                }
                Err(e) => return self.fail_attempt(format!("merge failed: {}", e)).await,
            }
        }

        self.escalate(files).await
    }

    async fn completed(&self, iterations: u32) -> eyre::Result<FeatureTaskResult> {
        let id = self.feature.id.clone();
        self.state.complete_feature(&id).await?;
        self.telemetry.emit(&id, "completed", json!({"iterations": iterations}));
        info!(feature = %id, iterations, "Feature completed");
        Ok(FeatureTaskResult::Completed {
            feature_id: id,
            iterations,
        })
    }

    async fn escalate(&self, files: Vec<String>) -> eyre::Result<FeatureTaskResult> {
        let id = self.feature.id.clone();
        self.state.escalate_conflict(&id).await?;
        self.telemetry.emit(&id, "conflict_escalated", json!({"files": files}));
        warn!(feature = %id, ?files, "Merge conflict escalated; feature holds in review");
        Ok(FeatureTaskResult::Escalated {
            feature_id: id,
            files,
        })
    }

    async fn fail_attempt(&self, reason: String) -> eyre::Result<FeatureTaskResult> {
        let id = self.feature.id.clone();
        warn!(feature = %id, %reason, "Attempt failed");
        self.state.fail_feature(&id, &reason).await?;
        self.telemetry
            .emit(&id, "attempt_failed", json!({"reason": reason, "attempt": self.feature.attempt}));
        Ok(FeatureTaskResult::Failed {
            feature_id: id,
            reason,
        })
    }

    /// Invoke one worker under the pool timeout, recording a Run either way
    async fn invoke_worker(
        &self,
        kind: WorkerKind,
        description: String,
        criteria: Vec<Criterion>,
        prior_failures: Vec<String>,
    ) -> eyre::Result<Invoked> {
        let mut run = Run::open(&self.feature.project, &self.feature.id, kind.to_string());
        self.state
            .create_run(run.clone())
            .await
            .map_err(|e| eyre::eyre!("create run: {}", e))?;

        let task = WorkerTask::new(
            &self.feature.project,
            &self.feature.id,
            description,
            self.sandbox.path.clone(),
        )
        .with_criteria(criteria)
        .with_prior_failures(prior_failures);

        let result = self
            .pool
            .invoke(
                &self.slot,
                self.workers.get(kind).as_ref(),
                &task,
                self.config.timeout_for(kind),
            )
            .await;

        let invoked = match result {
            Ok(outcome) => {
                let status = if outcome.success { RunStatus::Success } else { RunStatus::Failed };
                run.close(status, serde_json::to_value(&outcome).unwrap_or_default());
                Invoked::Outcome(outcome)
            }
            Err(InvokeError::TimedOut(d)) => {
                run.close(RunStatus::TimedOut, json!({"timeout_ms": d.as_millis() as u64}));
                Invoked::TimedOut(d)
            }
            Err(InvokeError::Capability(e)) => {
                run.close(RunStatus::Failed, json!({"error": e.to_string()}));
                Invoked::Crashed(e.to_string())
            }
        };

        self.state
            .update_run(run)
            .await
            .map_err(|e| eyre::eyre!("close run: {}", e))?;
        Ok(invoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FeatureStatus;
    use crate::worker::{Capability, CapabilityError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::process::Command;
    use unitstore::Store;

    fn ok(notes: &str) -> Result<WorkerOutcome, CapabilityError> {
        Ok(WorkerOutcome {
            success: true,
            artifacts_changed: vec![],
            notes: notes.to_string(),
        })
    }

    fn fail(notes: &str) -> Result<WorkerOutcome, CapabilityError> {
        Ok(WorkerOutcome {
            success: false,
            artifacts_changed: vec![],
            notes: notes.to_string(),
        })
    }

    /// Worker that plays back a script, then falls through to a default
    struct Scripted {
        kind: WorkerKind,
        script: tokio::sync::Mutex<VecDeque<Result<WorkerOutcome, CapabilityError>>>,
        default_success: bool,
    }

    impl Scripted {
        fn always_ok(kind: WorkerKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script: tokio::sync::Mutex::new(VecDeque::new()),
                default_success: true,
            })
        }

        fn with_script(kind: WorkerKind, script: Vec<Result<WorkerOutcome, CapabilityError>>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script: tokio::sync::Mutex::new(script.into()),
                default_success: true,
            })
        }

        fn always_failing(kind: WorkerKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script: tokio::sync::Mutex::new(VecDeque::new()),
                default_success: false,
            })
        }
    }

    #[async_trait]
    impl Capability for Scripted {
        fn kind(&self) -> WorkerKind {
            self.kind
        }

        async fn invoke(&self, _task: &WorkerTask) -> Result<WorkerOutcome, CapabilityError> {
            if let Some(next) = self.script.lock().await.pop_front() {
                return next;
            }
            if self.default_success {
                ok("default ok")
            } else {
                fail("default failure")
            }
        }
    }

    /// Worker that never finishes inside any reasonable timeout
    struct Hung;

    #[async_trait]
    impl Capability for Hung {
        fn kind(&self) -> WorkerKind {
            WorkerKind::Validator
        }

        async fn invoke(&self, _task: &WorkerTask) -> Result<WorkerOutcome, CapabilityError> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            ok("never")
        }
    }

    async fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git").args(args).current_dir(dir).output().await.unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    async fn setup_trunk(dir: &Path) {
        git(dir, &["init"]).await;
        git(dir, &["config", "user.email", "test@test.com"]).await;
        git(dir, &["config", "user.name", "Test"]).await;
        git(dir, &["checkout", "-b", "main"]).await;
        git(dir, &["commit", "--allow-empty", "-m", "initial"]).await;
    }

    struct Fixture {
        _repo: TempDir,
        _base: TempDir,
        repo_root: std::path::PathBuf,
        state: StateManager,
        worktree: Arc<WorktreeManager>,
        pool: Arc<WorkerPool>,
    }

    async fn fixture() -> Fixture {
        let repo = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        setup_trunk(repo.path()).await;

        let worktree = Arc::new(WorktreeManager::new(crate::worktree::WorktreeConfig {
            base_dir: base.path().to_path_buf(),
            repo_root: repo.path().to_path_buf(),
            branch_prefix: "test".to_string(),
            trunk: "main".to_string(),
        }));

        Fixture {
            repo_root: repo.path().to_path_buf(),
            _repo: repo,
            _base: base,
            state: StateManager::spawn_with_store(Store::open_in_memory().unwrap()),
            worktree,
            pool: Arc::new(WorkerPool::new(2)),
        }
    }

    /// Create, claim, and sandbox a feature, returning a ready engine
    async fn engine_for(
        fx: &Fixture,
        mut feature: Feature,
        config: LifecycleConfig,
        workers: WorkerSet,
    ) -> LifecycleEngine {
        feature.project = "proj".to_string();
        let id = feature.id.clone();
        fx.state.create_feature(feature).await.unwrap();
        let claimed = fx.state.claim_feature(&id).await.unwrap().unwrap();

        let sandbox = fx.worktree.create(&id).await.unwrap();
        fx.state
            .bind_sandbox(&id, &sandbox.path.display().to_string(), &sandbox.branch)
            .await
            .unwrap();
        let slot = fx.pool.acquire().await.unwrap();

        LifecycleEngine::new(
            claimed,
            sandbox,
            slot,
            config,
            workers,
            fx.pool.clone(),
            fx.state.clone(),
            fx.worktree.clone(),
            TelemetrySink::disabled(),
        )
    }

    fn workers_all_ok() -> WorkerSet {
        WorkerSet::new(
            Scripted::always_ok(WorkerKind::Coder),
            Scripted::always_ok(WorkerKind::Validator),
            Scripted::always_ok(WorkerKind::Reviewer),
        )
    }

    fn logic_feature(id: &str) -> Feature {
        let mut f = Feature::with_id(id, "proj", id);
        f.add_criterion(Criterion::new("it works", Tier::Logic));
        f
    }

    #[tokio::test]
    async fn test_happy_path_completes_first_iteration() {
        let fx = fixture().await;
        let engine = engine_for(&fx, logic_feature("f-happy"), LifecycleConfig::default(), workers_all_ok()).await;

        let result = engine.run().await;
        match result {
            FeatureTaskResult::Completed { iterations, .. } => assert_eq!(iterations, 1),
            other => panic!("expected Completed, got {:?}", other),
        }

        let f = fx.state.get_feature_required("f-happy").await.unwrap();
        assert_eq!(f.status, FeatureStatus::Completed);
        assert_eq!(f.iteration, 1);
        assert!(f.sandbox_path.is_none());
        assert!(!fx.worktree.exists("f-happy"));
    }

    #[tokio::test]
    async fn test_fails_twice_then_passes_third() {
        let fx = fixture().await;
        let workers = WorkerSet::new(
            Scripted::always_ok(WorkerKind::Coder),
            Scripted::with_script(
                WorkerKind::Validator,
                vec![fail("assert broke"), fail("still broke"), ok("clean")],
            ),
            Scripted::always_ok(WorkerKind::Reviewer),
        );
        let config = LifecycleConfig {
            max_code_test_iterations: 10,
            ..Default::default()
        };
        let engine = engine_for(&fx, logic_feature("f-third"), config, workers).await;

        let result = engine.run().await;
        match result {
            FeatureTaskResult::Completed { iterations, .. } => assert_eq!(iterations, 3),
            other => panic!("expected Completed, got {:?}", other),
        }

        let f = fx.state.get_feature_required("f-third").await.unwrap();
        assert_eq!(f.iteration, 3);
    }

    #[tokio::test]
    async fn test_loop_exhaustion_fails_with_message() {
        let fx = fixture().await;
        let workers = WorkerSet::new(
            Scripted::always_ok(WorkerKind::Coder),
            Scripted::always_failing(WorkerKind::Validator),
            Scripted::always_ok(WorkerKind::Reviewer),
        );
        let config = LifecycleConfig {
            max_code_test_iterations: 3,
            ..Default::default()
        };
        let engine = engine_for(&fx, logic_feature("f-exhaust"), config, workers).await;

        let result = engine.run().await;
        match result {
            FeatureTaskResult::Failed { reason, .. } => {
                assert!(reason.contains("max iterations exceeded"), "reason: {}", reason);
            }
            other => panic!("expected Failed, got {:?}", other),
        }

        let f = fx.state.get_feature_required("f-exhaust").await.unwrap();
        assert_eq!(f.status, FeatureStatus::Failed);
        // The loop stopped exactly at the budget
        assert_eq!(f.iteration, 3);
        assert!(f.last_error.as_deref().unwrap().contains("max iterations exceeded"));
    }

    #[tokio::test]
    async fn test_validator_timeout_fails_attempt() {
        let fx = fixture().await;
        let workers = WorkerSet::new(
            Scripted::always_ok(WorkerKind::Coder),
            Arc::new(Hung),
            Scripted::always_ok(WorkerKind::Reviewer),
        );
        let config = LifecycleConfig {
            validator_timeout_ms: 50,
            ..Default::default()
        };
        let engine = engine_for(&fx, logic_feature("f-hung"), config, workers).await;

        let result = engine.run().await;
        match result {
            FeatureTaskResult::Failed { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("expected Failed, got {:?}", other),
        }

        // The timed-out invocation is in the run history
        let runs = fx.state.list_runs("f-hung").await.unwrap();
        assert!(runs.iter().any(|r| r.status == RunStatus::TimedOut));
    }

    #[tokio::test]
    async fn test_changes_requested_shares_iteration_budget() {
        let fx = fixture().await;
        let workers = WorkerSet::new(
            Scripted::always_ok(WorkerKind::Coder),
            Scripted::always_ok(WorkerKind::Validator),
            Scripted::with_script(WorkerKind::Reviewer, vec![fail("tighten the tests"), ok("approved")]),
        );
        let engine = engine_for(&fx, logic_feature("f-review"), LifecycleConfig::default(), workers).await;

        let result = engine.run().await;
        match result {
            // One validate pass before each review: iteration did not reset
            FeatureTaskResult::Completed { iterations, .. } => assert_eq!(iterations, 2),
            other => panic!("expected Completed, got {:?}", other),
        }

        let f = fx.state.get_feature_required("f-review").await.unwrap();
        assert_eq!(f.status, FeatureStatus::Completed);
        assert_eq!(f.iteration, 2);
    }

    #[tokio::test]
    async fn test_behavior_tier_short_circuits() {
        let fx = fixture().await;
        let mut feature = Feature::with_id("f-tiers", "proj", "f-tiers");
        feature.add_criterion(Criterion::new("logic holds", Tier::Logic));
        feature.add_criterion(Criterion::new("behaves live", Tier::Behavior));

        // Iteration 1: logic ok, behavior fails (2 validator runs).
        // Iteration 2: logic ok, behavior ok (2 more).
        let workers = WorkerSet::new(
            Scripted::always_ok(WorkerKind::Coder),
            Scripted::with_script(
                WorkerKind::Validator,
                vec![ok("logic fine"), fail("no enemy spawned"), ok("logic fine"), ok("behaves")],
            ),
            Scripted::always_ok(WorkerKind::Reviewer),
        );
        let engine = engine_for(&fx, feature, LifecycleConfig::default(), workers).await;

        let result = engine.run().await;
        assert!(matches!(result, FeatureTaskResult::Completed { iterations: 2, .. }));

        let runs = fx.state.list_runs("f-tiers").await.unwrap();
        let validator_runs = runs.iter().filter(|r| r.worker == "validator").count();
        assert_eq!(validator_runs, 4);
    }

    #[tokio::test]
    async fn test_logic_failure_skips_behavior_tier() {
        let fx = fixture().await;
        let mut feature = Feature::with_id("f-short", "proj", "f-short");
        feature.add_criterion(Criterion::new("logic holds", Tier::Logic));
        feature.add_criterion(Criterion::new("behaves live", Tier::Behavior));

        // Iteration 1: logic fails -> behavior must not run.
        // Iteration 2: logic ok, behavior ok.
        let workers = WorkerSet::new(
            Scripted::always_ok(WorkerKind::Coder),
            Scripted::with_script(
                WorkerKind::Validator,
                vec![fail("logic broke"), ok("logic fine"), ok("behaves")],
            ),
            Scripted::always_ok(WorkerKind::Reviewer),
        );
        let engine = engine_for(&fx, feature, LifecycleConfig::default(), workers).await;

        let result = engine.run().await;
        assert!(matches!(result, FeatureTaskResult::Completed { iterations: 2, .. }));

        let runs = fx.state.list_runs("f-short").await.unwrap();
        let validator_runs = runs.iter().filter(|r| r.worker == "validator").count();
        assert_eq!(validator_runs, 3);
    }

    #[tokio::test]
    async fn test_appearance_tier_never_blocks() {
        let fx = fixture().await;
        let mut feature = Feature::with_id("f-looks", "proj", "f-looks");
        feature.add_criterion(Criterion::new("logic holds", Tier::Logic));
        feature.add_criterion(Criterion::new("HUD looks right", Tier::Appearance));

        // Appearance capture reports failure; the loop must not care
        let workers = WorkerSet::new(
            Scripted::always_ok(WorkerKind::Coder),
            Scripted::with_script(
                WorkerKind::Validator,
                vec![ok("logic fine"), fail("screenshot looks off")],
            ),
            Scripted::always_ok(WorkerKind::Reviewer),
        );
        let engine = engine_for(&fx, feature, LifecycleConfig::default(), workers).await;

        let result = engine.run().await;
        assert!(matches!(result, FeatureTaskResult::Completed { iterations: 1, .. }));
    }

    #[tokio::test]
    async fn test_conflict_escalates_after_bounded_resolution() {
        let fx = fixture().await;
        let engine = engine_for(
            &fx,
            logic_feature("f-conflict"),
            LifecycleConfig::default(),
            workers_all_ok(),
        )
        .await;

        // Diverge trunk after the sandbox forked it, touching the same file
        // the sandbox writes. The no-op coder will not resolve anything.
        tokio::fs::write(fx.repo_root.join("shared.txt"), "trunk version")
            .await
            .unwrap();
        git(&fx.repo_root, &["add", "-A"]).await;
        git(&fx.repo_root, &["commit", "-m", "trunk change"]).await;

        let sandbox_path = fx.worktree.sandbox_for("f-conflict").path;
        tokio::fs::write(sandbox_path.join("shared.txt"), "sandbox version")
            .await
            .unwrap();

        let trunk_head_before = fx.worktree.head(&fx.repo_root).await.unwrap();

        let result = engine.run().await;
        match result {
            FeatureTaskResult::Escalated { files, .. } => {
                assert_eq!(files, vec!["shared.txt".to_string()]);
            }
            other => panic!("expected Escalated, got {:?}", other),
        }

        // Feature holds in Review with the conflict flag; trunk untouched;
        // sandbox retained for the operator
        let f = fx.state.get_feature_required("f-conflict").await.unwrap();
        assert_eq!(f.status, FeatureStatus::Review);
        assert!(f.conflict_escalated);
        assert_eq!(fx.worktree.head(&fx.repo_root).await.unwrap(), trunk_head_before);
        assert!(fx.worktree.exists("f-conflict"));
    }

    #[tokio::test]
    async fn test_runs_recorded_for_every_invocation() {
        let fx = fixture().await;
        let engine = engine_for(&fx, logic_feature("f-runs"), LifecycleConfig::default(), workers_all_ok()).await;
        engine.run().await;

        let runs = fx.state.list_runs("f-runs").await.unwrap();
        // implement + validate + review
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.is_closed()));
        let workers: Vec<&str> = runs.iter().map(|r| r.worker.as_str()).collect();
        assert!(workers.contains(&"coder"));
        assert!(workers.contains(&"validator"));
        assert!(workers.contains(&"reviewer"));
    }
}
