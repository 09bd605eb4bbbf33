//! StateManager - actor that owns the store
//!
//! Processes commands via channels. Because the actor handles one command
//! at a time, every transition is an atomic read-modify-write: two
//! lifecycle tasks racing on the same feature cannot interleave their
//! updates. (The one-sandbox-per-unit invariant should prevent the race in
//! the first place; this enforces it anyway.)

use std::path::Path;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use unitstore::{Filter, Store, StoreError};

use crate::domain::{Checkpoint, Feature, FeatureStatus, Run};

use super::messages::{StateCommand, StateError, StateResponse};

impl From<StoreError> for StateError {
    fn from(e: StoreError) -> Self {
        StateError::Store(e.to_string())
    }
}

/// Handle to send commands to the StateManager actor
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn a new StateManager actor over a store directory
    pub fn spawn(store_path: impl AsRef<Path>) -> eyre::Result<Self> {
        let mut store = Store::open(store_path.as_ref())?;

        let features = store.rebuild_indexes::<Feature>()?;
        let runs = store.rebuild_indexes::<Run>()?;
        info!(features, runs, "Rebuilt indexes");

        Ok(Self::spawn_with_store(store))
    }

    /// Spawn over an existing store (tests use in-memory stores)
    pub fn spawn_with_store(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| StateError::Channel)?;
        reply_rx.await.map_err(|_| StateError::Channel)?
    }

    // === Feature operations ===

    pub async fn create_feature(&self, feature: Feature) -> StateResponse<String> {
        debug!(id = %feature.id, "create_feature");
        self.send(|reply| StateCommand::CreateFeature { feature, reply }).await
    }

    pub async fn get_feature(&self, id: &str) -> StateResponse<Option<Feature>> {
        let id = id.to_string();
        self.send(|reply| StateCommand::GetFeature { id, reply }).await
    }

    pub async fn get_feature_required(&self, id: &str) -> Result<Feature, StateError> {
        self.get_feature(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("Feature {}", id)))
    }

    pub async fn list_features(
        &self,
        project: Option<String>,
        status: Option<FeatureStatus>,
    ) -> StateResponse<Vec<Feature>> {
        self.send(|reply| StateCommand::ListFeatures { project, status, reply })
            .await
    }

    /// Atomically claim a pending feature for a new attempt
    pub async fn claim_feature(&self, id: &str) -> StateResponse<Option<Feature>> {
        let id = id.to_string();
        self.send(|reply| StateCommand::ClaimFeature { id, reply }).await
    }

    pub async fn bind_sandbox(&self, id: &str, path: &str, branch: &str) -> StateResponse<()> {
        let (id, path, branch) = (id.to_string(), path.to_string(), branch.to_string());
        self.send(|reply| StateCommand::BindSandbox { id, path, branch, reply })
            .await
    }

    pub async fn mark_review(&self, id: &str) -> StateResponse<()> {
        let id = id.to_string();
        self.send(|reply| StateCommand::MarkReview { id, reply }).await
    }

    pub async fn mark_in_progress(&self, id: &str) -> StateResponse<()> {
        let id = id.to_string();
        self.send(|reply| StateCommand::MarkInProgress { id, reply }).await
    }

    /// Increment the code-validate iteration counter; returns the new value
    pub async fn bump_iteration(&self, id: &str) -> StateResponse<u32> {
        let id = id.to_string();
        self.send(|reply| StateCommand::BumpIteration { id, reply }).await
    }

    pub async fn complete_feature(&self, id: &str) -> StateResponse<()> {
        let id = id.to_string();
        self.send(|reply| StateCommand::CompleteFeature { id, reply }).await
    }

    pub async fn fail_feature(&self, id: &str, error: &str) -> StateResponse<()> {
        let (id, error) = (id.to_string(), error.to_string());
        self.send(|reply| StateCommand::FailFeature { id, error, reply }).await
    }

    pub async fn escalate_conflict(&self, id: &str) -> StateResponse<()> {
        let id = id.to_string();
        self.send(|reply| StateCommand::EscalateConflict { id, reply }).await
    }

    pub async fn reset_for_retry(&self, id: &str) -> StateResponse<()> {
        let id = id.to_string();
        self.send(|reply| StateCommand::ResetForRetry { id, reply }).await
    }

    // === Run history ===

    pub async fn create_run(&self, run: Run) -> StateResponse<String> {
        self.send(|reply| StateCommand::CreateRun { run, reply }).await
    }

    pub async fn update_run(&self, run: Run) -> StateResponse<()> {
        self.send(|reply| StateCommand::UpdateRun { run, reply }).await
    }

    pub async fn list_runs(&self, feature: &str) -> StateResponse<Vec<Run>> {
        let feature = feature.to_string();
        self.send(|reply| StateCommand::ListRuns { feature, reply }).await
    }

    // === Checkpoints ===

    pub async fn create_checkpoint(&self, checkpoint: Checkpoint) -> StateResponse<String> {
        self.send(|reply| StateCommand::CreateCheckpoint { checkpoint, reply })
            .await
    }

    pub async fn list_checkpoints(&self, feature: &str) -> StateResponse<Vec<Checkpoint>> {
        let feature = feature.to_string();
        self.send(|reply| StateCommand::ListCheckpoints { feature, reply }).await
    }

    /// Shut down the actor
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StateCommand::Shutdown).await;
    }
}

/// The actor loop: owns the store, processes commands in order
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            StateCommand::CreateFeature { feature, reply } => {
                let id = feature.id.clone();
                let result = store.create(&feature).map(|_| id).map_err(Into::into);
                let _ = reply.send(result);
            }
            StateCommand::GetFeature { id, reply } => {
                let _ = reply.send(store.get::<Feature>(&id).map_err(Into::into));
            }
            StateCommand::ListFeatures { project, status, reply } => {
                let mut filters = Vec::new();
                if let Some(project) = project {
                    filters.push(Filter::eq("project", project));
                }
                if let Some(status) = status {
                    filters.push(Filter::eq("status", status.to_string()));
                }
                let _ = reply.send(store.list::<Feature>(&filters).map_err(Into::into));
            }
            StateCommand::ClaimFeature { id, reply } => {
                let result = mutate(&mut store, &id, |feature| {
                    if feature.status != FeatureStatus::Pending {
                        return None;
                    }
                    feature.begin_attempt();
                    Some(())
                });
                let _ = reply.send(result.map(|opt| opt.map(|(f, ())| f)));
            }
            StateCommand::BindSandbox { id, path, branch, reply } => {
                let _ = reply.send(require(mutate(&mut store, &id, |feature| {
                    feature.bind_sandbox(path.clone(), branch.clone());
                    Some(())
                }), &id, "bind sandbox"));
            }
            StateCommand::MarkReview { id, reply } => {
                let _ = reply.send(require(mutate(&mut store, &id, |feature| {
                    if feature.status != FeatureStatus::InProgress {
                        return None;
                    }
                    feature.set_status(FeatureStatus::Review);
                    Some(())
                }), &id, "in_progress -> review"));
            }
            StateCommand::MarkInProgress { id, reply } => {
                let _ = reply.send(require(mutate(&mut store, &id, |feature| {
                    if feature.status != FeatureStatus::Review {
                        return None;
                    }
                    feature.set_status(FeatureStatus::InProgress);
                    Some(())
                }), &id, "review -> in_progress"));
            }
            StateCommand::BumpIteration { id, reply } => {
                let result = mutate(&mut store, &id, |feature| {
                    feature.iteration += 1;
                    feature.updated_at = unitstore::now_ms();
                    Some(feature.iteration)
                });
                let _ = reply.send(require(result, &id, "bump iteration"));
            }
            StateCommand::CompleteFeature { id, reply } => {
                let _ = reply.send(require(mutate(&mut store, &id, |feature| {
                    if feature.is_terminal() {
                        return None;
                    }
                    feature.set_status(FeatureStatus::Completed);
                    feature.completed_at = Some(unitstore::now_ms());
                    feature.clear_sandbox();
                    Some(())
                }), &id, "complete"));
            }
            StateCommand::FailFeature { id, error, reply } => {
                let _ = reply.send(require(mutate(&mut store, &id, |feature| {
                    if feature.is_terminal() {
                        return None;
                    }
                    feature.set_error(error.clone());
                    feature.set_status(FeatureStatus::Failed);
                    Some(())
                }), &id, "fail"));
            }
            StateCommand::EscalateConflict { id, reply } => {
                let _ = reply.send(require(mutate(&mut store, &id, |feature| {
                    if feature.status != FeatureStatus::Review {
                        return None;
                    }
                    feature.conflict_escalated = true;
                    feature.updated_at = unitstore::now_ms();
                    Some(())
                }), &id, "escalate conflict"));
            }
            StateCommand::ResetForRetry { id, reply } => {
                let _ = reply.send(require(mutate(&mut store, &id, |feature| {
                    if feature.status != FeatureStatus::Failed {
                        return None;
                    }
                    feature.reset_for_retry();
                    Some(())
                }), &id, "failed -> pending"));
            }
            StateCommand::CreateRun { run, reply } => {
                let id = run.id.clone();
                let _ = reply.send(store.create(&run).map(|_| id).map_err(Into::into));
            }
            StateCommand::UpdateRun { run, reply } => {
                let _ = reply.send(store.update(&run).map_err(Into::into));
            }
            StateCommand::ListRuns { feature, reply } => {
                let filters = [Filter::eq("feature", feature)];
                let _ = reply.send(store.list::<Run>(&filters).map_err(Into::into));
            }
            StateCommand::CreateCheckpoint { checkpoint, reply } => {
                let id = checkpoint.id.clone();
                let _ = reply.send(store.create(&checkpoint).map(|_| id).map_err(Into::into));
            }
            StateCommand::ListCheckpoints { feature, reply } => {
                let filters = [Filter::eq("feature", feature)];
                let _ = reply.send(store.list::<Checkpoint>(&filters).map_err(Into::into));
            }
            StateCommand::Shutdown => {
                debug!("StateManager shutting down");
                break;
            }
        }
    }
    warn!("StateManager actor loop exited");
}

/// Read-modify-write one feature inside the actor. Returns Ok(None) if the
/// record is missing or the mutator declined the transition.
fn mutate<T>(
    store: &mut Store,
    id: &str,
    f: impl FnOnce(&mut Feature) -> Option<T>,
) -> StateResponse<Option<(Feature, T)>> {
    let Some(mut feature) = store.get::<Feature>(id)? else {
        return Ok(None);
    };
    match f(&mut feature) {
        Some(value) => {
            store.update(&feature)?;
            Ok(Some((feature, value)))
        }
        None => Ok(None),
    }
}

/// Collapse a declined mutation into an InvalidTransition error
fn require<T>(
    result: StateResponse<Option<(Feature, T)>>,
    id: &str,
    what: &str,
) -> StateResponse<T> {
    match result? {
        Some((_, value)) => Ok(value),
        None => Err(StateError::InvalidTransition {
            id: id.to_string(),
            reason: what.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(id: &str) -> Feature {
        Feature::with_id(id, "proj", id)
    }

    async fn spawn_manager() -> StateManager {
        StateManager::spawn_with_store(Store::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let state = spawn_manager().await;
        state.create_feature(feature("f-1")).await.unwrap();
        state.create_feature(feature("f-2")).await.unwrap();

        let got = state.get_feature("f-1").await.unwrap().unwrap();
        assert_eq!(got.id, "f-1");

        let all = state.list_features(Some("proj".to_string()), None).await.unwrap();
        assert_eq!(all.len(), 2);

        let pending = state
            .list_features(None, Some(FeatureStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let state = spawn_manager().await;
        state.create_feature(feature("f-1")).await.unwrap();

        let first = state.claim_feature("f-1").await.unwrap();
        assert!(first.is_some());
        let claimed = first.unwrap();
        assert_eq!(claimed.status, FeatureStatus::InProgress);
        assert_eq!(claimed.attempt, 1);

        // Second claim must see the InProgress status and decline
        let second = state.claim_feature("f-1").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_one_winner() {
        let state = spawn_manager().await;
        state.create_feature(feature("f-1")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                state.claim_feature("f-1").await.unwrap().is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let state = spawn_manager().await;
        state.create_feature(feature("f-1")).await.unwrap();
        state.claim_feature("f-1").await.unwrap().unwrap();

        assert_eq!(state.bump_iteration("f-1").await.unwrap(), 1);
        assert_eq!(state.bump_iteration("f-1").await.unwrap(), 2);

        state.mark_review("f-1").await.unwrap();
        let f = state.get_feature_required("f-1").await.unwrap();
        assert_eq!(f.status, FeatureStatus::Review);

        // changes requested
        state.mark_in_progress("f-1").await.unwrap();
        state.mark_review("f-1").await.unwrap();

        state.complete_feature("f-1").await.unwrap();
        let f = state.get_feature_required("f-1").await.unwrap();
        assert_eq!(f.status, FeatureStatus::Completed);
        assert!(f.completed_at.is_some());
        assert!(f.sandbox_path.is_none());
    }

    #[tokio::test]
    async fn test_mark_review_requires_in_progress() {
        let state = spawn_manager().await;
        state.create_feature(feature("f-1")).await.unwrap();

        let result = state.mark_review("f-1").await;
        assert!(matches!(result, Err(StateError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_fail_and_retry_cycle() {
        let state = spawn_manager().await;
        state.create_feature(feature("f-1")).await.unwrap();
        state.claim_feature("f-1").await.unwrap().unwrap();
        state.bind_sandbox("f-1", "/tmp/sb", "orchd/f-1").await.unwrap();

        state.fail_feature("f-1", "validator crashed").await.unwrap();
        let f = state.get_feature_required("f-1").await.unwrap();
        assert_eq!(f.status, FeatureStatus::Failed);
        assert_eq!(f.last_error.as_deref(), Some("validator crashed"));

        state.reset_for_retry("f-1").await.unwrap();
        let f = state.get_feature_required("f-1").await.unwrap();
        assert_eq!(f.status, FeatureStatus::Pending);
        assert!(f.sandbox_path.is_none());
        assert_eq!(f.attempt, 1);

        // Next claim increments the attempt counter visibly
        let claimed = state.claim_feature("f-1").await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 2);
    }

    #[tokio::test]
    async fn test_terminal_states_locked() {
        let state = spawn_manager().await;
        state.create_feature(feature("f-1")).await.unwrap();
        state.claim_feature("f-1").await.unwrap().unwrap();
        state.complete_feature("f-1").await.unwrap();

        assert!(matches!(
            state.fail_feature("f-1", "late failure").await,
            Err(StateError::InvalidTransition { .. })
        ));
        assert!(matches!(
            state.complete_feature("f-1").await,
            Err(StateError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_escalate_conflict_holds_review() {
        let state = spawn_manager().await;
        state.create_feature(feature("f-1")).await.unwrap();
        state.claim_feature("f-1").await.unwrap().unwrap();
        state.mark_review("f-1").await.unwrap();

        state.escalate_conflict("f-1").await.unwrap();
        let f = state.get_feature_required("f-1").await.unwrap();
        assert_eq!(f.status, FeatureStatus::Review);
        assert!(f.conflict_escalated);
    }

    #[tokio::test]
    async fn test_run_history() {
        let state = spawn_manager().await;
        let mut run = Run::open("proj", "f-1", "coder");
        state.create_run(run.clone()).await.unwrap();

        run.close(crate::domain::RunStatus::Success, serde_json::json!({"notes": "done"}));
        state.update_run(run).await.unwrap();

        let runs = state.list_runs("f-1").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].is_closed());
    }

    #[tokio::test]
    async fn test_checkpoints() {
        let state = spawn_manager().await;
        state
            .create_checkpoint(Checkpoint::observe("proj", "f-1", "abc"))
            .await
            .unwrap();
        state
            .create_checkpoint(Checkpoint::observe("proj", "f-1", "def"))
            .await
            .unwrap();

        let ckpts = state.list_checkpoints("f-1").await.unwrap();
        assert_eq!(ckpts.len(), 2);
    }

    #[tokio::test]
    async fn test_get_feature_required_missing() {
        let state = spawn_manager().await;
        let result = state.get_feature_required("ghost").await;
        assert!(matches!(result, Err(StateError::NotFound(_))));
    }
}
