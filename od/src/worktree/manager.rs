//! Worktree manager for creating, merging, and cleaning up sandboxes

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::merge::{self, MergeResult, MergeStats};

/// Error types for sandbox operations
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Failed to create sandbox: {0}")]
    CreateFailed(String),

    /// Names derive deterministically from the feature id, so a collision
    /// means a sandbox leaked from a previous crash. Surfaced, not reused.
    #[error("Sandbox collision for {0}: directory or branch already exists")]
    Collision(String),

    #[error("Failed to remove sandbox: {0}")]
    RemoveFailed(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Git command failed: {0}")]
    Git(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the worktree manager
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Base directory for sandboxes
    #[serde(rename = "base-dir")]
    pub base_dir: PathBuf,

    /// Path to the trunk repository
    #[serde(rename = "repo-root")]
    pub repo_root: PathBuf,

    /// Branch prefix for sandbox branches
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,

    /// Trunk branch name
    pub trunk: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/orchd/sandboxes"),
            repo_root: PathBuf::from("."),
            branch_prefix: "orchd".to_string(),
            trunk: "main".to_string(),
        }
    }
}

/// An isolated, independently committable copy of the trunk history,
/// bound 1:1 to an active feature
#[derive(Debug, Clone)]
pub struct Sandbox {
    /// Feature this sandbox belongs to
    pub feature_id: String,

    /// Working directory
    pub path: PathBuf,

    /// Branch name
    pub branch: String,
}

/// Manager for sandbox worktrees
///
/// Holds the global merge lock: trunk is mutated only inside [`Self::merge`],
/// one caller at a time.
pub struct WorktreeManager {
    config: WorktreeConfig,
    merge_lock: Mutex<()>,
    merges_in_flight: AtomicUsize,
    peak_merges: AtomicUsize,
    total_merges: AtomicU64,
    total_conflicts: AtomicU64,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        Self {
            config,
            merge_lock: Mutex::new(()),
            merges_in_flight: AtomicUsize::new(0),
            peak_merges: AtomicUsize::new(0),
            total_merges: AtomicU64::new(0),
            total_conflicts: AtomicU64::new(0),
        }
    }

    /// Deterministic sandbox handle for a feature id
    pub fn sandbox_for(&self, feature_id: &str) -> Sandbox {
        Sandbox {
            feature_id: feature_id.to_string(),
            path: self.config.base_dir.join(feature_id),
            branch: format!("{}/{}", self.config.branch_prefix, feature_id),
        }
    }

    /// Create a sandbox: a new branch from the trunk tip plus a worktree
    /// bound to it
    pub async fn create(&self, feature_id: &str) -> Result<Sandbox, SandboxError> {
        let sandbox = self.sandbox_for(feature_id);

        if let Err(e) = tokio::fs::create_dir_all(&self.config.base_dir).await {
            return Err(SandboxError::CreateFailed(format!("base dir: {}", e)));
        }

        if sandbox.path.exists() || self.branch_exists(&sandbox.branch).await? {
            return Err(SandboxError::Collision(feature_id.to_string()));
        }

        let output = Command::new("git")
            .args([
                "worktree",
                "add",
                sandbox.path.to_string_lossy().as_ref(),
                "-b",
                &sandbox.branch,
                &self.config.trunk,
            ])
            .current_dir(&self.config.repo_root)
            .output()
            .await
            .map_err(|e| SandboxError::Git(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::CreateFailed(stderr.to_string()));
        }

        info!(feature = %feature_id, path = %sandbox.path.display(), branch = %sandbox.branch, "Created sandbox");
        Ok(sandbox)
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, SandboxError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .current_dir(&self.config.repo_root)
            .output()
            .await
            .map_err(|e| SandboxError::Git(e.to_string()))?;
        Ok(output.status.success())
    }

    /// Merge a sandbox into trunk
    ///
    /// Serialized across all features by the global merge lock. On a clean
    /// merge the sandbox is destroyed; on conflict trunk is left untouched
    /// and the sandbox retained so the caller can attempt resolution.
    pub async fn merge(&self, sandbox: &Sandbox) -> Result<MergeResult, SandboxError> {
        let _guard = self.merge_lock.lock().await;

        let holders = self.merges_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_merges.fetch_max(holders, Ordering::SeqCst);

        let result = merge::merge_branch(
            &self.config.repo_root,
            &sandbox.path,
            &sandbox.branch,
            &self.config.trunk,
            &format!("Merge {}", sandbox.feature_id),
        )
        .await;

        self.merges_in_flight.fetch_sub(1, Ordering::SeqCst);

        match &result {
            Ok(MergeResult::Clean) => {
                self.total_merges.fetch_add(1, Ordering::SeqCst);
                info!(feature = %sandbox.feature_id, "Merged to trunk");
                // Sandbox destroyed only after a clean merge
                self.discard(sandbox, false).await?;
            }
            Ok(MergeResult::Conflict { files }) => {
                self.total_conflicts.fetch_add(1, Ordering::SeqCst);
                warn!(feature = %sandbox.feature_id, ?files, "Merge conflict, trunk unchanged");
            }
            Err(_) => {}
        }

        result
    }

    /// Remove a sandbox without merging, or retain it for postmortem
    pub async fn discard(&self, sandbox: &Sandbox, retain: bool) -> Result<(), SandboxError> {
        if retain {
            info!(feature = %sandbox.feature_id, path = %sandbox.path.display(), "Retaining sandbox for inspection");
            return Ok(());
        }

        if !sandbox.path.exists() {
            debug!(feature = %sandbox.feature_id, "Sandbox already gone, skipping removal");
        } else {
            let output = Command::new("git")
                .args([
                    "worktree",
                    "remove",
                    sandbox.path.to_string_lossy().as_ref(),
                    "--force",
                ])
                .current_dir(&self.config.repo_root)
                .output()
                .await
                .map_err(|e| SandboxError::Git(e.to_string()))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("is not a working tree") {
                    return Err(SandboxError::RemoveFailed(stderr.to_string()));
                }
            }
        }

        // Delete the branch; ignore failure if it was merged away already
        let _ = Command::new("git")
            .args(["branch", "-D", &sandbox.branch])
            .current_dir(&self.config.repo_root)
            .output()
            .await;

        info!(feature = %sandbox.feature_id, "Removed sandbox");
        Ok(())
    }

    /// Head commit id of a working directory
    pub async fn head(&self, path: &std::path::Path) -> Result<String, SandboxError> {
        if !path.exists() {
            return Err(SandboxError::NotFound(path.display().to_string()));
        }
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(path)
            .output()
            .await
            .map_err(|e| SandboxError::Git(e.to_string()))?;

        if !output.status.success() {
            return Err(SandboxError::Git(String::from_utf8_lossy(&output.stderr).to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Check if a sandbox directory exists
    pub fn exists(&self, feature_id: &str) -> bool {
        self.config.base_dir.join(feature_id).exists()
    }

    /// List sandboxes present on disk
    pub async fn list(&self) -> Result<Vec<Sandbox>, SandboxError> {
        let mut sandboxes = Vec::new();
        if !self.config.base_dir.exists() {
            return Ok(sandboxes);
        }

        let mut entries = tokio::fs::read_dir(&self.config.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                sandboxes.push(self.sandbox_for(name));
            }
        }

        Ok(sandboxes)
    }

    /// Remove sandboxes that no live feature owns (crash leftovers)
    pub async fn cleanup_orphaned(&self, active_ids: &[String]) -> Result<usize, SandboxError> {
        let mut cleaned = 0;
        for sandbox in self.list().await? {
            if !active_ids.contains(&sandbox.feature_id) {
                info!(feature = %sandbox.feature_id, "Cleaning up orphaned sandbox");
                if let Err(e) = self.discard(&sandbox, false).await {
                    warn!(feature = %sandbox.feature_id, error = %e, "Failed to remove orphaned sandbox");
                } else {
                    cleaned += 1;
                }
            }
        }
        Ok(cleaned)
    }

    /// Merge statistics (the peak holder count backs the serialization
    /// invariant in tests)
    pub fn merge_stats(&self) -> MergeStats {
        MergeStats {
            total_merges: self.total_merges.load(Ordering::SeqCst),
            total_conflicts: self.total_conflicts.load(Ordering::SeqCst),
            peak_concurrent: self.peak_merges.load(Ordering::SeqCst),
        }
    }
}
