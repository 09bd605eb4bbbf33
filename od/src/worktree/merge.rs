//! Git merge operations for completed features
//!
//! Fast-forwards or three-way-merges a sandbox branch into trunk. Conflict
//! handling is strictly non-destructive: the merge is aborted and trunk is
//! left exactly as it was.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, info};

use super::manager::SandboxError;

/// Result of a merge attempt
#[derive(Debug, Clone)]
pub enum MergeResult {
    /// Sandbox branch merged into trunk
    Clean,
    /// Conflicting files; trunk unchanged
    Conflict { files: Vec<String> },
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Merge statistics
#[derive(Debug, Clone, Default)]
pub struct MergeStats {
    pub total_merges: u64,
    pub total_conflicts: u64,
    /// Highest number of simultaneous merge-lock holders ever observed.
    /// Serialization holds iff this never exceeds 1.
    pub peak_concurrent: usize,
}

/// Merge a sandbox branch into trunk
///
/// Steps: commit any uncommitted worker changes in the sandbox, check out
/// trunk in the repo root, merge the branch with --no-ff. On conflict the
/// conflicting paths are collected and the merge aborted.
///
/// Callers must hold the global merge lock; this function assumes it has
/// exclusive access to the repo root.
pub(super) async fn merge_branch(
    repo_root: &Path,
    worktree_path: &Path,
    branch: &str,
    trunk: &str,
    message: &str,
) -> Result<MergeResult, SandboxError> {
    commit_pending(worktree_path).await?;

    let checkout = git(repo_root, &["checkout", trunk]).await?;
    if !checkout.status.success() {
        return Err(SandboxError::Git(format!(
            "checkout {} failed: {}",
            trunk,
            String::from_utf8_lossy(&checkout.stderr).trim()
        )));
    }

    let merge = git(repo_root, &["merge", "--no-ff", branch, "-m", message]).await?;
    if merge.status.success() {
        info!(%branch, %trunk, "Merge clean");
        return Ok(MergeResult::Clean);
    }

    let files = conflicted_files(repo_root).await?;
    if files.is_empty() {
        // Not a content conflict: propagate the git failure as-is
        return Err(SandboxError::Git(format!(
            "merge of {} failed: {}",
            branch,
            String::from_utf8_lossy(&merge.stderr).trim()
        )));
    }

    debug!(%branch, ?files, "Aborting conflicted merge");
    let abort = git(repo_root, &["merge", "--abort"]).await?;
    if !abort.status.success() {
        return Err(SandboxError::Git(format!(
            "merge --abort failed: {}",
            String::from_utf8_lossy(&abort.stderr).trim()
        )));
    }

    Ok(MergeResult::Conflict { files })
}

/// Commit any uncommitted changes the worker left in the sandbox
async fn commit_pending(worktree_path: &Path) -> Result<(), SandboxError> {
    let status = git(worktree_path, &["status", "--porcelain"]).await?;
    if status.stdout.is_empty() {
        return Ok(());
    }

    git(worktree_path, &["add", "-A"]).await?;
    let commit = git(worktree_path, &["commit", "-m", "worker changes"]).await?;
    if !commit.status.success() {
        return Err(SandboxError::Git(format!(
            "commit in sandbox failed: {}",
            String::from_utf8_lossy(&commit.stderr).trim()
        )));
    }
    Ok(())
}

/// Paths still unmerged in the repo root
async fn conflicted_files(repo_root: &Path) -> Result<Vec<String>, SandboxError> {
    let output = git(repo_root, &["diff", "--name-only", "--diff-filter=U"]).await?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

async fn git(dir: &Path, args: &[&str]) -> Result<std::process::Output, SandboxError> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| SandboxError::Git(e.to_string()))
}
