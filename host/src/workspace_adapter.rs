//! Git-worktree-backed `WorkspaceAdapter`.
//!
//! Grounded on `core/worktree_manager.rs::WorktreeManager` — deterministic,
//! hash-derived paths under an XDG data dir, create/remove via `git
//! worktree add`/`remove` — generalized to the full adapter lifecycle
//! (`create`/`commit`/`merge`/`destroy`) the orchestrator needs, using
//! `foreman_core::workspace`'s `repo_hash`/`sanitize_branch`/
//! `workspace_base_dir` helpers so path derivation matches what `core`
//! already documents and tests.

use std::path::PathBuf;

use foreman_core::error::WorkspaceError;
use foreman_core::workspace::{
    repo_hash, sanitize_branch, workspace_base_dir, WorkspaceAdapter, WorkspaceHandle, WorkspaceState,
};

use crate::git::{Git, GitError};

/// One adapter per repository; `create` is called once per orchestration
/// unit and derives an independent worktree path from the unit's branch
/// name, so a single adapter instance is shared across all units of one
/// orchestration (and safely across orchestrations too, since paths never
/// collide).
pub struct GitWorkspaceAdapter {
    repo_path: PathBuf,
    base_dir_override: Option<PathBuf>,
}

impl GitWorkspaceAdapter {
    pub fn new(repo_path: PathBuf, base_dir_override: Option<PathBuf>) -> Self {
        Self {
            repo_path,
            base_dir_override,
        }
    }

    fn worktree_path(&self, branch: &str) -> PathBuf {
        let hash = repo_hash(&self.repo_path);
        let sanitized = sanitize_branch(branch);
        workspace_base_dir(self.base_dir_override.as_deref())
            .join(hash)
            .join(sanitized)
    }
}

impl WorkspaceAdapter for GitWorkspaceAdapter {
    /// Creates a new branch off `base_branch` and checks it out into a
    /// fresh worktree. Rejects with `CreateFailed` if `task_branch` is
    /// already checked out elsewhere, matching the `BranchAlreadyCheckedOut`
    /// guard.
    async fn create(&self, base_branch: &str, task_branch: &str) -> Result<WorkspaceHandle, WorkspaceError> {
        let git = Git::new(&self.repo_path);

        let existing = git
            .run(&["worktree", "list", "--porcelain"])
            .await
            .map_err(map_err)?;
        if existing
            .stdout
            .lines()
            .any(|l| l == format!("branch refs/heads/{task_branch}"))
        {
            return Err(WorkspaceError::CreateFailed(format!(
                "branch '{task_branch}' is already checked out in another worktree"
            )));
        }

        let path = self.worktree_path(task_branch);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;
        }
        let path_str = path.to_string_lossy().into_owned();

        git.run(&["worktree", "add", "-b", task_branch, &path_str, base_branch])
            .await
            .map_err(map_err)?;

        Ok(WorkspaceHandle {
            id: task_branch.to_string(),
            path,
            branch: task_branch.to_string(),
            state: WorkspaceState::Created,
        })
    }

    /// Stages and commits every change in the worktree. A clean worktree
    /// (nothing to commit) is treated as success, not a failure, since a
    /// unit that produced no file changes is still a valid outcome.
    async fn commit(&self, handle: &WorkspaceHandle, message: &str) -> Result<(), WorkspaceError> {
        let git = Git::new(&handle.path);

        let status = git.run(&["status", "--porcelain"]).await.map_err(map_err)?;
        if status.stdout.trim().is_empty() {
            return Ok(());
        }

        git.run(&["add", "-A"]).await.map_err(map_err)?;
        git.run(&["commit", "-m", message])
            .await
            .map_err(|e| WorkspaceError::CommitFailed(e.to_string()))?;
        Ok(())
    }

    /// Checks out `into` in the main repository and merges `handle.branch`
    /// with `--no-ff`, so every merged unit leaves a dedicated merge commit
    /// in history. A `CONFLICT` marker in the merge output is reported as
    /// `WorkspaceError::Conflict`; the orchestrator treats that as
    /// `NeedsResolution` rather than retrying.
    async fn merge(&self, handle: &WorkspaceHandle, into: &str) -> Result<(), WorkspaceError> {
        let git = Git::new(&self.repo_path);

        git.run(&["checkout", into]).await.map_err(|e| match e {
            GitError::CommandFailed { stderr, .. } => WorkspaceError::MergeFailed(stderr),
            other => WorkspaceError::BackendUnavailable(other.to_string()),
        })?;

        git.run(&["merge", "--no-ff", "-m", &format!("merge {}", handle.branch), &handle.branch])
            .await
            .map_err(|e| match e {
                GitError::CommandFailed { conflict: true, stderr, .. } => WorkspaceError::Conflict(stderr),
                GitError::CommandFailed { stderr, .. } => WorkspaceError::MergeFailed(stderr),
                other => WorkspaceError::BackendUnavailable(other.to_string()),
            })?;

        Ok(())
    }

    /// Force-removes the worktree, prunes stale refs, and cleans up the
    /// now-empty parent directory (ignored if non-empty).
    async fn destroy(&self, handle: &WorkspaceHandle) -> Result<(), WorkspaceError> {
        let git = Git::new(&self.repo_path);
        let path_str = handle.path.to_string_lossy().into_owned();

        git.run(&["worktree", "remove", "--force", &path_str])
            .await
            .map_err(|e| WorkspaceError::DestroyFailed(e.to_string()))?;
        git.run(&["worktree", "prune"]).await.map_err(|e| WorkspaceError::DestroyFailed(e.to_string()))?;

        if let Some(parent) = handle.path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

fn map_err(e: GitError) -> WorkspaceError {
    match e {
        GitError::GitNotFound => WorkspaceError::BackendUnavailable(e.to_string()),
        GitError::TimedOut(_) => WorkspaceError::BackendUnavailable(e.to_string()),
        GitError::CommandFailed { stderr, .. } => WorkspaceError::CreateFailed(stderr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    async fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let dir_path = dir.path().to_path_buf();
            let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            async move {
                Command::new("git")
                    .arg("-C")
                    .arg(&dir_path)
                    .args(&args)
                    .output()
                    .await
                    .unwrap();
            }
        };
        run(&["init", "-b", "main"]).await;
        run(&["config", "user.email", "test@example.com"]).await;
        run(&["config", "user.name", "Test"]).await;
        tokio::fs::write(dir.path().join("README.md"), "hello").await.unwrap();
        run(&["add", "-A"]).await;
        run(&["commit", "-m", "initial"]).await;
        dir
    }

    #[tokio::test]
    async fn create_checks_out_new_branch_in_isolated_worktree() {
        let repo = init_repo().await;
        let base_dir = tempfile::tempdir().unwrap();
        let adapter = GitWorkspaceAdapter::new(repo.path().to_path_buf(), Some(base_dir.path().to_path_buf()));

        let handle = adapter.create("main", "unit-1").await.unwrap();
        assert!(handle.path.exists());
        assert_eq!(handle.branch, "unit-1");
    }

    #[tokio::test]
    async fn commit_is_a_noop_on_clean_worktree() {
        let repo = init_repo().await;
        let base_dir = tempfile::tempdir().unwrap();
        let adapter = GitWorkspaceAdapter::new(repo.path().to_path_buf(), Some(base_dir.path().to_path_buf()));

        let handle = adapter.create("main", "unit-2").await.unwrap();
        adapter.commit(&handle, "no changes").await.unwrap();
    }

    #[tokio::test]
    async fn commit_and_merge_round_trip() {
        let repo = init_repo().await;
        let base_dir = tempfile::tempdir().unwrap();
        let adapter = GitWorkspaceAdapter::new(repo.path().to_path_buf(), Some(base_dir.path().to_path_buf()));

        let handle = adapter.create("main", "unit-3").await.unwrap();
        tokio::fs::write(handle.path.join("feature.txt"), "feature").await.unwrap();
        adapter.commit(&handle, "add feature").await.unwrap();
        adapter.merge(&handle, "main").await.unwrap();

        assert!(repo.path().join("feature.txt").exists());
    }
}
