//! Workspace abstraction: an isolated filesystem checkout each task or
//! orchestration unit runs inside, with a small state machine and a
//! backend-agnostic trait.
//!
//! Grounded on `worktree_manager.rs`'s `WorktreeManager`: deterministic,
//! hash-derived paths under an XDG data dir, one worktree per branch. The
//! concrete git-backed implementation lives in `host` so `core` stays free
//! of any particular VCS dependency; this module only defines the seam.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::WorkspaceError;

/// Lifecycle of one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkspaceState {
    Created,
    Active,
    Committed,
    Merged,
    Destroyed,
}

/// Handle to one isolated workspace, independent of how it's backed.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceHandle {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    pub state: WorkspaceState,
}

/// Backend seam for workspace creation/teardown. Implemented concretely by
/// `GitWorkspaceAdapter` in `host`; `core` only depends on this trait so
/// the Supervisor and Orchestrator are backend-agnostic.
///
/// Uses native async-fn-in-traits rather than `async-trait`: every
/// concrete use in this crate is through a single generic parameter
/// (`Orchestrator<A: WorkspaceAdapter>`), so no vtable is needed.
pub trait WorkspaceAdapter: Send + Sync {
    async fn create(&self, base_branch: &str, task_branch: &str) -> Result<WorkspaceHandle, WorkspaceError>;
    async fn commit(&self, handle: &WorkspaceHandle, message: &str) -> Result<(), WorkspaceError>;
    async fn merge(&self, handle: &WorkspaceHandle, into: &str) -> Result<(), WorkspaceError>;
    async fn destroy(&self, handle: &WorkspaceHandle) -> Result<(), WorkspaceError>;
}

/// `SHA-256(canonicalized repo path)` truncated to 16 hex chars, matching
/// `worktree_manager.rs::repo_hash` exactly so existing on-disk worktrees
/// from a prior run remain addressable by the same path.
pub fn repo_hash(repo_path: &Path) -> String {
    let canonical = std::fs::canonicalize(repo_path).unwrap_or_else(|_| repo_path.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    format!("{digest:x}")[..16].to_string()
}

/// Replaces filesystem-unsafe characters in a branch name with hyphens.
pub fn sanitize_branch(branch: &str) -> String {
    if branch.is_empty() || branch == "." || branch == ".." {
        return "unnamed-branch".to_string();
    }
    branch
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            _ => c,
        })
        .collect()
}

/// Derives the workspace base directory under the platform's XDG/AppData
/// data dir, overridable via `Config::workspace_base_dir`.
pub fn workspace_base_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    directories::ProjectDirs::from("dev", "foreman", "foreman")
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".foreman-workspaces"))
        .join("workspaces")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_branch_replaces_unsafe_chars() {
        assert_eq!(sanitize_branch("feature/foo"), "feature-foo");
        assert_eq!(sanitize_branch(".."), "unnamed-branch");
        assert_eq!(sanitize_branch(""), "unnamed-branch");
    }

    #[test]
    fn repo_hash_is_stable_for_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = repo_hash(dir.path());
        let b = repo_hash(dir.path());
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn workspace_base_dir_honors_override() {
        let override_path = PathBuf::from("/tmp/custom-foreman");
        assert_eq!(workspace_base_dir(Some(&override_path)), override_path);
    }
}
