//! Thin async git subprocess runner.
//!
//! Grounded on `git/runner.rs::Git` — `-C <repo>` invocation,
//! `GIT_TERMINAL_PROMPT=0`/`LC_ALL=C` environment, `kill_on_drop(true)`, and
//! a 30s per-command timeout — reduced to the handful of subcommands the
//! workspace adapter actually needs (worktree lifecycle, commit, merge).

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Raised by `Git::run`. Kept local to this module (rather than reusing
/// `WorkspaceError` directly) since a `CommandFailed` here can map onto
/// different `WorkspaceError` variants depending on which operation the
/// caller was attempting — `workspace_adapter.rs` does that mapping.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GitError {
    #[error("git executable not found. Is git installed?")]
    GitNotFound,
    #[error("git command timed out: {0}")]
    TimedOut(String),
    #[error("git command failed: {command}: {stderr}")]
    CommandFailed {
        command: String,
        stderr: String,
        conflict: bool,
    },
}

/// Captured stdout/stderr from a completed git subprocess.
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Git command runner bound to one repository path.
#[derive(Debug, Clone)]
pub struct Git {
    repo_path: PathBuf,
}

impl Git {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    /// Runs a git subcommand. A `CONFLICT` marker anywhere in stdout or
    /// stderr is flagged on the returned error so callers can distinguish
    /// a merge conflict from an ordinary failure.
    pub async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .kill_on_drop(true);

        let command_str = format!("git -C {} {}", self.repo_path.display(), args.join(" "));

        let output = timeout(Duration::from_secs(30), cmd.output())
            .await
            .map_err(|_| GitError::TimedOut(command_str.clone()))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    GitError::GitNotFound
                } else {
                    GitError::CommandFailed {
                        command: command_str.clone(),
                        stderr: e.to_string(),
                        conflict: false,
                    }
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(GitOutput { stdout, stderr })
        } else {
            let conflict = stderr.contains("CONFLICT") || stdout.contains("CONFLICT");
            Err(GitError::CommandFailed {
                command: command_str,
                stderr: if stderr.trim().is_empty() { stdout.trim().to_string() } else { stderr.trim().to_string() },
                conflict,
            })
        }
    }

    pub async fn run_in(&self, path: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        Git::new(path).run(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_rejects_unknown_subcommand() {
        let dir = tempfile::tempdir().unwrap();
        Command::new("git").arg("-C").arg(dir.path()).arg("init").output().await.unwrap();
        let git = Git::new(dir.path());
        let result = git.run(&["not-a-real-subcommand"]).await;
        assert!(matches!(result, Err(GitError::CommandFailed { .. })));
    }

    #[tokio::test]
    async fn run_succeeds_for_status_in_fresh_repo() {
        let dir = tempfile::tempdir().unwrap();
        Command::new("git").arg("-C").arg(dir.path()).arg("init").output().await.unwrap();
        let git = Git::new(dir.path());
        let result = git.run(&["status", "--porcelain"]).await;
        assert!(result.is_ok());
    }
}
