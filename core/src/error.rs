//! Error taxonomy for the supervision engine.
//!
//! Every fallible component gets its own `thiserror`-derived enum, mirroring
//! the split between `PtyError` and `GitError` in the system this crate is
//! descended from: a machine-readable discriminant plus a human-readable
//! message, with a custom `Serialize` impl so the error can cross the host
//! interface boundary as plain JSON.

use serde::Serialize;
use std::fmt;

/// Machine-readable discriminant for `PtyError`, serialized alongside the
/// message so callers across the host interface can match on it.
#[derive(Debug, Clone, Serialize)]
pub enum PtyErrorCode {
    SpawnFailed,
    ExecutionNotFound,
    WriteFailed,
    ResizeFailed,
    KillFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PtyError {
    pub code: PtyErrorCode,
    pub message: String,
}

impl fmt::Display for PtyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for PtyError {}

impl PtyError {
    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::SpawnFailed,
            message: msg.into(),
        }
    }

    pub fn execution_not_found(id: impl fmt::Display) -> Self {
        Self {
            code: PtyErrorCode::ExecutionNotFound,
            message: format!("execution {id} not found"),
        }
    }

    pub fn write_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::WriteFailed,
            message: msg.into(),
        }
    }

    pub fn resize_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::ResizeFailed,
            message: msg.into(),
        }
    }

    pub fn kill_failed(msg: impl Into<String>) -> Self {
        Self {
            code: PtyErrorCode::KillFailed,
            message: msg.into(),
        }
    }
}

/// Errors raised by the pattern scanner.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScannerError {
    #[error("invalid rule pattern for {rule_id}: {message}")]
    InvalidRule { rule_id: String, message: String },
}

impl Serialize for ScannerError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Errors raised by the hook orchestrator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HookError {
    #[error("hook '{hook}' vetoed phase {phase}: {reason}")]
    Veto {
        hook: String,
        phase: String,
        reason: String,
    },
    #[error("hook '{hook}' exceeded its time budget ({budget_ms}ms) in phase {phase}")]
    BudgetExceeded {
        hook: String,
        phase: String,
        budget_ms: u64,
    },
}

impl Serialize for HookError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Error taxonomy owned by the Supervisor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error("prompt rejected: {reason}")]
    InputError { reason: String },
    #[error("failed to start execution: {0}")]
    SpawnFailed(String),
    #[error("task is not running")]
    NotRunning,
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("output cap exceeded")]
    OutputOverflow,
    #[error("child produced no output within the idle limit")]
    ChildUnresponsive,
    #[error("controller exhausted escalation without success")]
    Unproductive,
    #[error("hook vetoed the operation: {0}")]
    HookVeto(#[from] HookError),
    #[error("adapter error: {0}")]
    AdapterError(String),
}

impl Serialize for SupervisorError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Errors raised by the multi-instance orchestrator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("units overlap in declared outputs: {0}")]
    OverlappingOutputs(String),
    #[error("orchestration not found: {0}")]
    NotFound(String),
    #[error("merge requires manual resolution: {0:?}")]
    MergeConflict(Vec<String>),
    #[error("not all units are terminal yet")]
    UnitsStillRunning,
    #[error("adapter error: {0}")]
    AdapterError(String),
}

impl Serialize for OrchestratorError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Errors raised by the event ledger.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to persist event: {0}")]
    PersistFailed(String),
    #[error("subscriber lagged and dropped {0} events")]
    Lagged(u64),
}

impl Serialize for LedgerError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Errors raised by a `WorkspaceAdapter` implementation (e.g. the
/// git-worktree-backed adapter in `host`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("failed to create workspace: {0}")]
    CreateFailed(String),
    #[error("failed to commit workspace: {0}")]
    CommitFailed(String),
    #[error("merge conflict: {0}")]
    Conflict(String),
    #[error("failed to merge workspace: {0}")]
    MergeFailed(String),
    #[error("failed to destroy workspace: {0}")]
    DestroyFailed(String),
}

impl Serialize for WorkspaceError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
