//! Supervises interactive LLM subprocesses under a PTY: scans their output
//! for toxic patterns (stalling, false completion, analysis paralysis) and
//! intervenes to force implementation over planning.

pub mod config;
pub mod controller;
pub mod error;
pub mod hooks;
pub mod ids;
pub mod ledger;
pub mod orchestrator;
pub mod pty;
pub mod scanner;
pub mod supervisor;
pub mod workspace;

pub use config::Config;
pub use error::{
    HookError, LedgerError, OrchestratorError, PtyError, ScannerError, SupervisorError, WorkspaceError,
};
pub use ids::{ExecutionId, OrchestrationId, TaskId, UnitId};
