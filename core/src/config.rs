//! Process-wide configuration, loaded once at startup and threaded through
//! every component as an explicit dependency — no module-level singletons.
//!
//! Layering, low to high precedence: built-in defaults → optional TOML file
//! → `FOREMAN_*` environment variables.

use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Inclusive-exclusive millisecond range for the human-like inter-byte
/// input delay, serialized as a two-element array in config files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayRangeMs {
    pub min: u64,
    pub max: u64,
}

impl DelayRangeMs {
    pub fn as_range(&self) -> Range<u64> {
        self.min..self.max
    }
}

impl Default for DelayRangeMs {
    fn default() -> Self {
        Self { min: 40, max: 150 }
    }
}

/// `{gentle→firm, firm→forceful, forceful→unproductive}` timeouts for the
/// Intervention Controller's escalation ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub gentle_to_firm_secs: u64,
    pub firm_to_forceful_secs: u64,
    pub forceful_to_unproductive_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            gentle_to_firm_secs: 60,
            firm_to_forceful_secs: 60,
            forceful_to_unproductive_secs: 60,
        }
    }
}

/// How the Orchestrator resolves `merge()` across multiple units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    AutoIfNonconflicting,
    ManualAlways,
}

/// How the Orchestrator derives a batch's final state from per-unit results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    AllRequired,
    BestEffort,
}

/// The single process-wide configuration object. Effectively immutable
/// during a task's lifetime — changes take effect only at the next
/// `spawn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_parallel: usize,
    pub task_timeout_secs: u64,
    pub output_cap_bytes: usize,
    pub recent_buffer_bytes: usize,
    pub scanner_window_bytes: usize,
    pub intervention_cooldown_secs: u64,
    pub intervention_stage_timeouts: StageTimeouts,
    pub intervention_global_spacing_secs: u64,
    pub intervention_success_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub idle_limit_secs: u64,
    pub inter_byte_delay_ms: DelayRangeMs,
    pub allow_verbs: Vec<String>,
    pub deny_phrases: Vec<String>,
    pub merge_policy: MergePolicy,
    pub failure_policy: FailurePolicy,
    pub hook_time_budget_ms: u64,
    pub stream_overflow_grace_ms: u64,
    /// Whether the Monitor hook forwards every Stream-phase window to the
    /// Ledger as a `StreamChunk` event. Off by default; the Ledger already
    /// sees every state transition, so this is only useful for deep replay
    /// debugging and is noisy at scale.
    pub emit_stream_chunk_events: bool,
    pub match_context_bytes: usize,
    pub ledger_archive_dir: Option<PathBuf>,
    pub ledger_hard_cap: usize,
    pub workspace_base_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            task_timeout_secs: 10 * 60,
            output_cap_bytes: 16 * 1024 * 1024,
            recent_buffer_bytes: 2 * 1024 * 1024,
            scanner_window_bytes: 64 * 1024,
            intervention_cooldown_secs: 5,
            intervention_stage_timeouts: StageTimeouts::default(),
            intervention_global_spacing_secs: 5,
            intervention_success_secs: 90,
            heartbeat_interval_secs: 3 * 60,
            idle_limit_secs: 10 * 60,
            inter_byte_delay_ms: DelayRangeMs::default(),
            allow_verbs: default_allow_verbs(),
            deny_phrases: default_deny_phrases(),
            merge_policy: MergePolicy::AutoIfNonconflicting,
            failure_policy: FailurePolicy::AllRequired,
            hook_time_budget_ms: 50,
            stream_overflow_grace_ms: 200,
            emit_stream_chunk_events: false,
            match_context_bytes: 256,
            ledger_archive_dir: None,
            ledger_hard_cap: 100_000,
            workspace_base_dir: None,
        }
    }
}

fn default_allow_verbs() -> Vec<String> {
    [
        "create", "implement", "write", "add", "fix", "build", "refactor", "delete", "update",
        "rename", "move", "remove", "generate",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_deny_phrases() -> Vec<String> {
    [
        "what do you think",
        "let's discuss",
        "just research",
        "analyze only",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Config {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_limit(&self) -> Duration {
        Duration::from_secs(self.idle_limit_secs)
    }

    /// Loads configuration by layering an optional TOML file under
    /// `FOREMAN_*` environment variable overrides. Missing file paths are
    /// not an error — defaults apply.
    pub fn load(toml_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = match toml_path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
                toml::from_str(&raw)
                    .map_err(|e| ConfigError::Parse(path.display().to_string(), e.to_string()))?
            }
            _ => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_usize("FOREMAN_MAX_PARALLEL") {
            self.max_parallel = v;
        }
        if let Some(v) = env_u64("FOREMAN_TASK_TIMEOUT_SECS") {
            self.task_timeout_secs = v;
        }
        if let Some(v) = env_usize("FOREMAN_OUTPUT_CAP_BYTES") {
            self.output_cap_bytes = v;
        }
        if let Some(v) = env_usize("FOREMAN_SCANNER_WINDOW_BYTES") {
            self.scanner_window_bytes = v;
        }
        if let Some(v) = env_u64("FOREMAN_INTERVENTION_COOLDOWN_SECS") {
            self.intervention_cooldown_secs = v;
        }
        if let Ok(v) = std::env::var("FOREMAN_MERGE_POLICY") {
            self.merge_policy = match v.as_str() {
                "manual_always" => MergePolicy::ManualAlways,
                _ => MergePolicy::AutoIfNonconflicting,
            };
        }
        if let Ok(v) = std::env::var("FOREMAN_FAILURE_POLICY") {
            self.failure_policy = match v.as_str() {
                "best_effort" => FailurePolicy::BestEffort,
                _ => FailurePolicy::AllRequired,
            };
        }
        if let Ok(v) = std::env::var("FOREMAN_WORKSPACE_BASE_DIR") {
            self.workspace_base_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("FOREMAN_LEDGER_ARCHIVE_DIR") {
            self.ledger_archive_dir = Some(PathBuf::from(v));
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, String),
    #[error("failed to parse config file {0}: {1}")]
    Parse(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_enumerated_values() {
        let config = Config::default();
        assert_eq!(config.max_parallel, 5);
        assert_eq!(config.task_timeout_secs, 600);
        assert_eq!(config.output_cap_bytes, 16 * 1024 * 1024);
        assert_eq!(config.scanner_window_bytes, 64 * 1024);
        assert_eq!(config.inter_byte_delay_ms.min, 40);
        assert_eq!(config.inter_byte_delay_ms.max, 150);
    }

    #[test]
    fn env_override_wins_over_file_default() {
        std::env::set_var("FOREMAN_MAX_PARALLEL", "9");
        let config = Config::load(None).unwrap();
        assert_eq!(config.max_parallel, 9);
        std::env::remove_var("FOREMAN_MAX_PARALLEL");
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        std::fs::write(&path, "max_parallel = 2\ntask_timeout_secs = 30\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.max_parallel, 2);
        assert_eq!(config.task_timeout_secs, 30);
    }
}
