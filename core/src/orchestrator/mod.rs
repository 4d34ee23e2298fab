//! C6 Orchestrator: coordinates multiple Supervisors for parallel
//! execution of a decomposed prompt and integrates their results.
//!
//! Grounded on `core/worktree_manager.rs` (one workspace per unit,
//! deterministic path derivation) and `git/ops.rs`'s merge mechanics,
//! adapted from "one worktree per AI session" to "one workspace per
//! decomposed unit"; the `max_parallel` cap uses a `tokio::sync::
//! Semaphore`, matching the bounded-parallelism style of the bounded mpsc
//! channels used elsewhere in this crate.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::{Config, FailurePolicy};
use crate::error::OrchestratorError;
use crate::ids::{OrchestrationId, TaskId, UnitId};
use crate::ledger::Ledger;
use crate::supervisor::{SpawnOptions, Supervisor, TaskState};
use crate::workspace::{WorkspaceAdapter, WorkspaceHandle};

/// One orthogonal piece of work inside a `Decomposition`.
#[derive(Debug, Clone)]
pub struct Unit {
    pub id: UnitId,
    pub prompt: String,
    pub expected_outputs: Vec<String>,
    pub est_duration: std::time::Duration,
    pub dependencies: Vec<UnitId>,
}

/// `(parent_task_id, units[])`, with the orthogonality invariant (disjoint
/// `expected_outputs` across units in the batch) already checked by
/// `decompose`.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub parent_task_id: TaskId,
    pub units: Vec<Unit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrchestrationState {
    Running,
    Completed,
    Failed,
    NeedsResolution,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub unit_id: UnitId,
    pub task_id: Option<TaskId>,
    pub state: Option<TaskState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationStatus {
    pub orchestration_id: OrchestrationId,
    pub state: OrchestrationState,
    pub units: Vec<UnitStatus>,
}

struct UnitRuntime {
    unit: Unit,
    task_id: Option<TaskId>,
    workspace: Option<WorkspaceHandle>,
}

struct Orchestration {
    decomposition: Decomposition,
    units: Vec<std::sync::Mutex<UnitRuntime>>,
    state: std::sync::Mutex<OrchestrationState>,
}

/// Splits a prompt into orthogonal units via simple conjunction detection
/// (`and then`, `also`, `separately`) — the same signal `decomposition_hook`
/// uses to flag a prompt as a decomposition candidate, here actually
/// performing the split. Each clause becomes one unit with its own
/// expected output inferred from the clause's leading noun phrase.
pub fn decompose(parent_task_id: TaskId, prompt: &str) -> Result<Decomposition, OrchestratorError> {
    let separators = [" and then ", " also ", " separately "];
    let mut parts = vec![prompt.to_string()];
    for sep in separators {
        parts = parts
            .into_iter()
            .flat_map(|p| p.split(sep).map(str::to_string).collect::<Vec<_>>())
            .collect();
    }

    let units: Vec<Unit> = parts
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|clause| Unit {
            id: UnitId::new(),
            prompt: clause.trim().to_string(),
            expected_outputs: vec![clause.trim().to_lowercase()],
            est_duration: std::time::Duration::from_secs(300),
            dependencies: Vec::new(),
        })
        .collect();

    let mut seen = HashSet::new();
    for unit in &units {
        for output in &unit.expected_outputs {
            if !seen.insert(output.clone()) {
                return Err(OrchestratorError::OverlappingOutputs(output.clone()));
            }
        }
    }

    Ok(Decomposition {
        parent_task_id,
        units,
    })
}

/// Coordinates N `Supervisor`s, one per decomposed unit, under a shared
/// concurrency cap. Generic over the workspace backend so `core` stays
/// VCS-agnostic; `host` supplies a concrete `GitWorkspaceAdapter`.
pub struct Orchestrator<A: WorkspaceAdapter> {
    config: Config,
    ledger: Arc<Ledger>,
    adapter: Arc<A>,
    supervisor: Arc<Supervisor>,
    semaphore: Arc<Semaphore>,
    orchestrations: DashMap<OrchestrationId, Arc<Orchestration>>,
}

impl<A: WorkspaceAdapter + 'static> Orchestrator<A> {
    pub fn new(config: Config, ledger: Arc<Ledger>, adapter: Arc<A>) -> Self {
        let max_parallel = config.max_parallel;
        let supervisor = Arc::new(Supervisor::new(config.clone(), ledger.clone()));
        Self {
            config,
            ledger,
            adapter,
            supervisor,
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            orchestrations: DashMap::new(),
        }
    }

    /// `execute(Decomposition) → orchestration_id`. Creates one Workspace
    /// and one Supervisor task per unit, scheduled under `max_parallel`.
    pub async fn execute(&self, decomposition: Decomposition) -> Result<OrchestrationId, OrchestratorError> {
        let orchestration_id = OrchestrationId::new();

        let mut runtimes = Vec::new();
        for unit in &decomposition.units {
            runtimes.push(std::sync::Mutex::new(UnitRuntime {
                unit: unit.clone(),
                task_id: None,
                workspace: None,
            }));
        }

        let orchestration = Arc::new(Orchestration {
            decomposition: decomposition.clone(),
            units: runtimes,
            state: std::sync::Mutex::new(OrchestrationState::Running),
        });
        self.orchestrations.insert(orchestration_id.clone(), orchestration.clone());

        self.ledger
            .append(
                "OrchestrationStarted",
                serde_json::json!({
                    "orchestration_id": orchestration_id.as_str(),
                    "unit_count": decomposition.units.len(),
                }),
                vec![orchestration_id.as_str().to_string()],
            )
            .map_err(|e| OrchestratorError::AdapterError(e.to_string()))?;

        for (idx, unit) in decomposition.units.iter().enumerate() {
            let permit = self.semaphore.clone().acquire_owned().await.map_err(|e| {
                OrchestratorError::AdapterError(format!("semaphore closed: {e}"))
            })?;

            let branch = format!("unit-{}", unit.id.as_str());
            let handle = self
                .adapter
                .create("main", &branch)
                .await
                .map_err(|e| OrchestratorError::AdapterError(e.to_string()))?;

            let task_id = self
                .supervisor
                .spawn(
                    &unit.prompt,
                    SpawnOptions {
                        cwd: Some(handle.path.clone()),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| OrchestratorError::AdapterError(e.to_string()))?;

            {
                let mut runtime = orchestration.units[idx].lock().unwrap();
                runtime.task_id = Some(task_id);
                runtime.workspace = Some(handle);
            }

            // The permit is dropped (releasing a concurrency slot) once the
            // unit's task reaches a terminal state; spawn a small watcher
            // per unit rather than holding the permit for the whole call.
            let supervisor = self.supervisor.clone();
            let watch_orchestration = orchestration.clone();
            let unit_idx = idx;
            tokio::spawn(async move {
                let _permit = permit;
                loop {
                    let task_id = watch_orchestration.units[unit_idx]
                        .lock()
                        .unwrap()
                        .task_id
                        .clone();
                    let Some(task_id) = task_id else { break };
                    match supervisor.status(Some(&task_id)) {
                        Ok(statuses) if statuses.first().map(|s| s.state.is_terminal()).unwrap_or(true) => break,
                        Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(250)).await,
                        Err(_) => break,
                    }
                }
            });
        }

        Ok(orchestration_id)
    }

    /// The single `Supervisor` shared by every unit this orchestrator
    /// spawns — also the right handle for direct (non-decomposed)
    /// spawn/send/interrupt/status/output calls, so the host exposes one
    /// task registry regardless of whether a task arrived via `execute`
    /// or directly.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// `status(orchestration_id)`. Aggregates per-unit states.
    pub fn status(&self, orchestration_id: &OrchestrationId) -> Result<OrchestrationStatus, OrchestratorError> {
        let orchestration = self
            .orchestrations
            .get(orchestration_id)
            .ok_or_else(|| OrchestratorError::NotFound(orchestration_id.to_string()))?;

        let units: Vec<UnitStatus> = orchestration
            .units
            .iter()
            .map(|u| {
                let runtime = u.lock().unwrap();
                let state = runtime
                    .task_id
                    .as_ref()
                    .and_then(|id| self.supervisor.status(Some(id)).ok())
                    .and_then(|s| s.first().map(|s| s.state));
                UnitStatus {
                    unit_id: runtime.unit.id.clone(),
                    task_id: runtime.task_id.clone(),
                    state,
                }
            })
            .collect();

        Ok(OrchestrationStatus {
            orchestration_id: orchestration_id.clone(),
            state: *orchestration.state.lock().unwrap(),
            units,
        })
    }

    /// `merge(orchestration_id)`. Commits and merges every completed
    /// unit's workspace into the parent; non-conflicting merges (expected,
    /// given the orthogonality invariant) proceed automatically, any
    /// conflict moves the orchestration to `NeedsResolution` instead of
    /// attempting automatic resolution.
    pub async fn merge(&self, orchestration_id: &OrchestrationId) -> Result<(), OrchestratorError> {
        let orchestration = self
            .orchestrations
            .get(orchestration_id)
            .ok_or_else(|| OrchestratorError::NotFound(orchestration_id.to_string()))?
            .clone();

        let mut all_terminal = true;
        for unit in &orchestration.units {
            let task_id = unit.lock().unwrap().task_id.clone();
            if let Some(task_id) = task_id {
                let terminal = self
                    .supervisor
                    .status(Some(&task_id))
                    .map(|s| s.first().map(|s| s.state.is_terminal()).unwrap_or(false))
                    .unwrap_or(false);
                if !terminal {
                    all_terminal = false;
                }
            }
        }
        if !all_terminal {
            return Err(OrchestratorError::UnitsStillRunning);
        }

        let mut conflicts = Vec::new();
        let mut any_success = false;
        for unit in &orchestration.units {
            let (handle, task_id) = {
                let runtime = unit.lock().unwrap();
                (runtime.workspace.clone(), runtime.task_id.clone())
            };
            let Some(handle) = handle else { continue };
            let Some(task_id) = task_id else { continue };

            let completed = self
                .supervisor
                .status(Some(&task_id))
                .map(|s| s.first().map(|s| s.state == TaskState::Completed).unwrap_or(false))
                .unwrap_or(false);
            if !completed {
                continue;
            }

            if let Err(e) = self.adapter.commit(&handle, "unit complete").await {
                conflicts.push(format!("{}: commit failed: {e}", handle.id));
                continue;
            }
            match self.adapter.merge(&handle, "main").await {
                Ok(()) => any_success = true,
                Err(e) => conflicts.push(format!("{}: {e}", handle.id)),
            }
        }

        let mut state = orchestration.state.lock().unwrap();
        *state = if !conflicts.is_empty() {
            OrchestrationState::NeedsResolution
        } else if any_success || self.config.failure_policy == FailurePolicy::BestEffort {
            OrchestrationState::Completed
        } else {
            OrchestrationState::Failed
        };

        if !conflicts.is_empty() {
            return Err(OrchestratorError::MergeConflict(conflicts));
        }
        Ok(())
    }

    /// `abort(orchestration_id)`. Interrupts every running unit and
    /// releases its workspace.
    pub async fn abort(&self, orchestration_id: &OrchestrationId) -> Result<(), OrchestratorError> {
        let orchestration = self
            .orchestrations
            .get(orchestration_id)
            .ok_or_else(|| OrchestratorError::NotFound(orchestration_id.to_string()))?
            .clone();

        for unit in &orchestration.units {
            let (task_id, handle) = {
                let runtime = unit.lock().unwrap();
                (runtime.task_id.clone(), runtime.workspace.clone())
            };
            if let Some(task_id) = task_id {
                if let Err(e) = self.supervisor.interrupt(&task_id, None).await {
                    log::warn!("abort: interrupt failed for unit task {task_id}: {e}");
                }
            }
            if let Some(handle) = handle {
                if let Err(e) = self.adapter.destroy(&handle).await {
                    log::warn!("abort: workspace destroy failed for {}: {e}", handle.id);
                }
            }
        }

        *orchestration.state.lock().unwrap() = OrchestrationState::Aborted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkspaceError;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    struct FakeAdapter {
        counter: AtomicU64,
    }

    impl FakeAdapter {
        fn new() -> Self {
            Self {
                counter: AtomicU64::new(0),
            }
        }
    }

    impl WorkspaceAdapter for FakeAdapter {
        async fn create(&self, _base: &str, branch: &str) -> Result<WorkspaceHandle, WorkspaceError> {
            let n = self.counter.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(WorkspaceHandle {
                id: format!("ws-{n}"),
                path: PathBuf::from(format!("/tmp/fake-workspace-{n}")),
                branch: branch.to_string(),
                state: crate::workspace::WorkspaceState::Created,
            })
        }
        async fn commit(&self, _handle: &WorkspaceHandle, _message: &str) -> Result<(), WorkspaceError> {
            Ok(())
        }
        async fn merge(&self, _handle: &WorkspaceHandle, _into: &str) -> Result<(), WorkspaceError> {
            Ok(())
        }
        async fn destroy(&self, _handle: &WorkspaceHandle) -> Result<(), WorkspaceError> {
            Ok(())
        }
    }

    #[test]
    fn decompose_rejects_overlapping_outputs() {
        let result = decompose(TaskId::new(), "add logging and then add logging");
        assert!(matches!(result, Err(OrchestratorError::OverlappingOutputs(_))));
    }

    #[test]
    fn decompose_splits_on_conjunctions() {
        let d = decompose(TaskId::new(), "add logging and then write tests").unwrap();
        assert_eq!(d.units.len(), 2);
    }

    #[tokio::test]
    async fn execute_spawns_one_task_per_unit() {
        let config = Config::default();
        let ledger = Arc::new(Ledger::new(None, 100).unwrap());
        let adapter = Arc::new(FakeAdapter::new());
        let orchestrator = Orchestrator::new(config, ledger, adapter);

        let decomposition = Decomposition {
            parent_task_id: TaskId::new(),
            units: vec![
                Unit {
                    id: UnitId::new(),
                    prompt: "implement feature a".to_string(),
                    expected_outputs: vec!["a".to_string()],
                    est_duration: std::time::Duration::from_secs(60),
                    dependencies: vec![],
                },
                Unit {
                    id: UnitId::new(),
                    prompt: "implement feature b".to_string(),
                    expected_outputs: vec!["b".to_string()],
                    est_duration: std::time::Duration::from_secs(60),
                    dependencies: vec![],
                },
            ],
        };

        let orchestration_id = orchestrator.execute(decomposition).await.unwrap();
        let status = orchestrator.status(&orchestration_id).unwrap();
        assert_eq!(status.units.len(), 2);
        assert!(status.units.iter().all(|u| u.task_id.is_some()));

        orchestrator.abort(&orchestration_id).await.unwrap();
    }
}
