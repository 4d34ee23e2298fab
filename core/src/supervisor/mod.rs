//! C5 Task Supervisor: owns one task's state machine, its Executor,
//! Scanner, and Controller, and exposes the task-facing public surface.
//!
//! Grounded on `core/session_manager.rs::SessionManager` — a `DashMap`
//! registry with `Entry`-based create-or-reject semantics and cheap
//! `Clone`-out snapshots for status queries — generalized from a
//! UI-facing session registry into a full task state machine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::SupervisorError;
use crate::hooks::builtin::{
    approval_hook, decomposition_hook, intervention_bridge_hook, monitor_hook, validation_hook,
};
use crate::hooks::{HookOrchestrator, Phase};
use crate::ids::{ExecutionId, TaskId};
use crate::ledger::Ledger;
use crate::pty::{Executor, ExecutorConfig, SpawnRequest};
use crate::scanner::{RuleAction, Scanner};

/// The task's public state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Queued,
    Starting,
    Running,
    Interrupting,
    Completing,
    Completed,
    Failed,
    Interrupted,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Interrupted | TaskState::TimedOut
        )
    }
}

/// Auxiliary activity reported alongside `Running`, folding a richer
/// `Idle`/`NeedsInput`/`Working` distinction into a status field rather
/// than a separate top-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Activity {
    Working,
    Idle,
    NeedsInput,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub activity: Option<Activity>,
    pub failure_reason: Option<String>,
    pub runtime: Duration,
    pub bytes_out: u64,
    pub recent_match_count: u64,
    pub intervention_count: u64,
}

/// Options accompanying `spawn`.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<std::path::PathBuf>,
}

struct OutputBuffer {
    buf: VecDeque<u8>,
    cap: usize,
    total_bytes: u64,
}

impl OutputBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            cap,
            total_bytes: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.total_bytes += bytes.len() as u64;
        self.buf.extend(bytes.iter().copied());
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }

    fn tail_lines(&self, n: usize) -> Vec<u8> {
        let text: Vec<u8> = self.buf.iter().copied().collect();
        if n == 0 {
            return text;
        }
        let s = String::from_utf8_lossy(&text);
        let lines: Vec<&str> = s.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n").into_bytes()
    }
}

struct Task {
    task_id: TaskId,
    execution_id: ExecutionId,
    state: Mutex<TaskState>,
    failure_reason: Mutex<Option<String>>,
    activity: Mutex<Activity>,
    started_at: Instant,
    executor: Mutex<Option<Executor>>,
    scanner: Arc<Scanner>,
    controller: Arc<Controller>,
    output: Mutex<OutputBuffer>,
    match_count: AtomicUsize,
    intervention_count: AtomicUsize,
    terminal_notify: Notify,
    /// Stream-phase only: Monitor, Intervention-bridge, and Approval,
    /// bound to this task's own Ledger refs and Executor. Separate from
    /// `Supervisor::hooks` (Request/Validate, shared process-wide) since
    /// these three close over per-task state.
    stream_hooks: HookOrchestrator,
}

/// Owns the set of live tasks and drives each through its state machine.
/// One `Supervisor` per process (or per Orchestrator unit); tasks are
/// independent and addressed by `TaskId`.
pub struct Supervisor {
    config: Config,
    tasks: DashMap<TaskId, Arc<Task>>,
    ledger: Arc<Ledger>,
    hooks: HookOrchestrator,
}

impl Supervisor {
    pub fn new(config: Config, ledger: Arc<Ledger>) -> Self {
        let hooks = HookOrchestrator::new(Duration::from_millis(config.hook_time_budget_ms));
        hooks.register(validation_hook(&config));
        hooks.register(decomposition_hook());
        Self {
            config,
            tasks: DashMap::new(),
            ledger,
            hooks,
        }
    }

    /// `spawn(prompt, options) → task_id`. Non-blocking: returns as soon as
    /// the Executor has a PID, before the child necessarily produces any
    /// output. Wires the Scanner's matches into the Controller inline so
    /// every `InterruptAndInject`/`Escalate` match is handled without an
    /// extra hop through the Hook Orchestrator's stream phase.
    pub async fn spawn(&self, prompt: &str, options: SpawnOptions) -> Result<TaskId, SupervisorError> {
        let request_result = self
            .hooks
            .run(Phase::Request, serde_json::json!({"prompt": prompt}));
        if request_result
            .payload
            .get("decompose")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            log::info!("prompt flagged as a decomposition candidate: {prompt:?}");
        }

        let validation = self
            .hooks
            .run(Phase::Validate, serde_json::json!({"prompt": prompt}));
        if let Some((hook, reason)) = validation.veto {
            return Err(SupervisorError::InputError {
                reason: format!("{hook}: {reason}"),
            });
        }

        let task_id = TaskId::new();
        let execution_id = ExecutionId::new();

        let request = SpawnRequest {
            command: options.command.unwrap_or_else(|| {
                std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
            }),
            args: options.args,
            env: options.env,
            cwd: options.cwd,
            rows: 24,
            cols: 80,
        };

        let executor_config = ExecutorConfig {
            stream_overflow_grace: Duration::from_millis(self.config.stream_overflow_grace_ms),
            ..ExecutorConfig::default()
        };
        let executor = Executor::start(request, executor_config)
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;

        let scanner = Arc::new(Scanner::new(
            execution_id.clone(),
            self.config.scanner_window_bytes,
            self.config.match_context_bytes,
        ));
        let controller = Arc::new(Controller::new(execution_id.clone(), &self.config));

        let stream_hooks = HookOrchestrator::new(Duration::from_millis(self.config.hook_time_budget_ms));

        let monitor_ledger = self.ledger.clone();
        let monitor_task_id = task_id.clone();
        let emit_stream_chunks = self.config.emit_stream_chunk_events;
        stream_hooks.register(monitor_hook(Box::new(move |window: &str| {
            if !emit_stream_chunks {
                return;
            }
            if let Err(e) = monitor_ledger.append(
                "StreamChunk",
                serde_json::json!({"task_id": monitor_task_id.as_str(), "window": window}),
                vec![monitor_task_id.as_str().to_string()],
            ) {
                log::warn!("failed to append StreamChunk event: {e}");
            }
        })));

        stream_hooks.register(intervention_bridge_hook(Box::new(move |window: &str| {
            log::trace!("intervention bridge observed {} bytes of stream window", window.len());
        })));

        let executor_for_approval = executor.clone();
        stream_hooks.register(approval_hook(Box::new(move || {
            let executor = executor_for_approval.clone();
            tokio::spawn(async move {
                if let Err(e) = executor.inject(b"y").await {
                    log::warn!("approval auto-injection failed: {e}");
                }
            });
        })));

        let task = Arc::new(Task {
            task_id: task_id.clone(),
            execution_id: execution_id.clone(),
            state: Mutex::new(TaskState::Starting),
            failure_reason: Mutex::new(None),
            activity: Mutex::new(Activity::Working),
            started_at: Instant::now(),
            executor: Mutex::new(Some(executor.clone())),
            scanner: scanner.clone(),
            controller: controller.clone(),
            output: Mutex::new(OutputBuffer::new(self.config.recent_buffer_bytes)),
            match_count: AtomicUsize::new(0),
            intervention_count: AtomicUsize::new(0),
            terminal_notify: Notify::new(),
            stream_hooks,
        });

        self.tasks.insert(task_id.clone(), task.clone());

        // Fan every byte chunk into the output buffer, the scanner, and
        // the Stream-phase hook pipeline; the scanner's own matches are
        // forwarded to the controller on a background task since
        // `handle_match` is async and `on_bytes` consumers must stay
        // synchronous.
        let output_task = task.clone();
        let scanner_for_bytes = scanner.clone();
        executor.on_bytes(Box::new(move |_seq, bytes| {
            output_task.output.lock().unwrap().push(bytes);
            scanner_for_bytes.append(bytes);
            output_task.stream_hooks.run_stream(bytes);
        }));

        let exit_task = task.clone();
        let exit_ledger = self.ledger.clone();
        executor.on_exit(Box::new(move |code| {
            let exit_task = exit_task.clone();
            let exit_ledger = exit_ledger.clone();
            tokio::spawn(async move {
                {
                    let mut state = exit_task.state.lock().unwrap();
                    if state.is_terminal() {
                        return;
                    }
                    *state = TaskState::Completing;
                }
                if let Err(e) = exit_ledger.append(
                    "ExecutionExited",
                    serde_json::json!({"task_id": exit_task.task_id.as_str(), "exit_code": code}),
                    vec![exit_task.task_id.as_str().to_string()],
                ) {
                    log::warn!("failed to append ExecutionExited: {e}");
                }
                let (final_state, reason) = if code == Some(0) {
                    (TaskState::Completed, None)
                } else {
                    (TaskState::Failed, Some(format!("child exited with code {code:?}")))
                };
                finish(&exit_task, &exit_ledger, final_state, reason).await;
            });
        }));

        let overflow_ledger = self.ledger.clone();
        let overflow_task_id = task_id.clone();
        executor.on_overflow(Box::new(move |dropped_bytes| {
            if let Err(e) = overflow_ledger.append(
                "StreamOverflow",
                serde_json::json!({"task_id": overflow_task_id.as_str(), "dropped_bytes": dropped_bytes}),
                vec![overflow_task_id.as_str().to_string()],
            ) {
                log::warn!("failed to append StreamOverflow event: {e}");
            }
        }));

        let match_task = task.clone();
        let executor_for_matches = executor.clone();
        scanner.on_match(Box::new(move |m| {
            match_task.match_count.fetch_add(1, Ordering::Relaxed);
            if m.rule_id.is_progress_signal() {
                return;
            }
            let controller = match_task.controller.clone();
            let executor = executor_for_matches.clone();
            let action = default_action_for(m.rule_id);
            let intervention_counter = match_task.clone();
            tokio::spawn(async move {
                controller.handle_match(&m, action, &executor).await;
                intervention_counter.intervention_count.fetch_add(1, Ordering::Relaxed);
            });
        }));

        let unproductive_ledger = self.ledger.clone();
        let unproductive_task_id = task_id.clone();
        controller.on_unproductive(Box::new(move |event| {
            if let Err(e) = unproductive_ledger.append(
                "ExecutionUnproductive",
                serde_json::json!({
                    "task_id": unproductive_task_id.as_str(),
                    "rule_id": event.rule_id,
                    "history_len": event.history.len(),
                }),
                vec![unproductive_task_id.as_str().to_string()],
            ) {
                log::warn!("failed to append ExecutionUnproductive: {e}");
            }
        }));

        executor.heartbeat(self.config.heartbeat_interval(), Vec::new());

        *task.state.lock().unwrap() = TaskState::Running;
        self.ledger
            .append(
                "TaskStarted",
                serde_json::json!({"task_id": task_id.as_str(), "prompt": prompt}),
                vec![task_id.as_str().to_string()],
            )
            .map_err(|e| SupervisorError::AdapterError(e.to_string()))?;

        self.spawn_timeout_watcher(task.clone());

        Ok(task_id)
    }

    fn spawn_timeout_watcher(&self, task: Arc<Task>) {
        let timeout = self.config.task_timeout();
        let idle_limit = self.config.idle_limit();
        let output_cap = self.config.output_cap_bytes as u64;
        let ledger = self.ledger.clone();
        tokio::spawn(async move {
            loop {
                if task.state.lock().unwrap().is_terminal() {
                    return;
                }
                if task.started_at.elapsed() >= timeout {
                    finish(&task, &ledger, TaskState::TimedOut, Some("task wall clock exceeded".to_string())).await;
                    return;
                }
                let total_bytes = task.output.lock().unwrap().total_bytes;
                if total_bytes > output_cap {
                    finish(&task, &ledger, TaskState::Failed, Some("OutputOverflow".to_string())).await;
                    return;
                }
                let idle = task
                    .executor
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|e| e.idle_for())
                    .unwrap_or_default();
                if idle >= idle_limit {
                    finish(&task, &ledger, TaskState::Failed, Some("ChildUnresponsive".to_string())).await;
                    return;
                }
                if let Some(rule_id) = task.controller.first_unproductive() {
                    task.controller.emit_unproductive(rule_id);
                    finish(&task, &ledger, TaskState::Failed, Some("Unproductive".to_string())).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
    }

    /// `send(task_id, bytes)`. Fails with `NotRunning` unless `Running`.
    pub async fn send(&self, task_id: &TaskId, bytes: &[u8]) -> Result<(), SupervisorError> {
        let task = self.get_task(task_id)?;
        if *task.state.lock().unwrap() != TaskState::Running {
            return Err(SupervisorError::NotRunning);
        }
        let executor = task
            .executor
            .lock()
            .unwrap()
            .clone()
            .ok_or(SupervisorError::NotRunning)?;
        executor
            .write(bytes)
            .await
            .map_err(|e| SupervisorError::AdapterError(e.to_string()))
    }

    /// `interrupt(task_id, follow_up?)`. Idempotent at the Executor layer.
    pub async fn interrupt(&self, task_id: &TaskId, follow_up: Option<&[u8]>) -> Result<(), SupervisorError> {
        let task = self.get_task(task_id)?;
        {
            let mut state = task.state.lock().unwrap();
            if state.is_terminal() {
                return Ok(());
            }
            *state = TaskState::Interrupting;
        }
        let executor = task
            .executor
            .lock()
            .unwrap()
            .clone()
            .ok_or(SupervisorError::NotRunning)?;
        executor
            .interrupt()
            .await
            .map_err(|e| SupervisorError::AdapterError(e.to_string()))?;
        if let Some(bytes) = follow_up {
            executor
                .inject(bytes)
                .await
                .map_err(|e| SupervisorError::AdapterError(e.to_string()))?;
        }
        finish(&task, &self.ledger, TaskState::Interrupted, None).await;
        Ok(())
    }

    /// `status(task_id?)`. A pure snapshot; with no id, lists every task.
    pub fn status(&self, task_id: Option<&TaskId>) -> Result<Vec<TaskStatus>, SupervisorError> {
        match task_id {
            Some(id) => {
                let task = self.get_task(id)?;
                Ok(vec![snapshot(&task)])
            }
            None => Ok(self.tasks.iter().map(|e| snapshot(e.value())).collect()),
        }
    }

    /// `output(task_id, tail?)`. Returns accumulated output, optionally
    /// only the last `tail` lines.
    pub fn output(&self, task_id: &TaskId, tail: Option<usize>) -> Result<Vec<u8>, SupervisorError> {
        let task = self.get_task(task_id)?;
        let output = task.output.lock().unwrap();
        Ok(output.tail_lines(tail.unwrap_or(0)))
    }

    fn get_task(&self, task_id: &TaskId) -> Result<Arc<Task>, SupervisorError> {
        match self.tasks.entry(task_id.clone()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(_) => Err(SupervisorError::TaskNotFound(task_id.to_string())),
        }
    }
}

fn default_action_for(rule_id: crate::scanner::RuleId) -> RuleAction {
    use crate::scanner::RuleId::*;
    match rule_id {
        FalseCompletion | PlanningStall | ResearchLoop | AnalysisParalysis => RuleAction::InterruptAndInject,
        EmptyTodo => RuleAction::Escalate,
        ProgressFileCreated | ProgressTestPassed | ProgressCodeBlock => RuleAction::Track,
    }
}

fn snapshot(task: &Arc<Task>) -> TaskStatus {
    TaskStatus {
        task_id: task.task_id.clone(),
        state: *task.state.lock().unwrap(),
        activity: if *task.state.lock().unwrap() == TaskState::Running {
            Some(*task.activity.lock().unwrap())
        } else {
            None
        },
        failure_reason: task.failure_reason.lock().unwrap().clone(),
        runtime: task.started_at.elapsed(),
        bytes_out: task.output.lock().unwrap().total_bytes,
        recent_match_count: task.match_count.load(Ordering::Relaxed) as u64,
        intervention_count: task.intervention_count.load(Ordering::Relaxed) as u64,
    }
}

/// Ordered cleanup on entering a terminal state: unregister hooks (a
/// no-op here since hooks are owned by the caller, not the Task), stop
/// the scanner (drop our reference), kill the executor, release the
/// workspace (owned by the Orchestrator layer, not this Task), emit
/// `TaskEnded`. Each step runs even if an earlier one failed; failures are
/// logged, never propagated.
async fn finish(task: &Arc<Task>, ledger: &Arc<Ledger>, state: TaskState, reason: Option<String>) {
    {
        let mut current = task.state.lock().unwrap();
        if current.is_terminal() {
            return;
        }
        *current = state;
        *task.failure_reason.lock().unwrap() = reason.clone();
    }

    let executor = task.executor.lock().unwrap().take();
    if let Some(executor) = executor {
        if let Err(e) = executor.kill(Duration::from_secs(5)).await {
            log::warn!("task {} cleanup: kill failed: {e}", task.task_id);
        }
    }

    if let Err(e) = ledger.append(
        "TaskEnded",
        serde_json::json!({
            "task_id": task.task_id.as_str(),
            "execution_id": task.execution_id.as_str(),
            "state": format!("{:?}", state),
            "reason": reason,
        }),
        vec![task.task_id.as_str().to_string()],
    ) {
        log::warn!("task {} cleanup: ledger append failed: {e}", task.task_id);
    }

    task.terminal_notify.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_supervisor() -> Supervisor {
        let config = Config::default();
        let ledger = Arc::new(Ledger::new(None, 100).unwrap());
        Supervisor::new(config, ledger)
    }

    #[tokio::test]
    async fn spawn_reports_running_status() {
        let supervisor = test_supervisor();
        let task_id = supervisor
            .spawn(
                "implement the feature",
                SpawnOptions {
                    command: Some("/bin/sh".to_string()),
                    args: vec!["-c".to_string(), "sleep 5".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let statuses = supervisor.status(Some(&task_id)).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, TaskState::Running);

        supervisor.interrupt(&task_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn spawn_reaches_completed_on_exit_zero() {
        let supervisor = test_supervisor();
        let task_id = supervisor
            .spawn(
                "implement the feature",
                SpawnOptions {
                    command: Some("/bin/sh".to_string()),
                    args: vec!["-c".to_string(), "exit 0".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let state = supervisor.status(Some(&task_id)).unwrap()[0].state;
            if state.is_terminal() {
                assert_eq!(state, TaskState::Completed);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never reached a terminal state");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn spawn_reaches_failed_on_nonzero_exit() {
        let supervisor = test_supervisor();
        let task_id = supervisor
            .spawn(
                "implement the feature",
                SpawnOptions {
                    command: Some("/bin/sh".to_string()),
                    args: vec!["-c".to_string(), "exit 7".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = &supervisor.status(Some(&task_id)).unwrap()[0];
            if status.state.is_terminal() {
                assert_eq!(status.state, TaskState::Failed);
                assert!(status.failure_reason.as_ref().unwrap().contains('7'));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never reached a terminal state");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn send_fails_when_not_running() {
        let supervisor = test_supervisor();
        let unknown = TaskId::new();
        let result = supervisor.send(&unknown, b"hi").await;
        assert!(matches!(result, Err(SupervisorError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn interrupt_is_idempotent() {
        let supervisor = test_supervisor();
        let task_id = supervisor
            .spawn(
                "implement the feature",
                SpawnOptions {
                    command: Some("/bin/sh".to_string()),
                    args: vec!["-c".to_string(), "sleep 5".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        supervisor.interrupt(&task_id, None).await.unwrap();
        supervisor.interrupt(&task_id, None).await.unwrap();

        let statuses = supervisor.status(Some(&task_id)).unwrap();
        assert_eq!(statuses[0].state, TaskState::Interrupted);
    }

    #[tokio::test]
    async fn status_with_no_id_lists_all_tasks() {
        let supervisor = test_supervisor();
        let t1 = supervisor
            .spawn(
                "implement a",
                SpawnOptions {
                    command: Some("/bin/sh".to_string()),
                    args: vec!["-c".to_string(), "sleep 5".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let t2 = supervisor
            .spawn(
                "implement b",
                SpawnOptions {
                    command: Some("/bin/sh".to_string()),
                    args: vec!["-c".to_string(), "sleep 5".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let statuses = supervisor.status(None).unwrap();
        assert_eq!(statuses.len(), 2);

        supervisor.interrupt(&t1, None).await.unwrap();
        supervisor.interrupt(&t2, None).await.unwrap();
    }
}
