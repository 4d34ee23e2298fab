//! C4 Hook Orchestrator: a small, ordered middleware pipeline that runs at
//! fixed phases of a task's lifecycle.
//!
//! Grounded on the `invoke_handler!` plugin/marketplace registration
//! pattern (ordered handlers looked up by a stable key), generalized here
//! to a priority-ordered chain with explicit veto/modify semantics for
//! deterministic short-circuiting rather than fan-out.

pub mod builtin;

use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

/// Lifecycle phase a hook runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Request,
    Validate,
    Execute,
    Stream,
    Complete,
    Error,
}

/// A hook's verdict on the payload it was given.
pub enum Decision {
    Continue,
    Modify(Value),
    Veto(String),
}

/// Registered hook: a handler plus its scheduling metadata. Lower-numbered
/// `priority` runs first; ties keep registration order (a stable sort).
pub struct Hook {
    pub name: String,
    pub phase: Phase,
    pub priority: i32,
    handler: Box<dyn Fn(&Value) -> Decision + Send + Sync>,
}

impl Hook {
    pub fn new(
        name: impl Into<String>,
        phase: Phase,
        priority: i32,
        handler: Box<dyn Fn(&Value) -> Decision + Send + Sync>,
    ) -> Self {
        Self {
            name: name.into(),
            phase,
            priority,
            handler,
        }
    }

    pub(crate) fn call(&self, payload: &Value) -> Decision {
        (self.handler)(payload)
    }
}

/// One hook's outcome within a pipeline run, kept for the event ledger.
#[derive(Debug, Clone, Serialize)]
pub struct HookOutcome {
    pub hook: String,
    pub phase: Phase,
    pub elapsed_ms: u128,
    pub over_budget: bool,
    pub vetoed: bool,
}

/// Result of running the pipeline for one phase.
pub struct PipelineResult {
    pub payload: Value,
    pub outcomes: Vec<HookOutcome>,
    pub veto: Option<(String, String)>,
}

/// Ordered, phase-keyed hook registry and runner.
///
/// Registration order is preserved as the tie-break for equal-priority
/// hooks (`Vec::sort_by` is stable), so pipeline ordering stays
/// deterministic across runs.
pub struct HookOrchestrator {
    hooks: RwLock<Vec<Hook>>,
    time_budget: Duration,
}

impl HookOrchestrator {
    pub fn new(time_budget: Duration) -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            time_budget,
        }
    }

    pub fn register(&self, hook: Hook) {
        let mut hooks = self.hooks.write().unwrap();
        hooks.push(hook);
        // Descending priority, per spec.md §4.4; `Vec::sort_by` is stable so
        // equal-priority hooks keep registration order as the tie-break.
        hooks.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Runs every hook registered for `phase`, in priority order, feeding
    /// each hook's (possibly modified) output to the next. A `Veto` stops
    /// the chain immediately; later hooks for this phase do not run.
    ///
    /// A hook that exceeds the configured time budget is logged and
    /// counted in its `HookOutcome` but is not aborted or skipped — the
    /// budget is advisory instrumentation, not a hard deadline.
    pub fn run(&self, phase: Phase, payload: Value) -> PipelineResult {
        let hooks = self.hooks.read().unwrap();
        let mut current = payload;
        let mut outcomes = Vec::new();
        let mut veto = None;

        for hook in hooks.iter().filter(|h| h.phase == phase) {
            let start = Instant::now();
            let decision = (hook.handler)(&current);
            let elapsed = start.elapsed();
            let over_budget = elapsed > self.time_budget;
            if over_budget {
                log::warn!(
                    "hook {} phase {:?} exceeded time budget: {:?} > {:?}",
                    hook.name,
                    phase,
                    elapsed,
                    self.time_budget
                );
            }

            let vetoed = matches!(decision, Decision::Veto(_));
            outcomes.push(HookOutcome {
                hook: hook.name.clone(),
                phase,
                elapsed_ms: elapsed.as_millis(),
                over_budget,
                vetoed,
            });

            match decision {
                Decision::Continue => {}
                Decision::Modify(new_payload) => current = new_payload,
                Decision::Veto(reason) => {
                    veto = Some((hook.name.clone(), reason));
                    break;
                }
            }
        }

        PipelineResult {
            payload: current,
            outcomes,
            veto,
        }
    }

    /// Streaming hooks get a read-only windowed view of recent bytes and
    /// may emit synthetic events (via their own side channel, e.g. the
    /// Monitor or Intervention-bridge hooks writing to the Ledger) but must
    /// not modify the stream itself — `Modify`/`Veto` decisions from a
    /// `Stream`-phase hook are logged and discarded rather than honored.
    pub fn run_stream(&self, window: &[u8]) {
        let hooks = self.hooks.read().unwrap();
        let payload = Value::String(String::from_utf8_lossy(window).into_owned());
        for hook in hooks.iter().filter(|h| h.phase == Phase::Stream) {
            let start = Instant::now();
            let decision = (hook.handler)(&payload);
            let elapsed = start.elapsed();
            if elapsed > self.time_budget {
                log::warn!(
                    "stream hook {} exceeded time budget: {:?} > {:?}",
                    hook.name,
                    elapsed,
                    self.time_budget
                );
            }
            if !matches!(decision, Decision::Continue) {
                log::warn!(
                    "stream hook {} returned a Modify/Veto decision; stream hooks cannot alter the stream, ignoring",
                    hook.name
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn hooks_run_in_descending_priority_order() {
        let orchestrator = HookOrchestrator::new(Duration::from_millis(50));
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        orchestrator.register(Hook::new(
            "low_priority",
            Phase::Validate,
            0,
            Box::new(move |_| {
                o1.lock().unwrap().push("low_priority");
                Decision::Continue
            }),
        ));
        let o2 = order.clone();
        orchestrator.register(Hook::new(
            "high_priority",
            Phase::Validate,
            10,
            Box::new(move |_| {
                o2.lock().unwrap().push("high_priority");
                Decision::Continue
            }),
        ));

        orchestrator.run(Phase::Validate, Value::Null);
        assert_eq!(*order.lock().unwrap(), vec!["high_priority", "low_priority"]);
    }

    #[test]
    fn equal_priority_keeps_registration_order() {
        let orchestrator = HookOrchestrator::new(Duration::from_millis(50));
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        orchestrator.register(Hook::new(
            "registered_first",
            Phase::Validate,
            0,
            Box::new(move |_| {
                o1.lock().unwrap().push("registered_first");
                Decision::Continue
            }),
        ));
        let o2 = order.clone();
        orchestrator.register(Hook::new(
            "registered_second",
            Phase::Validate,
            0,
            Box::new(move |_| {
                o2.lock().unwrap().push("registered_second");
                Decision::Continue
            }),
        ));

        orchestrator.run(Phase::Validate, Value::Null);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["registered_first", "registered_second"]
        );
    }

    #[test]
    fn veto_short_circuits_remaining_hooks() {
        let orchestrator = HookOrchestrator::new(Duration::from_millis(50));
        let ran = Arc::new(Mutex::new(false));

        orchestrator.register(Hook::new(
            "blocker",
            Phase::Validate,
            10,
            Box::new(|_| Decision::Veto("denied".to_string())),
        ));
        let ran_clone = ran.clone();
        orchestrator.register(Hook::new(
            "never_runs",
            Phase::Validate,
            0,
            Box::new(move |_| {
                *ran_clone.lock().unwrap() = true;
                Decision::Continue
            }),
        ));

        let result = orchestrator.run(Phase::Validate, Value::Null);
        assert_eq!(result.veto, Some(("blocker".to_string(), "denied".to_string())));
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn modify_threads_through_chain() {
        let orchestrator = HookOrchestrator::new(Duration::from_millis(50));
        orchestrator.register(Hook::new(
            "doubler",
            Phase::Request,
            0,
            Box::new(|v| {
                let n = v.as_i64().unwrap_or(0);
                Decision::Modify(Value::from(n * 2))
            }),
        ));
        let result = orchestrator.run(Phase::Request, Value::from(21));
        assert_eq!(result.payload, Value::from(42));
    }

    #[test]
    fn stream_hook_cannot_modify_the_stream() {
        let orchestrator = HookOrchestrator::new(Duration::from_millis(50));
        orchestrator.register(Hook::new(
            "tamperer",
            Phase::Stream,
            0,
            Box::new(|_| Decision::Veto("nope".to_string())),
        ));
        // Should not panic and should simply log; no result to assert on
        // besides "did not blow up".
        orchestrator.run_stream(b"hello");
    }
}
