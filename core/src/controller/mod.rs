//! C3 Intervention Controller: converts Scanner matches into decisions and
//! side effects on the Executor.
//!
//! Per-execution state is owned exclusively by the `Execution` that holds
//! this Controller, matching `ProcessManager`'s `Inner` ownership model —
//! a single owning handle rather than state shared ad hoc.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use crate::config::{Config, StageTimeouts};
use crate::ids::ExecutionId;
use crate::pty::Executor;
use crate::scanner::{Match, RuleAction, RuleId};

/// Escalation stage for one `(execution, rule-family)` pair. Stages are
/// non-decreasing for the lifetime of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Stage {
    None,
    Gentle,
    Firm,
    Forceful,
}

/// A single recorded escalation: `(execution_id, cause_match_id, stage,
/// injected_bytes, ts)`.
#[derive(Debug, Clone, Serialize)]
pub struct Intervention {
    pub execution_id: ExecutionId,
    pub cause_match_id: String,
    pub rule_id: RuleId,
    pub stage: Stage,
    pub injected_message: String,
    pub ts: chrono::DateTime<Utc>,
}

/// Raised when the Controller exhausts escalation for a rule family
/// without success — the Supervisor decides kill vs. re-prompt.
#[derive(Debug, Clone)]
pub struct ExecutionUnproductive {
    pub execution_id: ExecutionId,
    pub rule_id: RuleId,
    pub history: Vec<Intervention>,
}

struct FamilyState {
    stage: Stage,
    last_intervention_at: Option<Instant>,
    history: Vec<Intervention>,
}

impl Default for FamilyState {
    fn default() -> Self {
        Self {
            stage: Stage::None,
            last_intervention_at: None,
            history: Vec::new(),
        }
    }
}

struct ControllerState {
    families: HashMap<RuleId, FamilyState>,
    last_progress_at: Instant,
    last_global_intervention_at: Option<Instant>,
}

/// Pluggable external verification for "false completion": a narrow
/// closure seam rather than a registry, since verification is optional
/// and outside the core's responsibility.
pub type CompletionVerifier = Box<dyn Fn() -> bool + Send + Sync>;

pub struct Controller {
    execution_id: ExecutionId,
    global_spacing: Duration,
    stage_timeouts: StageTimeouts,
    success_window: Duration,
    state: Mutex<ControllerState>,
    verifier: Option<CompletionVerifier>,
    on_intervention: RwLock<Vec<Box<dyn Fn(Intervention) + Send + Sync>>>,
    on_unproductive: RwLock<Vec<Box<dyn Fn(ExecutionUnproductive) + Send + Sync>>>,
}

impl Controller {
    pub fn new(execution_id: ExecutionId, config: &Config) -> Self {
        Self {
            execution_id,
            global_spacing: Duration::from_secs(config.intervention_global_spacing_secs),
            stage_timeouts: config.intervention_stage_timeouts,
            success_window: Duration::from_secs(config.intervention_success_secs),
            state: Mutex::new(ControllerState {
                families: HashMap::new(),
                last_progress_at: Instant::now(),
                last_global_intervention_at: None,
            }),
            verifier: None,
            on_intervention: RwLock::new(Vec::new()),
            on_unproductive: RwLock::new(Vec::new()),
        }
    }

    pub fn with_verifier(mut self, verifier: CompletionVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn on_intervention(&self, handler: Box<dyn Fn(Intervention) + Send + Sync>) {
        self.on_intervention.write().unwrap().push(handler);
    }

    pub fn on_unproductive(&self, handler: Box<dyn Fn(ExecutionUnproductive) + Send + Sync>) {
        self.on_unproductive.write().unwrap().push(handler);
    }

    /// Step 1 of the decision algorithm: routes a fired Match by its rule's
    /// action. `Track` matches only update the evidence window; everything
    /// else is a candidate for intervention.
    pub async fn handle_match(&self, m: &Match, action: RuleAction, executor: &Executor) {
        match action {
            RuleAction::Track => self.record_progress(),
            RuleAction::Warn => log::info!("scanner match {:?} (warn-only)", m.rule_id),
            RuleAction::InterruptAndInject | RuleAction::Escalate => {
                self.decide_and_apply(m, executor).await
            }
        }
    }

    fn record_progress(&self) {
        self.state.lock().unwrap().last_progress_at = Instant::now();
    }

    /// Steps 2-6 of the decision algorithm.
    async fn decide_and_apply(&self, m: &Match, executor: &Executor) {
        let (stage, should_apply) = {
            let mut state = self.state.lock().unwrap();

            // Step 2: global spacing to avoid intervention storms.
            if let Some(last) = state.last_global_intervention_at {
                if last.elapsed() < self.global_spacing {
                    return; // queued: caller-visible as "no decision yet"
                }
            }

            // Step 3: select the stage for this rule family.
            let entry = state.families.entry(m.rule_id).or_default();
            let next_stage = match entry.stage {
                Stage::None => Stage::Gentle,
                Stage::Gentle
                    if entry
                        .last_intervention_at
                        .map(|t| t.elapsed() >= Duration::from_secs(self.stage_timeouts.gentle_to_firm_secs))
                        .unwrap_or(true) =>
                {
                    Stage::Firm
                }
                Stage::Firm
                    if entry
                        .last_intervention_at
                        .map(|t| t.elapsed() >= Duration::from_secs(self.stage_timeouts.firm_to_forceful_secs))
                        .unwrap_or(true) =>
                {
                    Stage::Forceful
                }
                current => current,
            };
            entry.stage = next_stage;
            entry.last_intervention_at = Some(Instant::now());
            state.last_global_intervention_at = Some(Instant::now());
            (next_stage, true)
        };

        if !should_apply {
            return;
        }

        // Step 4: compose the injected message.
        let message = self.compose_message(m.rule_id, stage);

        // Step 5: interrupt then write.
        if let Err(e) = executor.interrupt().await {
            log::warn!("interrupt before intervention failed: {e}");
        }
        if let Err(e) = executor.inject(message.as_bytes()).await {
            log::warn!("intervention injection failed: {e}");
            return;
        }

        // Step 6: emit InterventionApplied.
        let intervention = Intervention {
            execution_id: self.execution_id.clone(),
            cause_match_id: m.id.clone(),
            rule_id: m.rule_id,
            stage,
            injected_message: message,
            ts: Utc::now(),
        };

        {
            let mut state = self.state.lock().unwrap();
            let entry = state.families.entry(m.rule_id).or_default();
            entry.history.push(intervention.clone());
        }

        for h in self.on_intervention.read().unwrap().iter() {
            h(intervention.clone());
        }
    }

    fn compose_message(&self, rule_id: RuleId, stage: Stage) -> String {
        let body = match rule_id {
            RuleId::PlanningStall => "Stop planning. Implement now.",
            RuleId::ResearchLoop => "Stop researching. Write the code now.",
            RuleId::AnalysisParalysis => "Pick one option and implement it now.",
            RuleId::EmptyTodo => "Replace the TODO with a real implementation now.",
            RuleId::FalseCompletion => "Show the actual file or test output as evidence.",
            _ => "Implement now.",
        };
        match stage {
            Stage::Forceful => format!(
                "{body} Create the file immediately; you have {} seconds.",
                self.stage_timeouts.forceful_to_unproductive_secs
            ),
            _ => body.to_string(),
        }
    }

    /// Polled by the Supervisor: true once a `forceful` intervention has
    /// stood for `T2` without a subsequent progress signal (or, for
    /// `false_completion`, without the verifier confirming evidence).
    pub fn is_unproductive(&self, rule_id: RuleId) -> bool {
        let state = self.state.lock().unwrap();
        let Some(family) = state.families.get(&rule_id) else {
            return false;
        };
        if family.stage != Stage::Forceful {
            return false;
        }
        let Some(last) = family.last_intervention_at else {
            return false;
        };
        if last.elapsed() < self.success_window {
            return false;
        }
        if rule_id == RuleId::FalseCompletion {
            if let Some(verifier) = &self.verifier {
                return !verifier();
            }
        }
        state.last_progress_at < last
    }

    /// Polled by the Supervisor once per tick: returns the first rule
    /// family currently unproductive, if any, so the caller can decide
    /// kill vs. re-prompt without needing to know which families are in
    /// play ahead of time.
    pub fn first_unproductive(&self) -> Option<RuleId> {
        let families: Vec<RuleId> = self.state.lock().unwrap().families.keys().copied().collect();
        families.into_iter().find(|id| self.is_unproductive(*id))
    }

    pub fn history(&self, rule_id: RuleId) -> Vec<Intervention> {
        self.state
            .lock()
            .unwrap()
            .families
            .get(&rule_id)
            .map(|f| f.history.clone())
            .unwrap_or_default()
    }

    pub fn stage(&self, rule_id: RuleId) -> Stage {
        self.state
            .lock()
            .unwrap()
            .families
            .get(&rule_id)
            .map(|f| f.stage)
            .unwrap_or(Stage::None)
    }

    pub fn emit_unproductive(&self, rule_id: RuleId) {
        let history = self.history(rule_id);
        let event = ExecutionUnproductive {
            execution_id: self.execution_id.clone(),
            rule_id,
            history,
        };
        for h in self.on_unproductive.read().unwrap().iter() {
            h(event.clone());
        }
    }
}

impl Clone for ExecutionUnproductive {
    fn clone(&self) -> Self {
        Self {
            execution_id: self.execution_id.clone(),
            rule_id: self.rule_id,
            history: self.history.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{ExecutorConfig, SpawnRequest};

    fn test_match(rule_id: RuleId) -> Match {
        Match {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id,
            execution_id: ExecutionId::new(),
            position_range: 0..1,
            ts: Utc::now(),
            extracted_context: String::new(),
        }
    }

    #[tokio::test]
    async fn escalation_stages_are_non_decreasing() {
        let mut config = Config::default();
        config.intervention_stage_timeouts.gentle_to_firm_secs = 0;
        config.intervention_stage_timeouts.firm_to_forceful_secs = 0;
        config.intervention_global_spacing_secs = 0;
        let controller = Controller::new(ExecutionId::new(), &config);

        let executor = Executor::start(
            SpawnRequest {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "sleep 5".to_string()],
                ..Default::default()
            },
            ExecutorConfig::default(),
        )
        .unwrap();

        let m = test_match(RuleId::PlanningStall);
        controller
            .handle_match(&m, RuleAction::InterruptAndInject, &executor)
            .await;
        assert_eq!(controller.stage(RuleId::PlanningStall), Stage::Gentle);

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller
            .handle_match(&m, RuleAction::InterruptAndInject, &executor)
            .await;
        assert_eq!(controller.stage(RuleId::PlanningStall), Stage::Firm);

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller
            .handle_match(&m, RuleAction::InterruptAndInject, &executor)
            .await;
        assert_eq!(controller.stage(RuleId::PlanningStall), Stage::Forceful);

        executor.kill(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn track_action_never_intervenes() {
        let config = Config::default();
        let controller = Controller::new(ExecutionId::new(), &config);
        let executor = Executor::start(
            SpawnRequest {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "sleep 5".to_string()],
                ..Default::default()
            },
            ExecutorConfig::default(),
        )
        .unwrap();

        let m = test_match(RuleId::ProgressFileCreated);
        controller.handle_match(&m, RuleAction::Track, &executor).await;
        assert_eq!(controller.stage(RuleId::ProgressFileCreated), Stage::None);
        executor.kill(Duration::from_secs(1)).await.unwrap();
    }
}
