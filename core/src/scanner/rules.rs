//! Canonical rule families. Names are normative, identifiers are not —
//! these are the six toxic-pattern families, expressed as `regex`-backed
//! `PatternRule`s evaluated line-by-line.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Stable identifier for a rule. Ordering (`Ord`) gives the tie-break used
/// when two rules fire with equal priority: ascending by this enum's
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RuleId {
    FalseCompletion,
    PlanningStall,
    ResearchLoop,
    AnalysisParalysis,
    EmptyTodo,
    ProgressFileCreated,
    ProgressTestPassed,
    ProgressCodeBlock,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::FalseCompletion => "false_completion",
            RuleId::PlanningStall => "planning_stall",
            RuleId::ResearchLoop => "research_loop",
            RuleId::AnalysisParalysis => "analysis_paralysis",
            RuleId::EmptyTodo => "empty_todo",
            RuleId::ProgressFileCreated => "progress_file_created",
            RuleId::ProgressTestPassed => "progress_test_passed",
            RuleId::ProgressCodeBlock => "progress_code_block",
        }
    }

    /// Whether this family is suppressed while inside a fenced code block:
    /// planning stall and research loop are suppressed in code blocks;
    /// false completion is not.
    pub fn suppressed_in_code_block(&self) -> bool {
        matches!(self, RuleId::PlanningStall | RuleId::ResearchLoop)
    }

    pub fn is_progress_signal(&self) -> bool {
        matches!(
            self,
            RuleId::ProgressFileCreated | RuleId::ProgressTestPassed | RuleId::ProgressCodeBlock
        )
    }
}

/// What the Intervention Controller should do when a rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Warn,
    InterruptAndInject,
    Escalate,
    Track,
}

/// A single rule: `(id, matcher, action, priority, cooldown, scope)`.
pub struct PatternRule {
    pub id: RuleId,
    pub action: RuleAction,
    /// Total order; ties broken by `RuleId`'s `Ord` (ascending).
    pub priority: u8,
    pub cooldown: Duration,
    matcher: Regex,
}

impl PatternRule {
    pub fn is_match(&self, line: &str) -> bool {
        self.matcher.is_match(line)
    }
}

fn rule(id: RuleId, action: RuleAction, priority: u8, cooldown_secs: u64, pattern: &str) -> PatternRule {
    PatternRule {
        id,
        action,
        priority,
        cooldown: Duration::from_secs(cooldown_secs),
        matcher: Regex::new(pattern).expect("built-in rule pattern must compile"),
    }
}

/// Deterministic evaluation order: `(priority desc, rule_id asc)`.
pub fn evaluation_order(rules: &mut [PatternRule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
}

/// Builds the six canonical rule families plus their per-family cooldowns
/// and priorities. Progress signals are tracked (lowest priority, `Track`
/// action); false completion outranks the stall families since unverified
/// completion claims are the highest-value signal to intercept before the
/// task exits.
pub fn default_rules() -> Vec<PatternRule> {
    let mut rules = vec![
        rule(
            RuleId::FalseCompletion,
            RuleAction::InterruptAndInject,
            100,
            5,
            r"(?i)\b(i('ve| have)|task is|this is|everything is|all)\s+(successfully\s+)?(completed?|done|finished|implemented)\b",
        ),
        rule(
            RuleId::PlanningStall,
            RuleAction::InterruptAndInject,
            80,
            5,
            r"(?i)\b(i will|i'll|let me)\s+(plan|outline|first\s+(i\s+will|i'll)|design|think through|map out)\b",
        ),
        rule(
            RuleId::ResearchLoop,
            RuleAction::InterruptAndInject,
            80,
            5,
            r"(?i)\b(let me|i need to|i('ll| will))\s+(explore|research|investigate|look into|study)\s+(more|further|deeper)?\b",
        ),
        rule(
            RuleId::AnalysisParalysis,
            RuleAction::InterruptAndInject,
            70,
            5,
            r"(?i)\b(option\s+[0-9a-c]|alternative(ly)?|on one hand|on the other hand|we could (either|also))\b",
        ),
        rule(
            RuleId::EmptyTodo,
            RuleAction::Escalate,
            60,
            5,
            r"(?i)\bTODO\b",
        ),
        rule(
            RuleId::ProgressFileCreated,
            RuleAction::Track,
            10,
            0,
            r"(?i)\b(created?|wrote|writing)\s+(file\s+)?[\w./\\-]+\.\w+\b",
        ),
        rule(
            RuleId::ProgressTestPassed,
            RuleAction::Track,
            10,
            0,
            r"(?i)\b(\d+\s+)?tests?\s+(passed|pass(ed)?|succeeded)\b",
        ),
        rule(
            RuleId::ProgressCodeBlock,
            RuleAction::Track,
            10,
            0,
            r"^```",
        ),
    ];
    evaluation_order(&mut rules);
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_order_is_priority_desc_then_id_asc() {
        let rules = default_rules();
        for window in rules.windows(2) {
            let (a, b) = (&window[0], &window[1]);
            assert!(a.priority > b.priority || (a.priority == b.priority && a.id <= b.id));
        }
    }

    #[test]
    fn planning_stall_matches_canonical_phrase() {
        let rules = default_rules();
        let rule = rules.iter().find(|r| r.id == RuleId::PlanningStall).unwrap();
        assert!(rule.is_match("Let me plan the approach first..."));
        assert!(!rule.is_match("I created hello.py"));
    }

    #[test]
    fn false_completion_matches_self_congratulation() {
        let rules = default_rules();
        let rule = rules
            .iter()
            .find(|r| r.id == RuleId::FalseCompletion)
            .unwrap();
        assert!(rule.is_match("I've successfully completed the task"));
    }
}
