//! C2 Pattern Scanner: detects toxic or progress-relevant patterns in a
//! child's output in real time.
//!
//! Grounded on `vte_backend.rs`'s VTE-based approach to VT parsing (reused
//! here for ANSI stripping rather than cursor tracking) and on
//! `ProcessManager::Utf8Decoder`'s incremental, boundary-safe decoding
//! style.

mod ansi;
pub mod rules;

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::ids::ExecutionId;
use ansi::AnsiStripper;
pub use rules::{default_rules, PatternRule, RuleAction, RuleId};

/// A fired match, ready to be handed to the Intervention Controller.
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub id: String,
    pub rule_id: RuleId,
    pub execution_id: ExecutionId,
    pub position_range: Range<u64>,
    pub ts: DateTime<Utc>,
    pub extracted_context: String,
}

struct PendingTodo {
    position: u64,
    context: String,
    deadline_line: u64,
}

struct ScannerState {
    ansi: AnsiStripper,
    line_partial: String,
    byte_pos: u64,
    line_no: u64,
    window: VecDeque<u8>,
    window_start_pos: u64,
    cooldowns: HashMap<RuleId, Instant>,
    code_block_open: bool,
    pending_todos: Vec<PendingTodo>,
}

/// Per-execution, single-threaded pattern scanner, owned exclusively by
/// one `Execution`.
pub struct Scanner {
    execution_id: ExecutionId,
    rules: Vec<PatternRule>,
    window_max: usize,
    context_bytes: usize,
    todo_lookahead_lines: u64,
    concrete_output: Regex,
    state: Mutex<ScannerState>,
    on_match: RwLock<Vec<Box<dyn Fn(Match) + Send + Sync>>>,
}

impl Scanner {
    pub fn new(execution_id: ExecutionId, window_max: usize, context_bytes: usize) -> Self {
        Self {
            execution_id,
            rules: default_rules(),
            window_max,
            context_bytes,
            todo_lookahead_lines: 10,
            concrete_output: Regex::new(
                r"(?i)^```|created?\s+(file\s+)?[\w./\\-]+\.\w+|^\s*(fn|def|class|function)\s",
            )
            .expect("concrete-output lookahead pattern must compile"),
            state: Mutex::new(ScannerState {
                ansi: AnsiStripper::new(),
                line_partial: String::new(),
                byte_pos: 0,
                line_no: 0,
                window: VecDeque::new(),
                window_start_pos: 0,
                cooldowns: HashMap::new(),
                code_block_open: false,
                pending_todos: Vec::new(),
            }),
            on_match: RwLock::new(Vec::new()),
        }
    }

    /// `on_match(fn)`: fires `Match` events as rules trip.
    pub fn on_match(&self, handler: Box<dyn Fn(Match) + Send + Sync>) {
        self.on_match.write().unwrap().push(handler);
    }

    /// `append(bytes)`: extends the internal sliding window, strips ANSI
    /// control sequences from the matching view, and evaluates complete
    /// lines as they form. Partial UTF-8 sequences at the boundary are
    /// implicitly held by the ANSI stripper's underlying `vte::Parser`.
    pub fn append(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let plain = state.ansi.feed(bytes);
        if plain.is_empty() {
            return;
        }

        self.push_window(&mut state, &plain);
        state.line_partial.push_str(&String::from_utf8_lossy(&plain));

        let mut fired = Vec::new();
        while let Some(idx) = state.line_partial.find('\n') {
            let raw_line: String = state.line_partial.drain(..=idx).collect();
            let line = raw_line.trim_end_matches(['\n', '\r']);
            self.process_line(&mut state, line, &mut fired);
        }
        drop(state);

        let handlers = self.on_match.read().unwrap();
        for m in fired {
            for h in handlers.iter() {
                h(m.clone());
            }
        }
    }

    fn push_window(&self, state: &mut ScannerState, plain: &[u8]) {
        state.window.extend(plain.iter().copied());
        while state.window.len() > self.window_max {
            state.window.pop_front();
            state.window_start_pos += 1;
        }
    }

    fn process_line(&self, state: &mut ScannerState, line: &str, fired: &mut Vec<Match>) {
        let line_start = state.byte_pos;
        state.byte_pos += line.len() as u64 + 1; // +1 for the newline consumed
        state.line_no += 1;
        let line_no = state.line_no;

        // Evaluate pending EmptyTodo lookaheads first: concrete output on
        // this line satisfies any still-open pending entries.
        if !state.pending_todos.is_empty() && self.concrete_output.is_match(line) {
            state.pending_todos.clear();
        }
        let expired: Vec<PendingTodo> = {
            let (expired, still_pending): (Vec<_>, Vec<_>) = state
                .pending_todos
                .drain(..)
                .partition(|p| line_no > p.deadline_line);
            state.pending_todos = still_pending;
            expired
        };
        for p in expired {
            fired.push(Match {
                id: uuid::Uuid::new_v4().to_string(),
                rule_id: RuleId::EmptyTodo,
                execution_id: self.execution_id.clone(),
                position_range: p.position..p.position,
                ts: Utc::now(),
                extracted_context: p.context,
            });
        }

        let was_code_block = state.code_block_open;

        for rule in &self.rules {
            if rule.id.suppressed_in_code_block() && was_code_block {
                continue;
            }
            if !rule.is_match(line) {
                continue;
            }

            if rule.id == RuleId::EmptyTodo {
                state.pending_todos.push(PendingTodo {
                    position: line_start,
                    context: self.context_excerpt(state, line_start),
                    deadline_line: line_no + self.todo_lookahead_lines,
                });
                continue;
            }

            if self.is_on_cooldown(state, rule) {
                continue; // suppressed by cooldown, counted but does not fire
            }
            state.cooldowns.insert(rule.id, Instant::now());

            fired.push(Match {
                id: uuid::Uuid::new_v4().to_string(),
                rule_id: rule.id,
                execution_id: self.execution_id.clone(),
                position_range: line_start..(line_start + line.len() as u64),
                ts: Utc::now(),
                extracted_context: self.context_excerpt(state, line_start),
            });
        }

        // Toggle fence state after evaluating this line so the opener
        // itself is never treated as "inside" the block.
        if line.trim_start().starts_with("```") {
            state.code_block_open = !state.code_block_open;
        }
    }

    fn is_on_cooldown(&self, state: &ScannerState, rule: &PatternRule) -> bool {
        match state.cooldowns.get(&rule.id) {
            Some(last) => last.elapsed() < rule.cooldown,
            None => false,
        }
    }

    fn context_excerpt(&self, state: &ScannerState, position: u64) -> String {
        if position < state.window_start_pos {
            return String::new();
        }
        let rel = (position - state.window_start_pos) as usize;
        let start = rel.saturating_sub(self.context_bytes);
        let end = (rel + self.context_bytes).min(state.window.len());
        let bytes: Vec<u8> = state.window.iter().skip(start).take(end - start).copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    fn collecting_scanner() -> (Scanner, Arc<StdMutex<Vec<Match>>>) {
        let scanner = Scanner::new(ExecutionId::new(), 64 * 1024, 256);
        let collected = Arc::new(StdMutex::new(Vec::new()));
        let sink = collected.clone();
        scanner.on_match(Box::new(move |m| sink.lock().unwrap().push(m)));
        (scanner, collected)
    }

    #[test]
    fn fires_planning_stall_on_complete_line() {
        let (scanner, matches) = collecting_scanner();
        scanner.append(b"Let me plan the approach first...\n");
        let matches = matches.lock().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_id, RuleId::PlanningStall);
    }

    #[test]
    fn cooldown_suppresses_repeated_fires() {
        let (scanner, matches) = collecting_scanner();
        scanner.append(b"Let me plan the approach.\n");
        scanner.append(b"Let me plan the approach.\n");
        assert_eq!(matches.lock().unwrap().len(), 1);
    }

    #[test]
    fn planning_stall_suppressed_inside_code_block() {
        let (scanner, matches) = collecting_scanner();
        scanner.append(b"```\n");
        scanner.append(b"let me plan this differently\n");
        scanner.append(b"```\n");
        assert!(matches.lock().unwrap().is_empty());
    }

    #[test]
    fn false_completion_not_suppressed_inside_code_block() {
        let (scanner, matches) = collecting_scanner();
        scanner.append(b"```\n");
        scanner.append(b"I've successfully completed the task\n");
        scanner.append(b"```\n");
        assert_eq!(matches.lock().unwrap().len(), 1);
    }

    #[test]
    fn ansi_sequences_are_stripped_before_matching() {
        let (scanner, matches) = collecting_scanner();
        scanner.append(b"\x1b[1mLet me plan\x1b[0m the approach\n");
        assert_eq!(matches.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_todo_fires_without_concrete_followup() {
        let (scanner, matches) = collecting_scanner();
        scanner.append(b"// TODO: implement this\n");
        for i in 0..11 {
            scanner.append(format!("filler line {i}\n").as_bytes());
        }
        let matches = matches.lock().unwrap();
        assert!(matches.iter().any(|m| m.rule_id == RuleId::EmptyTodo));
    }

    #[test]
    fn empty_todo_suppressed_by_concrete_followup() {
        let (scanner, matches) = collecting_scanner();
        scanner.append(b"// TODO: implement this\n");
        scanner.append(b"created file hello.py\n");
        for i in 0..11 {
            scanner.append(format!("filler line {i}\n").as_bytes());
        }
        let matches = matches.lock().unwrap();
        assert!(!matches.iter().any(|m| m.rule_id == RuleId::EmptyTodo));
    }
}
