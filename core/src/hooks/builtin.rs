//! Built-in hooks shipped with the supervisor.
//!
//! Each constructor returns a ready-to-register `Hook`; callers wire them
//! into a `HookOrchestrator` alongside whatever custom hooks a deployment
//! adds.

use regex::Regex;
use serde_json::Value;

use super::{Decision, Hook, Phase};
use crate::config::Config;

/// Rejects prompts whose leading verb is not in the configured allow-list,
/// or whose text contains a configured deny-phrase. Expects the payload
/// to be `{"prompt": "..."}`.
pub fn validation_hook(config: &Config) -> Hook {
    let allow_verbs = config.allow_verbs.clone();
    let deny_phrases = config.deny_phrases.clone();
    let leading_verb = Regex::new(r"(?i)^\s*(\w+)").unwrap();

    Hook::new(
        "validation",
        Phase::Validate,
        0,
        Box::new(move |payload: &Value| {
            let prompt = payload
                .get("prompt")
                .and_then(Value::as_str)
                .unwrap_or_default();

            let lower = prompt.to_lowercase();
            for phrase in &deny_phrases {
                if lower.contains(phrase.as_str()) {
                    return Decision::Veto(format!("prompt contains a denied phrase: {phrase}"));
                }
            }

            if let Some(cap) = leading_verb.captures(prompt) {
                let verb = cap[1].to_lowercase();
                if !allow_verbs.iter().any(|v| v == &verb) {
                    return Decision::Veto(format!(
                        "leading verb '{verb}' is not in the allowed action-verb list"
                    ));
                }
            }

            Decision::Continue
        }),
    )
}

/// Replaces a prompt with its decomposition when the prompt qualifies
/// (multiple conjoined independent asks). Actual decomposition logic
/// lives in the orchestrator; this hook only flags candidates by setting
/// `"decompose": true` on the payload so the Supervisor can route it to
/// the Orchestrator instead of spawning a single task directly.
pub fn decomposition_hook() -> Hook {
    let conjunction = Regex::new(r"(?i)\band then\b|\balso\b|\bseparately\b").unwrap();

    Hook::new(
        "decomposition",
        Phase::Request,
        10,
        Box::new(move |payload: &Value| {
            let prompt = payload
                .get("prompt")
                .and_then(Value::as_str)
                .unwrap_or_default();

            if conjunction.is_match(prompt) {
                let mut modified = payload.clone();
                if let Value::Object(ref mut map) = modified {
                    map.insert("decompose".to_string(), Value::Bool(true));
                }
                return Decision::Modify(modified);
            }
            Decision::Continue
        }),
    )
}

/// Wires scanner matches (surfaced at the `Stream` phase as a windowed
/// JSON view) to whatever side channel the caller closes over — typically
/// the Ledger and any notification sinks. Never vetoes or modifies; it
/// only observes.
pub fn monitor_hook(on_window: Box<dyn Fn(&str) + Send + Sync>) -> Hook {
    Hook::new(
        "monitor",
        Phase::Stream,
        0,
        Box::new(move |payload: &Value| {
            if let Some(text) = payload.as_str() {
                on_window(text);
            }
            Decision::Continue
        }),
    )
}

/// Bridges Scanner matches into the Intervention Controller. Registered
/// at the `Stream` phase like `monitor_hook`, but its actual work happens
/// in the closure the caller supplies (typically `Controller::handle_match`
/// invoked from the Scanner's own `on_match` list) — this hook exists so
/// the bridge shows up in the pipeline's ordered view and time-budget
/// accounting like any other observer.
pub fn intervention_bridge_hook(on_window: Box<dyn Fn(&str) + Send + Sync>) -> Hook {
    Hook::new(
        "intervention_bridge",
        Phase::Stream,
        5,
        Box::new(move |payload: &Value| {
            if let Some(text) = payload.as_str() {
                on_window(text);
            }
            Decision::Continue
        }),
    )
}

/// Detects interactive approval prompts (e.g. "Proceed? (y/n)") in the
/// `Stream` phase window and injects an affirmative response via the
/// supplied writer closure. This is the one built-in stream observer that
/// does cause a side effect outside the pipeline (a PTY write) rather than
/// mutating the payload, consistent with `Stream` hooks never touching
/// the stream they observe.
pub fn approval_hook(inject: Box<dyn Fn() + Send + Sync>) -> Hook {
    let prompt = Regex::new(r"(?i)(proceed|continue|confirm)\??\s*\(?\s*y\s*/\s*n\s*\)?\s*$").unwrap();

    Hook::new(
        "approval",
        Phase::Stream,
        1,
        Box::new(move |payload: &Value| {
            if let Some(text) = payload.as_str() {
                if prompt.is_match(text.trim_end()) {
                    inject();
                }
            }
            Decision::Continue
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn decide(hook: &Hook, payload: &Value) -> Decision {
        hook.call(payload)
    }

    #[test]
    fn validation_rejects_disallowed_verb() {
        let config = Config::default();
        let hook = validation_hook(&config);
        let result = decide(&hook, &json!({"prompt": "discuss the architecture"}));
        assert!(matches!(result, Decision::Veto(_)));
    }

    #[test]
    fn validation_allows_known_verb() {
        let config = Config::default();
        let hook = validation_hook(&config);
        let result = decide(&hook, &json!({"prompt": "implement the login form"}));
        assert!(matches!(result, Decision::Continue));
    }

    #[test]
    fn decomposition_flags_conjoined_prompt() {
        let hook = decomposition_hook();
        let result = decide(&hook, &json!({"prompt": "add logging and then write tests"}));
        match result {
            Decision::Modify(v) => assert_eq!(v["decompose"], Value::Bool(true)),
            _ => panic!("expected Modify"),
        }
    }

    #[test]
    fn approval_hook_injects_on_prompt_match() {
        let fired = Arc::new(Mutex::new(false));
        let f = fired.clone();
        let hook = approval_hook(Box::new(move || *f.lock().unwrap() = true));
        decide(&hook, &Value::String("Proceed? (y/n)".to_string()));
        assert!(*fired.lock().unwrap());
    }
}
