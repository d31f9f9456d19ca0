//! Auto-fix loop: pattern-matched strategies applied to validation issues.
//!
//! Strategies are regex-matched per category, tried in confidence order
//! above a minimum gate. A bad strategy is isolated: its error is
//! swallowed and the issue stays unresolved.

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One issue reported by validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub category: String,
    pub message: String,
    pub file: Option<String>,
}

impl ValidationIssue {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
            file: None,
        }
    }
}

/// Context handed to fix functions.
#[derive(Debug, Clone, Default)]
pub struct FixContext {
    pub task_id: String,
    pub metadata: HashMap<String, Value>,
}

/// Result of one applied fix. `remaining` carries issues the fix's
/// verifier still sees; they are fed back into the report.
#[derive(Debug, Clone, Default)]
pub struct FixOutcome {
    pub fixed: bool,
    pub remaining: Vec<ValidationIssue>,
}

type FixFn =
    Arc<dyn Fn(&ValidationIssue, &FixContext) -> std::result::Result<FixOutcome, String> + Send + Sync>;

/// A registered fix strategy.
#[derive(Clone)]
pub struct FixStrategy {
    pub name: String,
    pub category: String,
    pub pattern: Regex,
    pub confidence: f64,
    pub fix: FixFn,
}

impl FixStrategy {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        pattern: Regex,
        confidence: f64,
        fix: impl Fn(&ValidationIssue, &FixContext) -> std::result::Result<FixOutcome, String>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            pattern,
            confidence,
            fix: Arc::new(fix),
        }
    }

    fn matches(&self, issue: &ValidationIssue) -> bool {
        self.category == issue.category && self.pattern.is_match(&issue.message)
    }
}

/// Gates controlling one auto-fix pass.
#[derive(Debug, Clone)]
pub struct AutoFixGates {
    pub enabled: bool,
    pub min_confidence: f64,
    /// Retry suggestions stop once a task has consumed this many passes.
    pub max_attempts: u32,
    /// Passes after which the engine refuses to run for the task.
    pub stuck_limit: u32,
}

impl Default for AutoFixGates {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.5,
            max_attempts: 3,
            stuck_limit: 5,
        }
    }
}

/// Outcome of one auto-fix pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoFixReport {
    pub fixes_applied: usize,
    pub unresolved: Vec<ValidationIssue>,
    pub should_retry: bool,
    /// True when the engine declined to run (disabled or stuck limit).
    pub stuck: bool,
}

/// Per-task counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AutoFixStats {
    pub total_attempts: u32,
    pub total_fixes: u64,
    /// Fixed issues over issues seen, in [0, 1].
    pub success_rate: f64,
}

#[derive(Default)]
struct TaskFixState {
    attempts: u32,
    fixes: u64,
    issues_seen: u64,
}

/// Registry of fix strategies plus per-task attempt accounting.
#[derive(Default)]
pub struct AutoFixEngine {
    strategies: Vec<FixStrategy>,
    state: Mutex<HashMap<String, TaskFixState>>,
}

impl AutoFixEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: FixStrategy) {
        self.strategies.push(strategy);
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }

    /// Run one pass over the validation issues.
    pub fn auto_fix(
        &self,
        task_id: &str,
        issues: Vec<ValidationIssue>,
        ctx: &FixContext,
        gates: &AutoFixGates,
    ) -> AutoFixReport {
        let attempts_so_far = self
            .state
            .lock()
            .get(task_id)
            .map(|s| s.attempts)
            .unwrap_or(0);

        if !gates.enabled || attempts_so_far >= gates.stuck_limit {
            return AutoFixReport {
                fixes_applied: 0,
                unresolved: issues,
                should_retry: false,
                stuck: true,
            };
        }

        let mut fixes_applied = 0usize;
        let mut unresolved: Vec<ValidationIssue> = Vec::new();
        let issue_count = issues.len() as u64;

        for issue in issues {
            // Matching strategies in confidence order, best first.
            let mut candidates: Vec<&FixStrategy> = self
                .strategies
                .iter()
                .filter(|s| s.matches(&issue))
                .collect();
            candidates.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            candidates.retain(|s| s.confidence >= gates.min_confidence);

            let mut fixed = false;
            for strategy in candidates {
                match (strategy.fix)(&issue, ctx) {
                    Ok(outcome) => {
                        // Verifier leftovers are carried forward.
                        unresolved.extend(outcome.remaining);
                        if outcome.fixed {
                            debug!(
                                task_id = %task_id,
                                strategy = %strategy.name,
                                "Fix applied"
                            );
                            fixes_applied += 1;
                            fixed = true;
                            break;
                        }
                    }
                    Err(error) => {
                        // Isolate the bad strategy; the issue stays
                        // unresolved.
                        warn!(
                            task_id = %task_id,
                            strategy = %strategy.name,
                            error = %error,
                            "Fix strategy failed"
                        );
                        break;
                    }
                }
            }

            if !fixed {
                unresolved.push(issue);
            }
        }

        let attempts = {
            let mut state = self.state.lock();
            let entry = state.entry(task_id.to_string()).or_default();
            entry.attempts += 1;
            entry.fixes += fixes_applied as u64;
            entry.issues_seen += issue_count;
            entry.attempts
        };

        let should_retry =
            fixes_applied >= 1 && !unresolved.is_empty() && attempts < gates.max_attempts;

        AutoFixReport {
            fixes_applied,
            unresolved,
            should_retry,
            stuck: false,
        }
    }

    pub fn stats(&self, task_id: &str) -> AutoFixStats {
        let state = self.state.lock();
        match state.get(task_id) {
            Some(s) => AutoFixStats {
                total_attempts: s.attempts,
                total_fixes: s.fixes,
                success_rate: if s.issues_seen == 0 {
                    0.0
                } else {
                    s.fixes as f64 / s.issues_seen as f64
                },
            },
            None => AutoFixStats::default(),
        }
    }

    pub fn clear(&self, task_id: &str) {
        self.state.lock().remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lint_fixer(name: &str, confidence: f64, succeeds: bool) -> FixStrategy {
        FixStrategy::new(
            name,
            "lint",
            Regex::new("unused (import|variable)").unwrap(),
            confidence,
            move |_, _| {
                Ok(FixOutcome {
                    fixed: succeeds,
                    remaining: vec![],
                })
            },
        )
    }

    fn issue(message: &str) -> ValidationIssue {
        ValidationIssue::new("lint", message)
    }

    #[test]
    fn test_fix_applied_and_counted() {
        let mut engine = AutoFixEngine::new();
        engine.register(lint_fixer("remove-unused", 0.9, true));

        let report = engine.auto_fix(
            "t1",
            vec![issue("unused import `foo`"), issue("unused variable `x`")],
            &FixContext::default(),
            &AutoFixGates::default(),
        );

        assert_eq!(report.fixes_applied, 2);
        assert!(report.unresolved.is_empty());
        assert!(!report.should_retry); // nothing left to retry for
        assert!(!report.stuck);

        let stats = engine.stats("t1");
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.total_fixes, 2);
        assert!((stats.success_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unmatched_issue_left_unresolved() {
        let mut engine = AutoFixEngine::new();
        engine.register(lint_fixer("remove-unused", 0.9, true));

        let report = engine.auto_fix(
            "t1",
            vec![issue("syntax error near `}`")],
            &FixContext::default(),
            &AutoFixGates::default(),
        );

        assert_eq!(report.fixes_applied, 0);
        assert_eq!(report.unresolved.len(), 1);
        assert!(!report.should_retry);
    }

    #[test]
    fn test_should_retry_when_partial_progress() {
        let mut engine = AutoFixEngine::new();
        engine.register(lint_fixer("remove-unused", 0.9, true));

        let report = engine.auto_fix(
            "t1",
            vec![issue("unused import `foo`"), issue("something else broke")],
            &FixContext::default(),
            &AutoFixGates::default(),
        );

        assert_eq!(report.fixes_applied, 1);
        assert_eq!(report.unresolved.len(), 1);
        assert!(report.should_retry);
    }

    #[test]
    fn test_min_confidence_gate() {
        let mut engine = AutoFixEngine::new();
        engine.register(lint_fixer("low-confidence", 0.2, true));

        let report = engine.auto_fix(
            "t1",
            vec![issue("unused import `foo`")],
            &FixContext::default(),
            &AutoFixGates::default(),
        );

        assert_eq!(report.fixes_applied, 0);
        assert_eq!(report.unresolved.len(), 1);
    }

    #[test]
    fn test_strategy_error_isolated() {
        let mut engine = AutoFixEngine::new();
        engine.register(FixStrategy::new(
            "panicky",
            "lint",
            Regex::new("unused").unwrap(),
            0.95,
            |_, _| Err("strategy exploded".to_string()),
        ));

        let report = engine.auto_fix(
            "t1",
            vec![issue("unused import `foo`")],
            &FixContext::default(),
            &AutoFixGates::default(),
        );

        assert_eq!(report.fixes_applied, 0);
        assert_eq!(report.unresolved.len(), 1);
        assert!(!report.stuck);
    }

    #[test]
    fn test_higher_confidence_strategy_preferred() {
        let mut engine = AutoFixEngine::new();
        engine.register(lint_fixer("weak", 0.6, false));
        engine.register(lint_fixer("strong", 0.9, true));

        let report = engine.auto_fix(
            "t1",
            vec![issue("unused import `foo`")],
            &FixContext::default(),
            &AutoFixGates::default(),
        );

        // strong tried first and succeeds
        assert_eq!(report.fixes_applied, 1);
    }

    #[test]
    fn test_disabled_reports_stuck() {
        let engine = AutoFixEngine::new();
        let gates = AutoFixGates {
            enabled: false,
            ..Default::default()
        };

        let report = engine.auto_fix(
            "t1",
            vec![issue("unused import `foo`")],
            &FixContext::default(),
            &gates,
        );
        assert!(report.stuck);
        assert!(!report.should_retry);
        assert_eq!(report.unresolved.len(), 1);
    }

    #[test]
    fn test_stuck_limit_stops_engine() {
        let mut engine = AutoFixEngine::new();
        engine.register(lint_fixer("remove-unused", 0.9, true));
        let gates = AutoFixGates {
            stuck_limit: 2,
            max_attempts: 10,
            ..Default::default()
        };

        for _ in 0..2 {
            let report = engine.auto_fix(
                "t1",
                vec![issue("unused import `foo`")],
                &FixContext::default(),
                &gates,
            );
            assert!(!report.stuck);
        }

        let report = engine.auto_fix(
            "t1",
            vec![issue("unused import `foo`")],
            &FixContext::default(),
            &gates,
        );
        assert!(report.stuck);
        assert_eq!(engine.stats("t1").total_attempts, 2);
    }

    #[test]
    fn test_verifier_remaining_carried_forward() {
        let mut engine = AutoFixEngine::new();
        engine.register(FixStrategy::new(
            "fix-with-leftovers",
            "lint",
            Regex::new("unused").unwrap(),
            0.9,
            |_, _| {
                Ok(FixOutcome {
                    fixed: true,
                    remaining: vec![ValidationIssue::new("lint", "follow-up warning")],
                })
            },
        ));

        let report = engine.auto_fix(
            "t1",
            vec![issue("unused import `foo`")],
            &FixContext::default(),
            &AutoFixGates::default(),
        );

        assert_eq!(report.fixes_applied, 1);
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].message, "follow-up warning");
    }
}
