//! Escalation policy: promote failing tasks from automated retry toward
//! human intervention.
//!
//! The policy table is evaluated top to bottom; the first matching row
//! wins, so identical inputs always produce identical decisions.

use parking_lot::Mutex;
use std::collections::HashMap;

use agentflow_models::{
    EscalationDecision, EscalationLevel, StuckAssessment, StuckReason, TaskComplexity,
    TaskPriority,
};

use crate::config::EscalationConfig;

/// Inputs to one escalation decision.
#[derive(Debug, Clone)]
pub struct EscalationContext {
    pub task_id: String,
    pub task_priority: TaskPriority,
    pub task_complexity: TaskComplexity,
    pub attempts: u32,
    pub stuck: StuckAssessment,
}

/// Decides between retry, different approach, partial completion and
/// human intervention.
pub struct EscalationEngine {
    config: EscalationConfig,
    history: Mutex<HashMap<String, Vec<EscalationLevel>>>,
}

impl EscalationEngine {
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate the policy table for this context.
    pub fn decide(&self, ctx: &EscalationContext) -> EscalationDecision {
        let history = self.history.lock();
        let past = history.get(&ctx.task_id).cloned().unwrap_or_default();
        drop(history);

        let approaches_tried = past
            .iter()
            .filter(|l| **l == EscalationLevel::DifferentApproach)
            .count() as u32;
        let prior_retry = past.iter().any(|l| *l == EscalationLevel::Retry);
        let exhausted = approaches_tried >= self.config.max_approaches;

        // Fast path: critical task confidently stuck goes straight to a
        // human when fast escalation is on.
        if ctx.task_priority == TaskPriority::Critical
            && ctx.stuck.is_stuck
            && ctx.stuck.confidence >= 0.8
            && self.config.fast_escalation
        {
            return decision(
                EscalationLevel::HumanIntervention,
                "critical task confidently stuck",
                vec!["page the on-call reviewer".to_string()],
            );
        }

        if !ctx.stuck.is_stuck {
            if ctx.attempts <= self.config.max_retries {
                return decision(
                    EscalationLevel::Retry,
                    "not stuck and retry budget remains",
                    vec!["retry with backoff".to_string()],
                );
            }
            return decision(
                EscalationLevel::DifferentApproach,
                "retry budget exhausted without a stall diagnosis",
                vec!["replan with an alternative strategy".to_string()],
            );
        }

        match ctx.stuck.reason {
            Some(StuckReason::IdenticalErrors) => {
                if approaches_tried < self.config.max_approaches {
                    decision(
                        EscalationLevel::DifferentApproach,
                        "identical errors recur; alternatives remain",
                        vec!["switch strategy or provider".to_string()],
                    )
                } else if self.config.allow_partial_completion {
                    let mut d = decision(
                        EscalationLevel::PartialCompletion,
                        "identical errors persist across all approaches",
                        vec!["deliver completed portions".to_string()],
                    );
                    d.requires_human = true;
                    d.can_auto_resolve = false;
                    d
                } else {
                    decision(
                        EscalationLevel::HumanIntervention,
                        "identical errors persist and partial completion is disabled",
                        vec!["hand off with full attempt history".to_string()],
                    )
                }
            }
            Some(StuckReason::NoProgress) => {
                if approaches_tried < self.config.max_approaches {
                    decision(
                        EscalationLevel::DifferentApproach,
                        "no progress; alternatives remain",
                        vec!["decompose the task differently".to_string()],
                    )
                } else if exhausted && !self.config.allow_partial_completion {
                    decision(
                        EscalationLevel::HumanIntervention,
                        "no progress after exhausting approaches",
                        vec!["hand off with full attempt history".to_string()],
                    )
                } else {
                    let mut d = decision(
                        EscalationLevel::PartialCompletion,
                        "no progress after exhausting approaches",
                        vec!["deliver completed portions".to_string()],
                    );
                    d.requires_human = true;
                    d.can_auto_resolve = false;
                    d
                }
            }
            Some(StuckReason::Timeout) => {
                if ctx.task_complexity == TaskComplexity::Epic {
                    decision(
                        EscalationLevel::PartialCompletion,
                        "epic-scale task hit the time ceiling",
                        vec!["checkpoint and deliver completed stages".to_string()],
                    )
                } else {
                    decision(
                        EscalationLevel::HumanIntervention,
                        "task hit the time ceiling",
                        vec!["review scope with a human".to_string()],
                    )
                }
            }
            Some(StuckReason::Oscillating) => {
                if approaches_tried == 0 {
                    decision(
                        EscalationLevel::DifferentApproach,
                        "attempts oscillate between file sets",
                        vec!["pin one direction and retry".to_string()],
                    )
                } else {
                    decision(
                        EscalationLevel::HumanIntervention,
                        "oscillation persists after an approach change",
                        vec!["resolve the conflicting requirements".to_string()],
                    )
                }
            }
            Some(StuckReason::TestFailureLoop) => {
                if !prior_retry {
                    decision(
                        EscalationLevel::Retry,
                        "test failures may be flaky; one retry first",
                        vec!["re-run the failing tests".to_string()],
                    )
                } else {
                    decision(
                        EscalationLevel::HumanIntervention,
                        "test failures persist across retries",
                        vec!["triage the failing tests".to_string()],
                    )
                }
            }
            None => decision(
                EscalationLevel::Retry,
                "stall flagged without a reason; conservative retry",
                vec!["retry with backoff".to_string()],
            ),
        }
    }

    /// Append a decision to the task's history.
    pub fn record_escalation(&self, task_id: &str, level: EscalationLevel) {
        self.history
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .push(level);
    }

    pub fn get_history(&self, task_id: &str) -> Vec<EscalationLevel> {
        self.history.lock().get(task_id).cloned().unwrap_or_default()
    }

    pub fn clear_history(&self, task_id: &str) {
        self.history.lock().remove(task_id);
    }
}

fn decision(level: EscalationLevel, reason: &str, next_steps: Vec<String>) -> EscalationDecision {
    let requires_human = level == EscalationLevel::HumanIntervention;
    EscalationDecision {
        level,
        reason: reason.to_string(),
        actions: Vec::new(),
        suggested_next_steps: next_steps,
        can_auto_resolve: !requires_human,
        requires_human,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EscalationEngine {
        EscalationEngine::new(EscalationConfig {
            max_retries: 3,
            max_approaches: 2,
            allow_partial_completion: false,
            fast_escalation: true,
        })
    }

    fn ctx(task_id: &str, attempts: u32, stuck: StuckAssessment) -> EscalationContext {
        EscalationContext {
            task_id: task_id.to_string(),
            task_priority: TaskPriority::Normal,
            task_complexity: TaskComplexity::Medium,
            attempts,
            stuck,
        }
    }

    fn stuck(reason: StuckReason, confidence: f64) -> StuckAssessment {
        StuckAssessment::stuck(reason, confidence, vec!["evidence".to_string()])
    }

    #[test]
    fn test_critical_stuck_fast_escalates() {
        let engine = engine();
        let mut context = ctx("t1", 2, stuck(StuckReason::IdenticalErrors, 0.9));
        context.task_priority = TaskPriority::Critical;

        let decision = engine.decide(&context);
        assert_eq!(decision.level, EscalationLevel::HumanIntervention);
        assert!(decision.requires_human);
        assert!(!decision.can_auto_resolve);
    }

    #[test]
    fn test_not_stuck_within_budget_retries() {
        let engine = engine();
        let decision = engine.decide(&ctx("t1", 2, StuckAssessment::not_stuck()));
        assert_eq!(decision.level, EscalationLevel::Retry);
        assert!(!decision.requires_human);
    }

    #[test]
    fn test_not_stuck_over_budget_changes_approach() {
        let engine = engine();
        let decision = engine.decide(&ctx("t1", 4, StuckAssessment::not_stuck()));
        assert_eq!(decision.level, EscalationLevel::DifferentApproach);
    }

    #[test]
    fn test_identical_errors_progression() {
        let engine = engine();
        let context = ctx("t1", 3, stuck(StuckReason::IdenticalErrors, 0.9));

        let first = engine.decide(&context);
        assert_eq!(first.level, EscalationLevel::DifferentApproach);
        engine.record_escalation("t1", first.level);
        engine.record_escalation("t1", EscalationLevel::DifferentApproach);

        // Approaches exhausted, partial completion disabled.
        let second = engine.decide(&context);
        assert_eq!(second.level, EscalationLevel::HumanIntervention);
    }

    #[test]
    fn test_identical_errors_partial_completion_when_allowed() {
        let engine = EscalationEngine::new(EscalationConfig {
            allow_partial_completion: true,
            ..EscalationConfig::default()
        });
        let context = ctx("t1", 3, stuck(StuckReason::IdenticalErrors, 0.9));
        engine.record_escalation("t1", EscalationLevel::DifferentApproach);
        engine.record_escalation("t1", EscalationLevel::DifferentApproach);

        let decision = engine.decide(&context);
        assert_eq!(decision.level, EscalationLevel::PartialCompletion);
        assert!(decision.requires_human);
    }

    #[test]
    fn test_timeout_epic_gets_partial_completion() {
        let engine = engine();
        let mut context = ctx("t1", 1, stuck(StuckReason::Timeout, 0.85));
        context.task_complexity = TaskComplexity::Epic;
        assert_eq!(
            engine.decide(&context).level,
            EscalationLevel::PartialCompletion
        );

        context.task_complexity = TaskComplexity::Medium;
        assert_eq!(
            engine.decide(&context).level,
            EscalationLevel::HumanIntervention
        );
    }

    #[test]
    fn test_oscillating_progression() {
        let engine = engine();
        let context = ctx("t1", 2, stuck(StuckReason::Oscillating, 0.7));

        assert_eq!(
            engine.decide(&context).level,
            EscalationLevel::DifferentApproach
        );
        engine.record_escalation("t1", EscalationLevel::DifferentApproach);
        assert_eq!(
            engine.decide(&context).level,
            EscalationLevel::HumanIntervention
        );
    }

    #[test]
    fn test_test_failure_loop_progression() {
        let engine = engine();
        let context = ctx("t1", 2, stuck(StuckReason::TestFailureLoop, 0.8));

        assert_eq!(engine.decide(&context).level, EscalationLevel::Retry);
        engine.record_escalation("t1", EscalationLevel::Retry);
        assert_eq!(
            engine.decide(&context).level,
            EscalationLevel::HumanIntervention
        );
    }

    #[test]
    fn test_decide_deterministic() {
        let engine = engine();
        let context = ctx("t1", 2, stuck(StuckReason::IdenticalErrors, 0.9));
        let a = engine.decide(&context);
        let b = engine.decide(&context);
        assert_eq!(a, b);
    }

    #[test]
    fn test_history_management() {
        let engine = engine();
        engine.record_escalation("t1", EscalationLevel::Retry);
        engine.record_escalation("t1", EscalationLevel::DifferentApproach);

        assert_eq!(engine.get_history("t1").len(), 2);
        engine.clear_history("t1");
        assert!(engine.get_history("t1").is_empty());
    }
}
