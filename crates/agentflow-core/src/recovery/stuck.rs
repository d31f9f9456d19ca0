//! Stuck detection over per-task attempt histories.
//!
//! Classifies stalls by reason with a confidence score and supporting
//! evidence. Error signatures are normalized (lowercased, digit and hex
//! runs collapsed) so "port 8080 refused" and "port 9090 refused" count
//! as the same failure.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;

use agentflow_models::{
    AttemptOutcome, AttemptRecord, StuckAssessment, StuckReason, now_millis,
};

/// Detection thresholds.
#[derive(Debug, Clone)]
pub struct StuckDetectorConfig {
    /// Identical normalized errors to flag `IdenticalErrors`. Default 3.
    pub identical_error_threshold: usize,
    /// Consecutive attempts without touched files to flag `NoProgress`.
    pub no_progress_threshold: usize,
    /// Test-failure attempts to flag `TestFailureLoop`. Default 2.
    pub test_failure_threshold: usize,
    /// Wall-clock ceiling since the first attempt, in milliseconds.
    pub timeout_ms: i64,
    /// Recent attempts examined per analysis.
    pub window_size: usize,
}

impl Default for StuckDetectorConfig {
    fn default() -> Self {
        Self {
            identical_error_threshold: 3,
            no_progress_threshold: 3,
            test_failure_threshold: 2,
            timeout_ms: 30 * 60 * 1_000,
            window_size: 10,
        }
    }
}

/// Tracks attempt history and classifies stalls.
pub struct StuckDetector {
    config: StuckDetectorConfig,
    history: Mutex<HashMap<String, Vec<AttemptRecord>>>,
    digit_runs: Regex,
    hex_runs: Regex,
}

impl StuckDetector {
    pub fn new(config: StuckDetectorConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
            digit_runs: Regex::new(r"\d+").expect("static regex"),
            hex_runs: Regex::new(r"0x[0-9a-f]+").expect("static regex"),
        }
    }

    /// Collapse volatile fragments so recurring errors compare equal.
    pub fn normalize_signature(&self, error: &str) -> String {
        let lower = error.to_lowercase();
        let no_hex = self.hex_runs.replace_all(&lower, "#");
        let collapsed = self.digit_runs.replace_all(&no_hex, "#");
        collapsed.trim().to_string()
    }

    /// Record an attempt; the signature is normalized on the way in.
    pub fn record_attempt(
        &self,
        task_id: &str,
        outcome: AttemptOutcome,
        error: Option<&str>,
        files_touched: Vec<String>,
    ) {
        let mut history = self.history.lock();
        let attempts = history.entry(task_id.to_string()).or_default();
        let record = AttemptRecord {
            task_id: task_id.to_string(),
            attempt_number: attempts.len() as u32 + 1,
            timestamp: now_millis(),
            outcome,
            error_signature: error.map(|e| self.normalize_signature(e)),
            files_touched,
        };
        attempts.push(record);
    }

    pub fn attempt_history(&self, task_id: &str) -> Vec<AttemptRecord> {
        self.history.lock().get(task_id).cloned().unwrap_or_default()
    }

    pub fn clear(&self, task_id: &str) {
        self.history.lock().remove(task_id);
    }

    /// Classify the task's recent attempts. Signals are evaluated in a
    /// fixed order, so identical inputs produce identical verdicts.
    pub fn analyze(&self, task_id: &str) -> StuckAssessment {
        let history = self.history.lock();
        let Some(attempts) = history.get(task_id) else {
            return StuckAssessment::not_stuck();
        };
        let window: Vec<&AttemptRecord> = attempts
            .iter()
            .rev()
            .take(self.config.window_size)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if window.is_empty() {
            return StuckAssessment::not_stuck();
        }

        if let Some(assessment) = self.check_identical_errors(&window) {
            return assessment;
        }
        if let Some(assessment) = self.check_no_progress(&window) {
            return assessment;
        }
        if let Some(assessment) = self.check_timeout(&window) {
            return assessment;
        }
        if let Some(assessment) = self.check_oscillating(&window) {
            return assessment;
        }
        if let Some(assessment) = self.check_test_failure_loop(&window) {
            return assessment;
        }

        StuckAssessment::not_stuck()
    }

    fn check_identical_errors(&self, window: &[&AttemptRecord]) -> Option<StuckAssessment> {
        let threshold = self.config.identical_error_threshold;
        if window.len() < threshold {
            return None;
        }

        let tail = &window[window.len() - threshold..];
        let signature = tail.last()?.error_signature.as_ref()?;
        let all_same = tail
            .iter()
            .all(|a| a.error_signature.as_deref() == Some(signature));

        if all_same {
            Some(StuckAssessment::stuck(
                StuckReason::IdenticalErrors,
                0.9,
                vec![format!(
                    "last {threshold} attempts failed with: {signature}"
                )],
            ))
        } else {
            None
        }
    }

    fn check_no_progress(&self, window: &[&AttemptRecord]) -> Option<StuckAssessment> {
        let threshold = self.config.no_progress_threshold;
        if window.len() < threshold {
            return None;
        }

        let tail = &window[window.len() - threshold..];
        let none_touched = tail.iter().all(|a| a.files_touched.is_empty());
        if none_touched {
            Some(StuckAssessment::stuck(
                StuckReason::NoProgress,
                0.75,
                vec![format!("{threshold} consecutive attempts touched no files")],
            ))
        } else {
            None
        }
    }

    fn check_timeout(&self, window: &[&AttemptRecord]) -> Option<StuckAssessment> {
        let first = window.first()?;
        let elapsed = now_millis() - first.timestamp;
        if elapsed > self.config.timeout_ms {
            Some(StuckAssessment::stuck(
                StuckReason::Timeout,
                0.85,
                vec![format!(
                    "elapsed {elapsed}ms exceeds ceiling {}ms",
                    self.config.timeout_ms
                )],
            ))
        } else {
            None
        }
    }

    fn check_oscillating(&self, window: &[&AttemptRecord]) -> Option<StuckAssessment> {
        // A, B, A, B: each attempt repeats the file set from two back
        // while differing from its neighbor.
        if window.len() < 4 {
            return None;
        }
        let tail = &window[window.len() - 4..];

        let sets: Vec<Vec<&String>> = tail
            .iter()
            .map(|a| {
                let mut files: Vec<&String> = a.files_touched.iter().collect();
                files.sort();
                files
            })
            .collect();

        let alternating = sets[0] == sets[2]
            && sets[1] == sets[3]
            && sets[0] != sets[1]
            && !sets[0].is_empty()
            && !sets[1].is_empty();

        if alternating {
            Some(StuckAssessment::stuck(
                StuckReason::Oscillating,
                0.7,
                vec!["attempts alternate between two file sets".to_string()],
            ))
        } else {
            None
        }
    }

    fn check_test_failure_loop(&self, window: &[&AttemptRecord]) -> Option<StuckAssessment> {
        let threshold = self.config.test_failure_threshold;
        let test_failures: Vec<&&AttemptRecord> = window
            .iter()
            .filter(|a| {
                a.outcome == AttemptOutcome::Failure
                    && a.error_signature
                        .as_deref()
                        .is_some_and(|s| s.contains("test"))
            })
            .collect();

        let only_test_failures = window
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Failure)
            .count()
            == test_failures.len();

        if test_failures.len() >= threshold && only_test_failures {
            Some(StuckAssessment::stuck(
                StuckReason::TestFailureLoop,
                0.8,
                vec![format!("{} test-failure attempts", test_failures.len())],
            ))
        } else {
            None
        }
    }
}
