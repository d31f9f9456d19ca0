//! Merge coordinator - folds parallel worker changes back into the base.
//!
//! Conflicts are resolved in preference order: identical contents merge
//! silently, strict supersets win with high confidence, high-risk paths
//! and oversized diffs go to manual review, and close variants get a
//! structural line merge. Everything else falls back to manual review or
//! the optional AI resolution hook.

use glob::Pattern;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::MergeConfig;

/// File map produced by one worker: path -> full content.
#[derive(Debug, Clone, Default)]
pub struct WorkerChanges {
    pub worker_id: String,
    pub files: HashMap<String, String>,
}

impl WorkerChanges {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            files: HashMap::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }
}

/// How a conflict was (or was not) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// One side strictly contained the other; the superset won.
    Theirs,
    /// Line-wise structural merge of close variants.
    Structural,
    /// Resolved by the AI hook.
    Ai,
    /// Deferred to manual review.
    Manual,
}

/// One detected conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInfo {
    pub path: String,
    pub workers: Vec<String>,
    pub resolution: Resolution,
    pub requires_review: bool,
    pub confidence: f64,
}

/// Outcome of one merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub merged: HashMap<String, String>,
    pub conflicts: Vec<ConflictInfo>,
    /// Conflict path -> chosen resolution.
    pub strategies: HashMap<String, Resolution>,
    pub auto_resolved: usize,
    pub manual_review_required: usize,
    pub success: bool,
}

/// Rolling counters across merges.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MergeMetrics {
    pub total_merges: u64,
    pub auto_merges: u64,
    pub manual_merges: u64,
    pub auto_resolution_rate: f64,
    pub avg_conflicts_per_merge: f64,
    pub avg_resolution_time_ms: f64,
}

/// Last-resort resolution hook, typically backed by an LLM.
pub trait MergeResolver: Send + Sync {
    fn resolve(&self, path: &str, base: Option<&str>, variants: &[&str]) -> Option<String>;
}

#[derive(Default)]
struct MetricsState {
    total_merges: u64,
    auto_merges: u64,
    manual_merges: u64,
    total_conflicts: u64,
    total_time_ms: u64,
}

/// Reconciles concurrent worker changes into a single consistent base.
pub struct MergeCoordinator {
    config: MergeConfig,
    high_risk: Vec<Pattern>,
    resolver: Option<Box<dyn MergeResolver>>,
    metrics: Mutex<MetricsState>,
}

impl MergeCoordinator {
    pub fn new(config: MergeConfig) -> Self {
        let high_risk = config
            .high_risk_globs
            .iter()
            .filter_map(|g| match Pattern::new(g) {
                Ok(pattern) => Some(pattern),
                Err(error) => {
                    warn!(glob = %g, error = %error, "Ignoring invalid high-risk glob");
                    None
                }
            })
            .collect();
        Self {
            config,
            high_risk,
            resolver: None,
            metrics: Mutex::new(MetricsState::default()),
        }
    }

    /// Attach the AI resolution hook consulted as the final fallback.
    pub fn with_resolver(mut self, resolver: Box<dyn MergeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Merge N workers' file maps over the base snapshot.
    pub fn merge(&self, base: &HashMap<String, String>, workers: &[WorkerChanges]) -> MergeResult {
        let started = Instant::now();

        let mut merged = base.clone();
        let mut conflicts: Vec<ConflictInfo> = Vec::new();
        let mut strategies: HashMap<String, Resolution> = HashMap::new();
        let mut auto_resolved = 0usize;
        let mut manual_review_required = 0usize;
        let mut success = true;

        // path -> [(worker, content)] in deterministic order
        let mut touched: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
        for worker in workers {
            for (path, content) in &worker.files {
                touched
                    .entry(path.as_str())
                    .or_default()
                    .push((worker.worker_id.as_str(), content.as_str()));
            }
        }

        for (path, versions) in touched {
            let distinct: BTreeSet<&str> = versions.iter().map(|(_, c)| *c).collect();

            // Single writer, or everyone wrote the same bytes.
            if distinct.len() == 1 {
                merged.insert(path.to_string(), versions[0].1.to_string());
                continue;
            }

            let workers_involved: Vec<String> =
                versions.iter().map(|(w, _)| w.to_string()).collect();
            let variants: Vec<&str> = distinct.into_iter().collect();

            let (resolution, resolved_content, confidence) =
                self.resolve_conflict(path, base.get(path).map(String::as_str), &variants);

            let requires_review = resolution == Resolution::Manual;
            if requires_review {
                manual_review_required += 1;
                if self.is_high_risk(path) {
                    success = false;
                }
            } else {
                auto_resolved += 1;
                if let Some(content) = resolved_content {
                    merged.insert(path.to_string(), content);
                }
            }

            strategies.insert(path.to_string(), resolution);
            conflicts.push(ConflictInfo {
                path: path.to_string(),
                workers: workers_involved,
                resolution,
                requires_review,
                confidence,
            });
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        {
            let mut metrics = self.metrics.lock();
            metrics.total_merges += 1;
            if manual_review_required == 0 {
                metrics.auto_merges += 1;
            } else {
                metrics.manual_merges += 1;
            }
            metrics.total_conflicts += conflicts.len() as u64;
            metrics.total_time_ms += elapsed_ms;
        }

        debug!(
            conflicts = conflicts.len(),
            auto_resolved, manual_review_required, "Merge completed"
        );

        MergeResult {
            merged,
            conflicts,
            strategies,
            auto_resolved,
            manual_review_required,
            success,
        }
    }

    fn resolve_conflict(
        &self,
        path: &str,
        base: Option<&str>,
        variants: &[&str],
    ) -> (Resolution, Option<String>, f64) {
        // Superset: one variant strictly contains every other.
        if let Some(superset) = find_superset(variants) {
            return (Resolution::Theirs, Some(superset.to_string()), 0.9);
        }

        // High-risk paths always go to a human.
        if self.is_high_risk(path) {
            return (Resolution::Manual, None, 1.0);
        }

        // Oversized diffs on either side defeat automatic resolution.
        let base_text = base.unwrap_or("");
        let oversized = variants
            .iter()
            .any(|v| changed_lines(base_text, v) > self.config.max_auto_resolve_lines);
        if oversized {
            return (Resolution::Manual, None, 0.6);
        }

        // Structural merge of two close variants.
        if self.config.enable_ai_resolution && variants.len() == 2 {
            let similarity = line_similarity(variants[0], variants[1]);
            if similarity >= self.config.semantic_similarity_threshold {
                let merged = line_union_merge(variants[0], variants[1]);
                return (Resolution::Structural, Some(merged), similarity);
            }
        }

        // Final fallback: the AI hook when enabled, else manual review.
        if self.config.enable_ai_resolution
            && let Some(resolver) = &self.resolver
            && let Some(content) = resolver.resolve(path, base, variants)
        {
            return (Resolution::Ai, Some(content), 0.5);
        }

        (Resolution::Manual, None, 0.5)
    }

    fn is_high_risk(&self, path: &str) -> bool {
        self.high_risk.iter().any(|p| p.matches(path))
    }

    pub fn metrics(&self) -> MergeMetrics {
        let state = self.metrics.lock();
        let total = state.total_merges;
        MergeMetrics {
            total_merges: total,
            auto_merges: state.auto_merges,
            manual_merges: state.manual_merges,
            auto_resolution_rate: if total == 0 {
                0.0
            } else {
                state.auto_merges as f64 / total as f64
            },
            avg_conflicts_per_merge: if total == 0 {
                0.0
            } else {
                state.total_conflicts as f64 / total as f64
            },
            avg_resolution_time_ms: if total == 0 {
                0.0
            } else {
                state.total_time_ms as f64 / total as f64
            },
        }
    }
}

/// One variant strictly containing all others, if any.
fn find_superset<'a>(variants: &[&'a str]) -> Option<&'a str> {
    variants.iter().copied().find(|candidate| {
        variants
            .iter()
            .all(|other| candidate.contains(other) && (candidate.len() > other.len() || candidate == other))
    })
}

/// Lines differing from the base, counted on both sides.
fn changed_lines(base: &str, variant: &str) -> usize {
    let base_lines: BTreeSet<&str> = base.lines().collect();
    let variant_lines: BTreeSet<&str> = variant.lines().collect();
    let added = variant_lines.difference(&base_lines).count();
    let removed = base_lines.difference(&variant_lines).count();
    added + removed
}

/// Shared-line ratio in [0, 1].
fn line_similarity(a: &str, b: &str) -> f64 {
    let a_lines: BTreeSet<&str> = a.lines().collect();
    let b_lines: BTreeSet<&str> = b.lines().collect();
    if a_lines.is_empty() && b_lines.is_empty() {
        return 1.0;
    }
    let shared = a_lines.intersection(&b_lines).count();
    let largest = a_lines.len().max(b_lines.len());
    shared as f64 / largest as f64
}

/// Line-wise union: all of `a`, then lines of `b` not already present.
fn line_union_merge(a: &str, b: &str) -> String {
    let a_lines: BTreeSet<&str> = a.lines().collect();
    let mut merged: Vec<&str> = a.lines().collect();
    merged.extend(b.lines().filter(|line| !a_lines.contains(line)));
    merged.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> MergeCoordinator {
        MergeCoordinator::new(MergeConfig::default())
    }

    fn base() -> HashMap<String, String> {
        HashMap::from([("src/lib.rs".to_string(), "fn a() {}\n".to_string())])
    }

    #[test]
    fn test_disjoint_changes_merge_cleanly() {
        let coordinator = coordinator();
        let workers = vec![
            WorkerChanges::new("w1").with_file("src/a.rs", "mod a;"),
            WorkerChanges::new("w2").with_file("src/b.rs", "mod b;"),
        ];

        let result = coordinator.merge(&base(), &workers);
        assert!(result.success);
        assert!(result.conflicts.is_empty());
        assert_eq!(result.merged.get("src/a.rs").unwrap(), "mod a;");
        assert_eq!(result.merged.get("src/b.rs").unwrap(), "mod b;");
        // Base entries survive untouched.
        assert!(result.merged.contains_key("src/lib.rs"));
    }

    #[test]
    fn test_identical_contents_no_conflict() {
        let coordinator = coordinator();
        let workers = vec![
            WorkerChanges::new("w1").with_file("src/lib.rs", "fn a() {}\nfn b() {}\n"),
            WorkerChanges::new("w2").with_file("src/lib.rs", "fn a() {}\nfn b() {}\n"),
        ];

        let result = coordinator.merge(&base(), &workers);
        assert!(result.success);
        assert!(result.conflicts.is_empty());
        assert_eq!(result.auto_resolved, 0);
        assert_eq!(
            result.merged.get("src/lib.rs").unwrap(),
            "fn a() {}\nfn b() {}\n"
        );
    }

    #[test]
    fn test_superset_wins_with_high_confidence() {
        let coordinator = coordinator();
        let short = "fn a() {}\n";
        let long = "fn a() {}\nfn b() {}\n";
        let workers = vec![
            WorkerChanges::new("w1").with_file("src/lib.rs", short),
            WorkerChanges::new("w2").with_file("src/lib.rs", long),
        ];

        let result = coordinator.merge(&base(), &workers);
        assert!(result.success);
        assert_eq!(result.auto_resolved, 1);
        assert_eq!(result.conflicts.len(), 1);

        let conflict = &result.conflicts[0];
        assert_eq!(conflict.resolution, Resolution::Theirs);
        assert!(conflict.confidence >= 0.9);
        assert_eq!(result.merged.get("src/lib.rs").unwrap(), long);
        assert_eq!(result.strategies["src/lib.rs"], Resolution::Theirs);
    }

    #[test]
    fn test_high_risk_path_forces_manual_review() {
        let coordinator = coordinator();
        let workers = vec![
            WorkerChanges::new("w1").with_file("api/security/auth.rs", "grant_all();"),
            WorkerChanges::new("w2").with_file("api/security/auth.rs", "deny_all();"),
        ];

        let result = coordinator.merge(&HashMap::new(), &workers);
        assert!(!result.success);
        assert_eq!(result.manual_review_required, 1);

        let conflict = &result.conflicts[0];
        assert_eq!(conflict.resolution, Resolution::Manual);
        assert!(conflict.requires_review);
        // Unresolved content never lands in the merged map.
        assert!(!result.merged.contains_key("api/security/auth.rs"));
    }

    #[test]
    fn test_env_glob_matches_dotfiles() {
        let coordinator = coordinator();
        let workers = vec![
            WorkerChanges::new("w1").with_file(".env.production", "KEY=a"),
            WorkerChanges::new("w2").with_file(".env.production", "KEY=b"),
        ];

        let result = coordinator.merge(&HashMap::new(), &workers);
        assert!(!result.success);
        assert_eq!(result.conflicts[0].resolution, Resolution::Manual);
    }

    #[test]
    fn test_large_conflict_goes_manual() {
        let coordinator = MergeCoordinator::new(MergeConfig {
            max_auto_resolve_lines: 3,
            ..MergeConfig::default()
        });

        let many_lines: String = (0..10).map(|i| format!("line {i}\n")).collect();
        let other: String = (10..20).map(|i| format!("line {i}\n")).collect();
        let workers = vec![
            WorkerChanges::new("w1").with_file("src/big.rs", many_lines),
            WorkerChanges::new("w2").with_file("src/big.rs", other),
        ];

        let result = coordinator.merge(&HashMap::new(), &workers);
        assert_eq!(result.conflicts[0].resolution, Resolution::Manual);
        assert!(result.success); // manual but not high-risk
        assert_eq!(result.manual_review_required, 1);
    }

    #[test]
    fn test_structural_merge_of_close_variants() {
        let coordinator = MergeCoordinator::new(MergeConfig {
            enable_ai_resolution: true,
            semantic_similarity_threshold: 0.5,
            max_auto_resolve_lines: 50,
            ..MergeConfig::default()
        });

        let a = "fn shared() {}\nfn only_a() {}\n";
        let b = "fn shared() {}\nfn only_b() {}\n";
        let workers = vec![
            WorkerChanges::new("w1").with_file("src/lib.rs", a),
            WorkerChanges::new("w2").with_file("src/lib.rs", b),
        ];

        let result = coordinator.merge(&HashMap::new(), &workers);
        assert_eq!(result.conflicts[0].resolution, Resolution::Structural);

        let merged = result.merged.get("src/lib.rs").unwrap();
        assert!(merged.contains("fn shared() {}"));
        assert!(merged.contains("fn only_a() {}"));
        assert!(merged.contains("fn only_b() {}"));
    }

    #[test]
    fn test_ai_hook_consulted_last() {
        struct FixedResolver;
        impl MergeResolver for FixedResolver {
            fn resolve(&self, _path: &str, _base: Option<&str>, _variants: &[&str]) -> Option<String> {
                Some("resolved by hook".to_string())
            }
        }

        let coordinator = MergeCoordinator::new(MergeConfig {
            enable_ai_resolution: true,
            semantic_similarity_threshold: 0.99,
            ..MergeConfig::default()
        })
        .with_resolver(Box::new(FixedResolver));

        let workers = vec![
            WorkerChanges::new("w1").with_file("src/lib.rs", "alpha\n"),
            WorkerChanges::new("w2").with_file("src/lib.rs", "beta\n"),
        ];

        let result = coordinator.merge(&HashMap::new(), &workers);
        assert_eq!(result.conflicts[0].resolution, Resolution::Ai);
        assert_eq!(result.merged.get("src/lib.rs").unwrap(), "resolved by hook");
    }

    #[test]
    fn test_fallback_manual_when_ai_disabled() {
        let coordinator = coordinator();
        let workers = vec![
            WorkerChanges::new("w1").with_file("src/lib.rs", "alpha\n"),
            WorkerChanges::new("w2").with_file("src/lib.rs", "beta\n"),
        ];

        let result = coordinator.merge(&HashMap::new(), &workers);
        assert_eq!(result.conflicts[0].resolution, Resolution::Manual);
        assert!(result.success); // manual yet not high-risk
    }

    #[test]
    fn test_metrics_accumulate() {
        let coordinator = coordinator();
        let clean = vec![WorkerChanges::new("w1").with_file("src/a.rs", "mod a;")];
        let conflicted = vec![
            WorkerChanges::new("w1").with_file("src/lib.rs", "alpha\n"),
            WorkerChanges::new("w2").with_file("src/lib.rs", "beta\n"),
        ];

        coordinator.merge(&HashMap::new(), &clean);
        coordinator.merge(&HashMap::new(), &conflicted);

        let metrics = coordinator.metrics();
        assert_eq!(metrics.total_merges, 2);
        assert_eq!(metrics.auto_merges, 1);
        assert_eq!(metrics.manual_merges, 1);
        assert!((metrics.auto_resolution_rate - 0.5).abs() < 1e-9);
        assert!((metrics.avg_conflicts_per_merge - 0.5).abs() < 1e-9);
    }
}
