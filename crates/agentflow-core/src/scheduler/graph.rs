//! Dependency graph and execution plan generation.
//!
//! The graph is stored as node and adjacency maps keyed by id, so
//! back-edges are plain data rather than ownership cycles. Plans are
//! computed by Kahn layering: stage `i` holds every task whose
//! dependencies all live in stages `0..i`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use agentflow_models::{ExecutionPlan, PlanStage, TaskNode};

use crate::error::{CoreError, Result};

/// Acyclic task dependency graph.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<String, TaskNode>,
    /// node id -> ids it depends on
    dependencies: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node; its `dependencies` field seeds the edge set.
    pub fn add_node(&mut self, node: TaskNode) {
        let deps: BTreeSet<String> = node.dependencies.iter().cloned().collect();
        self.dependencies.insert(node.id.clone(), deps);
        self.nodes.insert(node.id.clone(), node);
    }

    /// Add an edge: `node` depends on `dependency`.
    pub fn add_dependency(&mut self, node: &str, dependency: &str) {
        self.dependencies
            .entry(node.to_string())
            .or_default()
            .insert(dependency.to_string());
        if let Some(task) = self.nodes.get_mut(node)
            && !task.dependencies.iter().any(|d| d == dependency)
        {
            task.dependencies.push(dependency.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Whether the graph contains a dependency cycle.
    pub fn has_circular_dependency(&self) -> bool {
        self.find_cycle_member().is_some()
    }

    /// Iterative DFS cycle detection; returns one node on a cycle, if any.
    fn find_cycle_member(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> =
            self.nodes.keys().map(|id| (id.as_str(), Color::White)).collect();

        // BTreeMap iteration keeps detection deterministic.
        let ordered: BTreeMap<&String, &TaskNode> = self.nodes.iter().collect();
        for start in ordered.keys() {
            if colors[start.as_str()] != Color::White {
                continue;
            }

            let mut stack: Vec<(&str, bool)> = vec![(start.as_str(), false)];
            while let Some((id, children_done)) = stack.pop() {
                if children_done {
                    colors.insert(id, Color::Black);
                    continue;
                }
                colors.insert(id, Color::Gray);
                stack.push((id, true));

                if let Some(deps) = self.dependencies.get(id) {
                    for dep in deps {
                        // Missing dependency ids are caught during planning.
                        match colors.get(dep.as_str()) {
                            Some(Color::Gray) => return Some(dep.clone()),
                            Some(Color::White) => stack.push((dep.as_str(), false)),
                            _ => {}
                        }
                    }
                }
            }
        }
        None
    }

    /// Compute the staged execution plan.
    ///
    /// Fails on cycles and on dependencies that reference unknown nodes.
    pub fn generate_execution_plan(&self) -> Result<ExecutionPlan> {
        for (id, deps) in &self.dependencies {
            for dep in deps {
                if !self.nodes.contains_key(dep) {
                    return Err(CoreError::Validation(format!(
                        "task {id} depends on unknown task {dep}"
                    )));
                }
            }
        }
        if let Some(member) = self.find_cycle_member() {
            return Err(CoreError::CircularDependency(member));
        }

        let mut placed: BTreeSet<String> = BTreeSet::new();
        let mut remaining: BTreeSet<String> = self.nodes.keys().cloned().collect();
        let mut stages: Vec<PlanStage> = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|id| {
                    self.dependencies
                        .get(*id)
                        .map(|deps| deps.iter().all(|d| placed.contains(d)))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();

            // A cycle would have been caught above, so `ready` cannot be
            // empty while nodes remain.
            debug_assert!(!ready.is_empty());

            let estimated_duration = ready
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .map(|n| n.estimated_duration)
                .max()
                .unwrap_or(0);

            for id in &ready {
                remaining.remove(id);
                placed.insert(id.clone());
            }
            stages.push(PlanStage {
                index: stages.len(),
                tasks: ready,
                estimated_duration,
            });
        }

        let estimated_total_duration: u64 = stages.iter().map(|s| s.estimated_duration).sum();
        let total_work: u64 = self.nodes.values().map(|n| n.estimated_duration).sum();
        let parallelization_factor = if estimated_total_duration == 0 {
            1.0
        } else {
            total_work as f64 / estimated_total_duration as f64
        };

        let mut tasks: Vec<TaskNode> = self.nodes.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(ExecutionPlan {
            tasks,
            stages,
            estimated_total_duration,
            parallelization_factor,
        })
    }
}
