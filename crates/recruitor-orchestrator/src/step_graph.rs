use crate::types::{StepDefinition, StepStatus, WorkflowStep};
use recruitor_core::{RecruitorError, RecruitorResult};
use std::collections::HashMap;

/// Dependency graph over a workflow's steps, indexed by declaration order.
#[derive(Debug, Clone)]
pub struct StepGraph {
    ids: Vec<String>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl StepGraph {
    /// Builds the graph for a submitted definition. A step without explicit
    /// dependencies depends on the step declared before it.
    pub fn from_definitions(steps: &[StepDefinition]) -> RecruitorResult<Self> {
        let ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
        let deps: Vec<Vec<String>> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if s.dependencies.is_empty() && i > 0 {
                    vec![steps[i - 1].id.clone()]
                } else {
                    s.dependencies.clone()
                }
            })
            .collect();
        Self::build(ids, &deps)
    }

    /// Builds the graph for live steps, whose dependencies are already explicit.
    pub fn from_steps(steps: &[WorkflowStep]) -> RecruitorResult<Self> {
        let ids = steps.iter().map(|s| s.id.clone()).collect();
        let deps: Vec<Vec<String>> = steps.iter().map(|s| s.dependencies.clone()).collect();
        Self::build(ids, &deps)
    }

    fn build(ids: Vec<String>, deps: &[Vec<String>]) -> RecruitorResult<Self> {
        let mut index = HashMap::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            if index.insert(id.as_str(), i).is_some() {
                return Err(RecruitorError::Workflow(format!("Duplicate step id '{id}'")));
            }
        }

        let mut edges = vec![Vec::new(); ids.len()];
        let mut dependents = vec![Vec::new(); ids.len()];
        for (i, step_deps) in deps.iter().enumerate() {
            for dep in step_deps {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(RecruitorError::Workflow(format!(
                        "Step '{}' depends on unknown step '{dep}'",
                        ids[i]
                    )));
                };
                if !edges[i].contains(&d) {
                    edges[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let graph = Self {
            ids,
            deps: edges,
            dependents,
        };
        if graph.has_cycle() {
            return Err(RecruitorError::Workflow(
                "Dependency cycle detected in step graph".to_string(),
            ));
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Effective dependency ids of step `i`.
    pub fn dependency_ids(&self, i: usize) -> Vec<String> {
        self.deps[i].iter().map(|&d| self.ids[d].clone()).collect()
    }

    pub fn dependencies(&self, i: usize) -> &[usize] {
        &self.deps[i]
    }

    pub fn dependents(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }

    /// Check for cycles in the dependency graph.
    pub fn has_cycle(&self) -> bool {
        // 0 = unvisited, 1 = on the current path, 2 = done
        let mut visited = vec![0u8; self.ids.len()];
        let mut stack: Vec<(usize, usize)> = Vec::new();
        for root in 0..self.ids.len() {
            if visited[root] != 0 {
                continue;
            }
            visited[root] = 1;
            stack.push((root, 0));
            while let Some((node, next_edge)) = stack.last_mut() {
                let node = *node;
                let Some(&dep) = self.deps[node].get(*next_edge) else {
                    visited[node] = 2;
                    stack.pop();
                    continue;
                };
                *next_edge += 1;
                match visited[dep] {
                    1 => return true,
                    0 => {
                        visited[dep] = 1;
                        stack.push((dep, 0));
                    }
                    _ => {}
                }
            }
        }
        false
    }

    /// Every step that depends on step `i`, directly or transitively, in
    /// declaration order.
    pub fn downstream(&self, i: usize) -> Vec<usize> {
        let mut seen = vec![false; self.ids.len()];
        let mut stack = self.dependents[i].clone();
        while let Some(d) = stack.pop() {
            if !seen[d] {
                seen[d] = true;
                stack.extend_from_slice(&self.dependents[d]);
            }
        }
        (0..self.ids.len()).filter(|&d| seen[d]).collect()
    }

    /// Pending steps whose dependencies are all terminal, in declaration order.
    pub fn ready(&self, steps: &[WorkflowStep]) -> Vec<usize> {
        (0..self.ids.len())
            .filter(|&i| steps[i].status == StepStatus::Pending)
            .filter(|&i| self.deps[i].iter().all(|&d| steps[d].status.is_terminal()))
            .collect()
    }

    /// Whether any dependency of step `i` failed.
    pub fn any_dependency_failed(&self, steps: &[WorkflowStep], i: usize) -> bool {
        self.deps[i]
            .iter()
            .any(|&d| steps[d].status == StepStatus::Failed)
    }

    /// Whether a failure of step `i` is absorbed by a dependent's condition.
    pub fn failure_handled(&self, steps: &[WorkflowStep], i: usize) -> bool {
        self.dependents[i].iter().any(|&d| {
            steps[d]
                .condition
                .as_ref()
                .is_some_and(|c| c.handles_failure())
        })
    }

    /// A topological order that prefers declaration order among ready steps.
    pub fn execution_order(&self) -> Vec<String> {
        let mut remaining: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut done = vec![false; self.ids.len()];
        let mut order = Vec::with_capacity(self.ids.len());
        while order.len() < self.ids.len() {
            let Some(next) = (0..self.ids.len()).find(|&i| !done[i] && remaining[i] == 0) else {
                break;
            };
            done[next] = true;
            for &d in &self.dependents[next] {
                remaining[d] -= 1;
            }
            order.push(self.ids[next].clone());
        }
        order
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::StepCondition;

    fn step(id: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition::new(id, "noop").depends_on(deps)
    }

    #[test]
    fn test_implicit_sequential_dependencies() {
        let graph =
            StepGraph::from_definitions(&[step("search", &[]), step("scrape", &[]), step("analyze", &[])])
                .unwrap();
        assert!(graph.dependency_ids(0).is_empty());
        assert_eq!(graph.dependency_ids(1), vec!["search"]);
        assert_eq!(graph.dependency_ids(2), vec!["scrape"]);
        assert_eq!(graph.dependents(0), &[1]);
    }

    #[test]
    fn test_explicit_fan_out() {
        let graph = StepGraph::from_definitions(&[
            step("search", &[]),
            step("enrich", &["search"]),
            step("score", &["search"]),
            step("report", &["enrich", "score"]),
        ])
        .unwrap();
        assert_eq!(graph.dependents(0), &[1, 2]);
        assert_eq!(
            graph.execution_order(),
            vec!["search", "enrich", "score", "report"]
        );
    }

    #[test]
    fn test_rejects_duplicates_unknown_and_cycles() {
        let dup = StepGraph::from_definitions(&[step("a", &[]), step("a", &[])]).unwrap_err();
        assert!(dup.to_string().contains("Duplicate step id 'a'"));

        let unknown = StepGraph::from_definitions(&[step("a", &[]), step("b", &["ghost"])]).unwrap_err();
        assert!(unknown.to_string().contains("unknown step 'ghost'"));

        let cycle = StepGraph::from_definitions(&[step("a", &["c"]), step("b", &["a"]), step("c", &["b"])])
            .unwrap_err();
        assert!(cycle.to_string().contains("cycle"));

        let self_loop = StepGraph::from_definitions(&[step("a", &["a"])]).unwrap_err();
        assert!(matches!(self_loop, RecruitorError::Workflow(_)));
    }

    #[test]
    fn test_ready_and_failure_handling() {
        let defs = vec![
            step("send", &[]),
            step("fallback", &["send"]).with_condition(StepCondition::OnFailure),
            step("log", &["send"]),
        ];
        let graph = StepGraph::from_definitions(&defs).unwrap();
        let mut steps: Vec<WorkflowStep> = defs
            .into_iter()
            .enumerate()
            .map(|(i, d)| WorkflowStep::from_definition(d, graph.dependency_ids(i)))
            .collect();

        assert_eq!(graph.ready(&steps), vec![0]);
        steps[0].status = StepStatus::Failed;
        assert_eq!(graph.ready(&steps), vec![1, 2]);
        assert!(graph.any_dependency_failed(&steps, 1));
        assert!(graph.failure_handled(&steps, 0));
        assert!(!graph.failure_handled(&steps, 1));
    }

    #[test]
    fn test_downstream_is_transitive() {
        let graph = StepGraph::from_definitions(&[
            step("fetch", &[]),
            step("fallback", &["fetch"]),
            step("parse", &["fetch"]),
            step("store", &["parse"]),
            step("audit", &["search"]),
            step("search", &[]),
        ])
        .unwrap();
        assert_eq!(graph.downstream(0), vec![1, 2, 3]);
        assert_eq!(graph.downstream(2), vec![3]);
        assert!(graph.downstream(3).is_empty());
        assert_eq!(graph.downstream(5), vec![4]);
    }

    #[test]
    fn test_long_chain_cycle_check() {
        let ids: Vec<String> = (0..50_000).map(|i| format!("s{i}")).collect();
        let mut defs: Vec<StepDefinition> =
            ids.iter().map(|id| StepDefinition::new(id.as_str(), "noop")).collect();
        let graph = StepGraph::from_definitions(&defs).unwrap();
        assert_eq!(graph.len(), 50_000);

        defs[0] = StepDefinition::new("s0", "noop").depends_on(&["s49999"]);
        let err = StepGraph::from_definitions(&defs).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }
}
