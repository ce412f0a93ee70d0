//! Named job graphs
//!
//! A [`JobGraph`] is built from named [`JobSpec`]s whose dependencies refer to
//! each other by name. Building resolves names to fingerprints, rejects
//! cycles and groups jobs into waves for display.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{info, instrument};

use crate::job::{Fingerprint, JobDefinition, JobKind};

/// A job plus the names of the jobs it depends on
#[derive(Debug)]
pub struct JobSpec {
    pub name: String,
    pub definition: JobDefinition,
    pub depends_on: Vec<String>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, definition: JobDefinition) -> Self {
        Self {
            name: name.into(),
            definition,
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }
}

/// A node in a job graph
#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub name: String,
    pub fingerprint: Fingerprint,
    pub kind: JobKind,
    pub label: String,
    pub cacheable: bool,
    /// Names of jobs that must succeed before this one
    pub dependencies: HashSet<String>,
    /// Names of jobs waiting on this one
    pub dependents: HashSet<String>,
    /// Jobs in the same wave have no dependencies on each other
    pub wave: usize,
}

/// Validated, topologically sorted set of named jobs
#[derive(Debug)]
pub struct JobGraph {
    nodes: HashMap<String, GraphNode>,
    definitions: HashMap<String, JobDefinition>,
    waves: Vec<Vec<String>>,
    sorted_order: Vec<String>,
}

impl JobGraph {
    /// Resolve dependency names and sort the graph
    #[instrument(skip_all, fields(jobs = specs.len()))]
    pub fn build(specs: Vec<JobSpec>) -> Result<Self, GraphError> {
        let mut fingerprints: HashMap<String, Fingerprint> = HashMap::new();
        for spec in &specs {
            if fingerprints
                .insert(spec.name.clone(), spec.definition.fingerprint())
                .is_some()
            {
                return Err(GraphError::DuplicateName(spec.name.clone()));
            }
        }

        let mut nodes: HashMap<String, GraphNode> = HashMap::new();
        let mut definitions: HashMap<String, JobDefinition> = HashMap::new();

        for spec in specs {
            let mut definition = spec.definition;
            let mut dependencies = HashSet::new();
            for dep in spec.depends_on {
                let fingerprint =
                    fingerprints
                        .get(&dep)
                        .copied()
                        .ok_or_else(|| GraphError::UnknownDependency {
                            job: spec.name.clone(),
                            dependency: dep.clone(),
                        })?;
                definition = definition.depends_on(fingerprint);
                dependencies.insert(dep);
            }

            nodes.insert(
                spec.name.clone(),
                GraphNode {
                    name: spec.name.clone(),
                    fingerprint: definition.fingerprint(),
                    kind: definition.kind(),
                    label: definition.label().to_string(),
                    cacheable: definition.is_cacheable(),
                    dependencies,
                    dependents: HashSet::new(),
                    wave: 0,
                },
            );
            definitions.insert(spec.name, definition);
        }

        let edges: Vec<(String, HashSet<String>)> = nodes
            .iter()
            .map(|(name, node)| (name.clone(), node.dependencies.clone()))
            .collect();
        for (name, deps) in &edges {
            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(dep) {
                    dep_node.dependents.insert(name.clone());
                }
            }
        }

        let sorted_order = Self::topological_sort(&nodes)?;
        let waves = Self::compute_waves(&nodes, &sorted_order);
        for (wave_idx, wave) in waves.iter().enumerate() {
            for name in wave {
                if let Some(node) = nodes.get_mut(name) {
                    node.wave = wave_idx;
                }
            }
        }

        info!(
            job_count = nodes.len(),
            wave_count = waves.len(),
            "job graph built"
        );

        Ok(Self {
            nodes,
            definitions,
            waves,
            sorted_order,
        })
    }

    /// Kahn's algorithm; ties are broken by name so the order is stable
    fn topological_sort(nodes: &HashMap<String, GraphNode>) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut roots: Vec<&str> = Vec::new();

        for (name, node) in nodes {
            in_degree.insert(name, node.dependencies.len());
            if node.dependencies.is_empty() {
                roots.push(name);
            }
        }
        roots.sort_unstable();
        let mut queue: VecDeque<&str> = roots.into();
        let mut sorted: Vec<String> = Vec::with_capacity(nodes.len());

        while let Some(name) = queue.pop_front() {
            sorted.push(name.to_string());

            if let Some(node) = nodes.get(name) {
                let mut released: Vec<&str> = Vec::new();
                for dependent in &node.dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            released.push(dependent);
                        }
                    }
                }
                released.sort_unstable();
                queue.extend(released);
            }
        }

        if sorted.len() != nodes.len() {
            let in_sorted: HashSet<&String> = sorted.iter().collect();
            let mut cyclic: Vec<&str> = nodes
                .keys()
                .filter(|name| !in_sorted.contains(name))
                .map(String::as_str)
                .collect();
            cyclic.sort_unstable();
            return Err(GraphError::CyclicDependency(cyclic.join(", ")));
        }

        Ok(sorted)
    }

    fn compute_waves(nodes: &HashMap<String, GraphNode>, sorted: &[String]) -> Vec<Vec<String>> {
        let mut wave_map: HashMap<&str, usize> = HashMap::new();
        for name in sorted {
            if let Some(node) = nodes.get(name) {
                let wave = node
                    .dependencies
                    .iter()
                    .filter_map(|dep| wave_map.get(dep.as_str()))
                    .max()
                    .map(|w| w + 1)
                    .unwrap_or(0);
                wave_map.insert(name, wave);
            }
        }

        let wave_count = wave_map.values().max().map_or(0, |w| w + 1);
        let mut waves: Vec<Vec<String>> = vec![Vec::new(); wave_count];
        for name in sorted {
            if let Some(&wave) = wave_map.get(name.as_str()) {
                waves[wave].push(name.clone());
            }
        }
        waves
    }

    pub fn nodes(&self) -> &HashMap<String, GraphNode> {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn sorted(&self) -> &[String] {
        &self.sorted_order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Human-readable summary of the execution plan
    pub fn execution_plan(&self) -> String {
        let mut plan = String::new();
        for (i, wave) in self.waves.iter().enumerate() {
            plan.push_str(&format!("Wave {} ({} jobs):\n", i, wave.len()));
            for name in wave {
                let Some(node) = self.nodes.get(name) else {
                    continue;
                };
                let mut deps: Vec<&str> = node.dependencies.iter().map(String::as_str).collect();
                deps.sort_unstable();
                if deps.is_empty() {
                    plan.push_str(&format!("  {} [{}] {}\n", name, node.kind, node.fingerprint.short()));
                } else {
                    plan.push_str(&format!(
                        "  {} [{}] {} (after: {})\n",
                        name,
                        node.kind,
                        node.fingerprint.short(),
                        deps.join(", ")
                    ));
                }
            }
        }
        plan
    }

    /// Definitions in dependency order, each with its name
    pub fn into_definitions(mut self) -> Vec<(String, JobDefinition)> {
        self.sorted_order
            .into_iter()
            .filter_map(|name| {
                let definition = self.definitions.remove(&name)?;
                Some((name, definition))
            })
            .collect()
    }
}

/// Errors during graph construction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Cyclic dependency detected among jobs: {0}")]
    CyclicDependency(String),

    #[error("Job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("Job name '{0}' is used more than once")]
    DuplicateName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> JobSpec {
        let fp = Fingerprint::new(JobKind::Cpu, name);
        JobSpec::new(name, JobDefinition::new(JobKind::Cpu, fp, |_| Ok(1u64)))
    }

    #[test]
    fn test_build_graph_waves() {
        let graph = JobGraph::build(vec![
            spec("plan").after("volume").after("dose"),
            spec("volume"),
            spec("dose").after("volume"),
        ])
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.get("volume").unwrap().wave, 0);
        assert_eq!(graph.get("dose").unwrap().wave, 1);
        assert_eq!(graph.get("plan").unwrap().wave, 2);
        assert_eq!(graph.sorted(), &["volume", "dose", "plan"]);
    }

    #[test]
    fn test_independent_jobs_share_a_wave() {
        let graph = JobGraph::build(vec![spec("b"), spec("a")]).unwrap();
        assert_eq!(graph.waves().len(), 1);
        assert_eq!(graph.waves()[0], vec!["a", "b"]);
    }

    #[test]
    fn test_dependencies_become_fingerprints() {
        let graph = JobGraph::build(vec![spec("a"), spec("b").after("a")]).unwrap();
        let definitions = graph.into_definitions();

        assert_eq!(definitions[0].0, "a");
        assert_eq!(
            definitions[1].1.dependencies(),
            &[Fingerprint::new(JobKind::Cpu, "a")]
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let result = JobGraph::build(vec![spec("a").after("b"), spec("b").after("a"), spec("c")]);
        assert_eq!(
            result.unwrap_err(),
            GraphError::CyclicDependency("a, b".to_string())
        );
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = JobGraph::build(vec![spec("a").after("missing")]);
        assert!(matches!(result, Err(GraphError::UnknownDependency { .. })));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = JobGraph::build(vec![spec("a"), spec("a")]);
        assert_eq!(result.unwrap_err(), GraphError::DuplicateName("a".to_string()));
    }

    #[test]
    fn test_execution_plan_output() {
        let graph = JobGraph::build(vec![spec("a"), spec("b").after("a")]).unwrap();
        let plan = graph.execution_plan();

        assert!(plan.contains("Wave 0"));
        assert!(plan.contains("Wave 1"));
        assert!(plan.contains("b [cpu]"));
        assert!(plan.contains("(after: a)"));
    }
}
