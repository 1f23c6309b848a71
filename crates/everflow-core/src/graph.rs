//! Dependency graph construction and schedule analysis.
//!
//! Builds a DAG from a step list and derives everything the runner needs to
//! schedule it: a Kahn topological order, per-node levels (steps sharing a
//! level are eligible to run concurrently), critical-path flags, and the
//! ready set for resume. Cycle detection runs as an independent depth-first
//! search so a bad graph is reported as a list of specific cycles rather
//! than a boolean.
//!
//! All analysis happens once at build time; a `StepGraph` is immutable.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use everflow_types::workflow::WorkflowStep;

/// Duration assumed for critical-path analysis when a step declares none.
pub const DEFAULT_STEP_DURATION_MS: u64 = 1_000;

/// Slack below this threshold marks a node as critical.
const CRITICAL_SLACK_TOLERANCE_MS: f64 = 1e-6;

/// Validation failure raised before any step executes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// The definition has no steps.
    #[error("workflow has no steps")]
    EmptyWorkflow,

    /// Two steps share an id.
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    /// A `depends_on` entry names no step in the definition.
    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    /// The dependency graph is not acyclic. Each cycle is a closed path,
    /// first node repeated at the end (e.g. `[a, b, a]`).
    #[error("dependency cycle detected: {}", format_cycles(.0))]
    CycleDetected(Vec<Vec<String>>),
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| cycle.join(" -> "))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Schedule analysis for one step, computed at build time.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    /// Step id.
    pub id: String,
    /// Direct dependencies, in declaration order.
    pub dependencies: Vec<String>,
    /// Direct dependents, in definition order.
    pub dependents: Vec<String>,
    /// Longest path length from any root (0 for roots).
    pub level: usize,
    /// True when the node lies on the critical path.
    pub critical: bool,
    /// Duration used for critical-path analysis.
    pub estimated_duration_ms: u64,
}

/// The critical path through a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalPath {
    /// Critical step ids, in topological order.
    pub step_ids: Vec<String>,
    /// Projected total duration of the workflow in milliseconds.
    pub total_duration_ms: u64,
}

/// A validated workflow DAG plus its schedule analysis.
#[derive(Debug)]
pub struct StepGraph<'a> {
    graph: DiGraph<&'a WorkflowStep, ()>,
    index_of: HashMap<&'a str, NodeIndex>,
    /// Kahn order, as node indices.
    topo: Vec<NodeIndex>,
    /// Analysis keyed by position in the definition.
    nodes: Vec<GraphNode>,
    critical_path: CriticalPath,
}

impl<'a> StepGraph<'a> {
    /// Build and fully analyze the graph for a step list.
    ///
    /// Fails on an empty list, duplicate ids, dangling dependencies, or
    /// cycles; a cyclic graph fails fatally here, before any step executes.
    pub fn build(steps: &'a [WorkflowStep]) -> Result<StepGraph<'a>, GraphError> {
        if steps.is_empty() {
            return Err(GraphError::EmptyWorkflow);
        }

        let mut graph = DiGraph::with_capacity(steps.len(), steps.len());
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::with_capacity(steps.len());

        for step in steps {
            if index_of.contains_key(step.id.as_str()) {
                return Err(GraphError::DuplicateStep(step.id.clone()));
            }
            let idx = graph.add_node(step);
            index_of.insert(step.id.as_str(), idx);
        }

        // Edges point dependency -> dependent.
        for step in steps {
            let step_idx = index_of[step.id.as_str()];
            for dependency in &step.depends_on {
                let Some(&dep_idx) = index_of.get(dependency.as_str()) else {
                    return Err(GraphError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                graph.add_edge(dep_idx, step_idx, ());
            }
        }

        let topo = kahn_order(&graph);
        if topo.len() < graph.node_count() {
            let cycles = find_cycles(&graph);
            tracing::warn!(cycle_count = cycles.len(), "workflow graph is cyclic");
            return Err(GraphError::CycleDetected(cycles));
        }

        let levels = compute_levels(&graph, &topo);
        let (critical_flags, critical_path) = compute_critical_path(&graph, &topo);

        let nodes = steps
            .iter()
            .map(|step| {
                let idx = index_of[step.id.as_str()];
                let mut dependents: Vec<String> = graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .map(|n| graph[n].id.clone())
                    .collect();
                // Neighbor iteration is reverse insertion order; present
                // dependents in definition order instead.
                dependents.sort_by_key(|id| index_of[id.as_str()].index());
                GraphNode {
                    id: step.id.clone(),
                    dependencies: step.depends_on.clone(),
                    dependents,
                    level: levels[idx.index()],
                    critical: critical_flags[idx.index()],
                    estimated_duration_ms: step_duration_ms(step),
                }
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            steps = steps.len(),
            waves = levels.iter().max().map(|l| l + 1).unwrap_or(0),
            critical_ms = critical_path.total_duration_ms,
            "workflow graph analyzed"
        );

        Ok(StepGraph {
            graph,
            index_of,
            topo,
            nodes,
            critical_path,
        })
    }

    /// Number of steps in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// True when the graph has no steps (never true for a built graph).
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// The step definition for an id.
    pub fn step(&self, id: &str) -> Option<&'a WorkflowStep> {
        self.index_of.get(id).map(|&idx| self.graph[idx])
    }

    /// Schedule analysis for an id.
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Step ids in Kahn topological order.
    pub fn topo_order(&self) -> Vec<&'a str> {
        self.topo.iter().map(|&idx| self.graph[idx].id.as_str()).collect()
    }

    /// Steps grouped by level, ascending; steps within one wave have no
    /// dependencies on each other and are schedule-eligible concurrently.
    pub fn waves(&self) -> Vec<Vec<&'a WorkflowStep>> {
        let max_level = self.nodes.iter().map(|n| n.level).max().unwrap_or(0);
        let mut waves: Vec<Vec<&'a WorkflowStep>> = vec![Vec::new(); max_level + 1];
        // `nodes` is in definition order, so each wave is too.
        for node in &self.nodes {
            if let Some(step) = self.step(&node.id) {
                waves[node.level].push(step);
            }
        }
        waves
    }

    /// Steps whose dependencies are all terminal and which are not
    /// themselves done. `done` holds ids that completed, failed, or were
    /// skipped in this attempt.
    pub fn ready_steps(&self, done: &HashSet<String>) -> Vec<&'a WorkflowStep> {
        self.nodes
            .iter()
            .filter(|node| !done.contains(&node.id))
            .filter(|node| node.dependencies.iter().all(|dep| done.contains(dep)))
            .filter_map(|node| self.step(&node.id))
            .collect()
    }

    /// Every step reachable from `id` along dependency edges (the steps
    /// that can no longer run once `id` fails). Does not include `id`.
    pub fn transitive_dependents(&self, id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let Some(&start) = self.index_of.get(id) else {
            return out;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if out.insert(self.graph[next].id.clone()) {
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// The critical path computed at build time.
    pub fn critical_path(&self) -> &CriticalPath {
        &self.critical_path
    }
}

fn step_duration_ms(step: &WorkflowStep) -> u64 {
    step.estimated_duration_ms.unwrap_or(DEFAULT_STEP_DURATION_MS)
}

/// Kahn's algorithm. Returns the produced order; shorter than the node
/// count exactly when the graph has a cycle.
fn kahn_order(graph: &DiGraph<&WorkflowStep, ()>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();

    let mut queue: VecDeque<NodeIndex> = graph
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(idx) = queue.pop_front() {
        order.push(idx);
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                queue.push_back(next);
            }
        }
    }
    order
}

/// Depth-first cycle enumeration with a recursion stack. Each back edge to
/// an on-stack node records the path slice from that node to the current
/// one, closed with the starting node again.
fn find_cycles(graph: &DiGraph<&WorkflowStep, ()>) -> Vec<Vec<String>> {
    let n = graph.node_count();
    let mut visited = vec![false; n];
    let mut on_stack = vec![false; n];
    let mut path: Vec<NodeIndex> = Vec::new();
    let mut cycles: Vec<Vec<String>> = Vec::new();

    for start in graph.node_indices() {
        if !visited[start.index()] {
            visit(graph, start, &mut visited, &mut on_stack, &mut path, &mut cycles);
        }
    }
    cycles
}

fn visit(
    graph: &DiGraph<&WorkflowStep, ()>,
    node: NodeIndex,
    visited: &mut Vec<bool>,
    on_stack: &mut Vec<bool>,
    path: &mut Vec<NodeIndex>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited[node.index()] = true;
    on_stack[node.index()] = true;
    path.push(node);

    for next in graph.neighbors_directed(node, Direction::Outgoing) {
        if !visited[next.index()] {
            visit(graph, next, visited, on_stack, path, cycles);
        } else if on_stack[next.index()] {
            if let Some(start) = path.iter().position(|&p| p == next) {
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|&p| graph[p].id.clone()).collect();
                cycle.push(graph[next].id.clone());
                cycles.push(cycle);
            }
        }
    }

    path.pop();
    on_stack[node.index()] = false;
}

/// Level per node: 0 for roots, else 1 + max(level of each dependency).
/// Requires `topo` to be a complete topological order.
fn compute_levels(graph: &DiGraph<&WorkflowStep, ()>, topo: &[NodeIndex]) -> Vec<usize> {
    let mut levels = vec![0usize; graph.node_count()];
    for &idx in topo {
        let level = graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|dep| levels[dep.index()] + 1)
            .max()
            .unwrap_or(0);
        levels[idx.index()] = level;
    }
    levels
}

/// Critical-path method over estimated durations.
///
/// Forward pass: earliest-start per node is the max over dependencies of
/// (dependency earliest-start + dependency duration). Backward pass:
/// latest-start anchored at the project end. A node is critical when its
/// slack is within tolerance.
fn compute_critical_path(
    graph: &DiGraph<&WorkflowStep, ()>,
    topo: &[NodeIndex],
) -> (Vec<bool>, CriticalPath) {
    let n = graph.node_count();
    let duration = |idx: NodeIndex| step_duration_ms(graph[idx]) as f64;

    let mut earliest = vec![0.0f64; n];
    for &idx in topo {
        earliest[idx.index()] = graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|dep| earliest[dep.index()] + duration(dep))
            .fold(0.0, f64::max);
    }

    let project_end = topo
        .iter()
        .map(|&idx| earliest[idx.index()] + duration(idx))
        .fold(0.0, f64::max);

    let mut latest = vec![f64::INFINITY; n];
    for &idx in topo.iter().rev() {
        let latest_finish = graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|dependent| latest[dependent.index()])
            .fold(f64::INFINITY, f64::min);
        let latest_finish = if latest_finish.is_infinite() {
            project_end
        } else {
            latest_finish
        };
        latest[idx.index()] = latest_finish - duration(idx);
    }

    let critical: Vec<bool> = (0..n)
        .map(|i| (earliest[i] - latest[i]).abs() <= CRITICAL_SLACK_TOLERANCE_MS)
        .collect();

    let step_ids = topo
        .iter()
        .filter(|&&idx| critical[idx.index()])
        .map(|&idx| graph[idx].id.clone())
        .collect();

    (
        critical,
        CriticalPath {
            step_ids,
            total_duration_ms: project_end.round() as u64,
        },
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
