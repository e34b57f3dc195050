//! Static dependency topology for managed children
//!
//! Built once at supervisor startup from child declarations and immutable
//! afterwards (a rebuild produces a new graph). Answers dependency,
//! dependent, cycle, restart-order, and blast-radius queries.
//!
//! Cycles are detected and logged but never block construction; traversals
//! stay terminating and yield best-effort orderings on cyclic input.

use crate::types::{ChildId, ChildSpec, FallbackMode, RestartStrategyDecl};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::warn;

/// Per-node attributes kept alongside the topology
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub id: ChildId,
    pub backing: String,
    pub priority: u8,
    pub critical: bool,
}

/// Blast-radius estimate for restarting one node
#[derive(Debug, Clone, PartialEq)]
pub struct RestartImpact {
    /// Transitive dependents affected by the restart
    pub affected_count: usize,
    /// The node or one of its dependents sits on a critical path
    pub critical_path_affected: bool,
    /// Priority-tiered base time plus 200ms per affected node
    pub estimated_downtime: Duration,
    /// At least one component depends on this node
    pub cascade_risk: bool,
}

/// Immutable dependency graph over child declarations
///
/// Edges point from dependent to dependency, so outgoing neighbors are a
/// node's dependencies and incoming neighbors its dependents.
#[derive(Debug)]
pub struct DependencyGraph {
    topology: DiGraphMap<u32, ()>,
    ids: Vec<ChildId>,
    index: HashMap<ChildId, u32>,
    nodes: HashMap<ChildId, NodeInfo>,
    fallbacks: HashMap<ChildId, FallbackMode>,
    restart_strategies: HashMap<ChildId, RestartStrategyDecl>,
    critical_paths: HashSet<ChildId>,
    has_cycles: bool,
}

impl DependencyGraph {
    /// Build a graph from child declarations
    ///
    /// Never fails: a declaration with an empty id gets a synthesized one,
    /// unknown dependency targets become implicit nodes with defaults, and a
    /// detected cycle is logged as a warning while the graph stays usable.
    #[must_use]
    pub fn build(specs: &[ChildSpec]) -> Self {
        let mut graph = Self {
            topology: DiGraphMap::new(),
            ids: Vec::new(),
            index: HashMap::new(),
            nodes: HashMap::new(),
            fallbacks: HashMap::new(),
            restart_strategies: HashMap::new(),
            critical_paths: HashSet::new(),
            has_cycles: false,
        };

        for spec in specs {
            let id = if spec.id.as_str().is_empty() {
                let synthesized = ChildId::synthesize();
                warn!(synthesized = %synthesized, "child declaration without id");
                synthesized
            } else {
                spec.id.clone()
            };
            let ix = graph.intern(&id);
            graph.nodes.insert(
                id.clone(),
                NodeInfo {
                    id: id.clone(),
                    backing: spec.backing.clone(),
                    priority: spec.priority.min(10),
                    critical: spec.critical,
                },
            );
            graph.fallbacks.insert(id.clone(), spec.fallback.clone());
            graph.restart_strategies.insert(id.clone(), spec.restart);

            for dep in &spec.depends_on {
                let dep_ix = graph.intern(dep);
                graph.topology.add_edge(ix, dep_ix, ());
            }
        }

        // Dependency targets never declared themselves get default attributes
        for id in graph.ids.clone() {
            if !graph.nodes.contains_key(&id) {
                graph.nodes.insert(
                    id.clone(),
                    NodeInfo {
                        id: id.clone(),
                        backing: String::new(),
                        priority: 5,
                        critical: false,
                    },
                );
                graph.fallbacks.insert(id.clone(), FallbackMode::Disable);
                graph
                    .restart_strategies
                    .insert(id.clone(), RestartStrategyDecl::Independent);
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph.topology) {
            graph.has_cycles = true;
            warn!("dependency cycle detected; restart ordering is best-effort");
        }

        graph.compute_critical_paths();
        graph
    }

    fn intern(&mut self, id: &ChildId) -> u32 {
        if let Some(&ix) = self.index.get(id) {
            return ix;
        }
        let ix = self.ids.len() as u32;
        self.ids.push(id.clone());
        self.index.insert(id.clone(), ix);
        self.topology.add_node(ix);
        ix
    }

    /// Nodes whose removal transitively affects two or more dependents, plus
    /// nodes explicitly marked critical
    fn compute_critical_paths(&mut self) {
        let mut critical = HashSet::new();
        for id in &self.ids {
            let info = match self.nodes.get(id) {
                Some(info) => info,
                None => continue,
            };
            if info.critical || self.get_affected_nodes(id).len() >= 2 {
                critical.insert(id.clone());
            }
        }
        self.critical_paths = critical;
    }

    #[inline]
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        self.has_cycles
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, id: &ChildId) -> bool {
        self.index.contains_key(id)
    }

    #[inline]
    #[must_use]
    pub fn node(&self, id: &ChildId) -> Option<&NodeInfo> {
        self.nodes.get(id)
    }

    #[inline]
    #[must_use]
    pub fn fallback_strategy(&self, id: &ChildId) -> FallbackMode {
        self.fallbacks.get(id).cloned().unwrap_or_default()
    }

    #[inline]
    #[must_use]
    pub fn restart_strategy(&self, id: &ChildId) -> RestartStrategyDecl {
        self.restart_strategies.get(id).copied().unwrap_or_default()
    }

    #[inline]
    #[must_use]
    pub fn critical_paths(&self) -> &HashSet<ChildId> {
        &self.critical_paths
    }

    /// Direct dependencies of `id`
    #[must_use]
    pub fn get_dependencies(&self, id: &ChildId) -> Vec<ChildId> {
        let Some(&ix) = self.index.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<ChildId> = self
            .topology
            .neighbors_directed(ix, Direction::Outgoing)
            .map(|n| self.ids[n as usize].clone())
            .collect();
        deps.sort();
        deps
    }

    /// Direct dependents of `id` (reverse adjacency)
    #[must_use]
    pub fn get_dependents(&self, id: &ChildId) -> Vec<ChildId> {
        let Some(&ix) = self.index.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<ChildId> = self
            .topology
            .neighbors_directed(ix, Direction::Incoming)
            .map(|n| self.ids[n as usize].clone())
            .collect();
        deps.sort();
        deps
    }

    /// Restart order for `id`: every transitive dependency before the node
    /// itself, deduplicated
    ///
    /// A node re-encountered while still in progress (a cycle) is treated as
    /// having no further dependencies, which keeps the walk terminating and
    /// yields a best-effort order for cyclic graphs.
    #[must_use]
    pub fn get_restart_order(&self, id: &ChildId) -> Vec<ChildId> {
        let Some(&ix) = self.index.get(id) else {
            return Vec::new();
        };
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();
        self.post_order(ix, &mut visited, &mut in_progress, &mut order);
        order.into_iter().map(|n| self.ids[n as usize].clone()).collect()
    }

    fn post_order(
        &self,
        ix: u32,
        visited: &mut HashSet<u32>,
        in_progress: &mut HashSet<u32>,
        order: &mut Vec<u32>,
    ) {
        if visited.contains(&ix) || in_progress.contains(&ix) {
            return;
        }
        in_progress.insert(ix);
        let mut deps: Vec<u32> = self
            .topology
            .neighbors_directed(ix, Direction::Outgoing)
            .collect();
        deps.sort_unstable();
        for dep in deps {
            self.post_order(dep, visited, in_progress, order);
        }
        in_progress.remove(&ix);
        visited.insert(ix);
        order.push(ix);
    }

    /// Transitive dependents of `id`, for blast-radius estimation
    ///
    /// Uses a visited set so the closure terminates on cyclic graphs.
    #[must_use]
    pub fn get_affected_nodes(&self, id: &ChildId) -> Vec<ChildId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut visited = HashSet::new();
        let mut queue = vec![start];
        while let Some(ix) = queue.pop() {
            for dependent in self.topology.neighbors_directed(ix, Direction::Incoming) {
                if dependent != start && visited.insert(dependent) {
                    queue.push(dependent);
                }
            }
        }
        let mut affected: Vec<ChildId> =
            visited.into_iter().map(|n| self.ids[n as usize].clone()).collect();
        affected.sort();
        affected
    }

    /// Estimate the blast radius of restarting `id`
    #[must_use]
    pub fn get_restart_impact(&self, id: &ChildId) -> RestartImpact {
        let affected = self.get_affected_nodes(id);
        let priority = self.nodes.get(id).map(|n| n.priority).unwrap_or(5);
        let base_ms = match priority {
            8..=10 => 500,
            4..=7 => 1_000,
            _ => 2_000,
        };
        let critical_path_affected = self.critical_paths.contains(id)
            || affected.iter().any(|n| self.critical_paths.contains(n));
        RestartImpact {
            affected_count: affected.len(),
            critical_path_affected,
            estimated_downtime: Duration::from_millis(base_ms + affected.len() as u64 * 200),
            cascade_risk: !self.get_dependents(id).is_empty(),
        }
    }

    /// Sorted node ids, for structural comparison
    #[must_use]
    pub fn node_ids(&self) -> Vec<ChildId> {
        let mut ids = self.ids.clone();
        ids.sort();
        ids
    }

    /// Sorted `(dependent, dependency)` pairs, for structural comparison
    #[must_use]
    pub fn edge_list(&self) -> Vec<(ChildId, ChildId)> {
        let mut edges: Vec<(ChildId, ChildId)> = self
            .topology
            .all_edges()
            .map(|(from, to, _)| (self.ids[from as usize].clone(), self.ids[to as usize].clone()))
            .collect();
        edges.sort();
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChildSpec;

    fn diamond() -> DependencyGraph {
        // app -> {web, worker} -> db
        DependencyGraph::build(&[
            ChildSpec::new("db"),
            ChildSpec::new("web").depends_on("db"),
            ChildSpec::new("worker").depends_on("db"),
            ChildSpec::new("app").depends_on("web").depends_on("worker"),
        ])
    }

    #[test]
    fn direct_adjacency() {
        let g = diamond();
        assert_eq!(
            g.get_dependencies(&ChildId::new("app")),
            vec![ChildId::new("web"), ChildId::new("worker")]
        );
        assert_eq!(
            g.get_dependents(&ChildId::new("db")),
            vec![ChildId::new("web"), ChildId::new("worker")]
        );
        assert!(g.get_dependencies(&ChildId::new("db")).is_empty());
    }

    #[test]
    fn restart_order_puts_dependencies_first() {
        let g = diamond();
        let order = g.get_restart_order(&ChildId::new("app"));
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], ChildId::new("db"));
        assert_eq!(order[3], ChildId::new("app"));
        let pos =
            |id: &str| order.iter().position(|n| n == &ChildId::new(id)).unwrap();
        assert!(pos("db") < pos("web"));
        assert!(pos("db") < pos("worker"));
    }

    #[test]
    fn cycle_is_tolerated() {
        let g = DependencyGraph::build(&[
            ChildSpec::new("a").depends_on("b"),
            ChildSpec::new("b").depends_on("a"),
        ]);
        assert!(g.has_cycles());
        let order = g.get_restart_order(&ChildId::new("a"));
        assert!(!order.is_empty());
        assert_eq!(order.last(), Some(&ChildId::new("a")));
        // blast radius still terminates
        assert_eq!(g.get_affected_nodes(&ChildId::new("a")), vec![ChildId::new("b")]);
    }

    #[test]
    fn affected_nodes_are_transitive() {
        let g = diamond();
        let affected = g.get_affected_nodes(&ChildId::new("db"));
        assert_eq!(
            affected,
            vec![ChildId::new("app"), ChildId::new("web"), ChildId::new("worker")]
        );
    }

    #[test]
    fn critical_paths_from_fanout_and_flag() {
        let g = diamond();
        // db transitively affects three dependents
        assert!(g.critical_paths().contains(&ChildId::new("db")));
        // app has no dependents and is not marked
        assert!(!g.critical_paths().contains(&ChildId::new("app")));

        let g2 = DependencyGraph::build(&[ChildSpec::new("solo").critical()]);
        assert!(g2.critical_paths().contains(&ChildId::new("solo")));
    }

    #[test]
    fn restart_impact_tiers() {
        let g = DependencyGraph::build(&[
            ChildSpec::new("db").with_priority(9),
            ChildSpec::new("web").depends_on("db"),
        ]);
        let impact = g.get_restart_impact(&ChildId::new("db"));
        assert_eq!(impact.affected_count, 1);
        assert!(impact.cascade_risk);
        // high priority base 500ms + 1 affected * 200ms
        assert_eq!(impact.estimated_downtime, Duration::from_millis(700));

        let leaf = g.get_restart_impact(&ChildId::new("web"));
        assert_eq!(leaf.affected_count, 0);
        assert!(!leaf.cascade_risk);
        assert_eq!(leaf.estimated_downtime, Duration::from_millis(1_000));
    }

    #[test]
    fn malformed_spec_gets_synthesized_id() {
        let g = DependencyGraph::build(&[ChildSpec::new("")]);
        assert_eq!(g.len(), 1);
        assert!(g.node_ids()[0].as_str().starts_with("child-"));
    }

    #[test]
    fn undeclared_dependency_gets_defaults() {
        let g = DependencyGraph::build(&[ChildSpec::new("web").depends_on("db")]);
        assert!(g.contains(&ChildId::new("db")));
        assert_eq!(
            g.restart_strategy(&ChildId::new("db")),
            RestartStrategyDecl::Independent
        );
        assert_eq!(g.fallback_strategy(&ChildId::new("db")), FallbackMode::Disable);
    }

    #[test]
    fn build_is_deterministic() {
        let specs = [
            ChildSpec::new("db"),
            ChildSpec::new("web").depends_on("db"),
            ChildSpec::new("app").depends_on("web"),
        ];
        let g1 = DependencyGraph::build(&specs);
        let g2 = DependencyGraph::build(&specs);
        assert_eq!(g1.node_ids(), g2.node_ids());
        assert_eq!(g1.edge_list(), g2.edge_list());
        assert_eq!(g1.critical_paths(), g2.critical_paths());
    }
}
