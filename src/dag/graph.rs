// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;

use crate::condition::Predicate;
use crate::config::model::NodeConfig;
use crate::engine::NodeId;
use crate::errors::{DocdagError, Result};

/// Internal node structure: immediate edges plus derived tier.
#[derive(Debug, Clone)]
struct GraphNode {
    /// Direct dependencies, conditional ones included.
    deps: Vec<NodeId>,
    /// Direct dependents.
    dependents: Vec<NodeId>,
    /// Predicates on incoming conditional edges, keyed by upstream node.
    conditions: Vec<(NodeId, Predicate)>,
    tier: u32,
}

/// Immutable, validated pipeline graph.
///
/// Built once per run. Tiers are `0` for nodes without dependencies and
/// `1 + max(tier of dependencies)` otherwise; they order dispatch but never
/// hold a node back.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    nodes: BTreeMap<NodeId, GraphNode>,
    /// Kahn order, ties broken by node id.
    order: Vec<NodeId>,
}

impl PipelineGraph {
    /// Compile node definitions into a graph.
    ///
    /// Fails with [`DocdagError::Cycle`] if the definitions are not acyclic,
    /// and with [`DocdagError::UnknownNode`] if an edge names a node that
    /// does not exist.
    pub fn build(definitions: &BTreeMap<String, NodeConfig>) -> Result<Self> {
        let mut nodes: BTreeMap<NodeId, GraphNode> = BTreeMap::new();

        for (id, cfg) in definitions {
            let deps = cfg.all_dependencies();
            for dep in &deps {
                if !definitions.contains_key(dep) {
                    return Err(DocdagError::UnknownNode(dep.clone()));
                }
            }
            let conditions = cfg
                .conditional
                .iter()
                .map(|c| (c.on.clone(), c.when.clone()))
                .collect();
            nodes.insert(
                id.clone(),
                GraphNode {
                    deps,
                    dependents: Vec::new(),
                    conditions,
                    tier: 0,
                },
            );
        }

        // Edge direction: dependency -> dependent.
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for id in nodes.keys() {
            graph.add_node(id.as_str());
        }
        for (id, node) in &nodes {
            for dep in &node.deps {
                graph.add_edge(dep.as_str(), id.as_str(), ());
            }
        }

        let (order, tiers) = kahn(&graph)?;

        let edges: Vec<(NodeId, NodeId)> = nodes
            .iter()
            .flat_map(|(id, n)| n.deps.iter().map(move |d| (d.clone(), id.clone())))
            .collect();
        for (dep, dependent) in edges {
            if let Some(n) = nodes.get_mut(&dep) {
                n.dependents.push(dependent);
            }
        }
        for (id, tier) in tiers {
            if let Some(n) = nodes.get_mut(id.as_str()) {
                n.tier = tier;
            }
        }

        Ok(Self { nodes, order })
    }

    /// All node ids, sorted.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in a topological order.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn dependencies_of(&self, id: &str) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &str) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Predicates guarding the incoming conditional edges of `id`.
    pub fn conditions_of(&self, id: &str) -> &[(NodeId, Predicate)] {
        self.nodes
            .get(id)
            .map(|n| n.conditions.as_slice())
            .unwrap_or(&[])
    }

    pub fn tier_of(&self, id: &str) -> Option<u32> {
        self.nodes.get(id).map(|n| n.tier)
    }

    /// Nodes grouped by tier, each group sorted by id.
    pub fn tiers(&self) -> BTreeMap<u32, Vec<NodeId>> {
        let mut out: BTreeMap<u32, Vec<NodeId>> = BTreeMap::new();
        for (id, node) in &self.nodes {
            out.entry(node.tier).or_default().push(id.clone());
        }
        out
    }

    /// Every node `id` transitively depends on.
    pub fn ancestors_of(&self, id: &str) -> BTreeSet<NodeId> {
        self.walk(id, |n| &n.deps)
    }

    /// Every node that transitively depends on `id`.
    pub fn descendants_of(&self, id: &str) -> BTreeSet<NodeId> {
        self.walk(id, |n| &n.dependents)
    }

    fn walk(&self, start: &str, next: impl Fn(&GraphNode) -> &Vec<NodeId>) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            for n in next(node) {
                if seen.insert(n.clone()) {
                    queue.push_back(n.as_str());
                }
            }
        }
        seen
    }
}

type KahnOutput = (Vec<NodeId>, BTreeMap<NodeId, u32>);

/// Kahn's algorithm over the dependency graph.
///
/// Returns the topological order and each node's tier. Nodes left with a
/// non-zero in-degree sit on, or downstream of, a cycle; the error carries
/// only the ones that are on a cycle.
fn kahn(graph: &DiGraphMap<&str, ()>) -> Result<KahnOutput> {
    let mut in_degree: BTreeMap<&str, usize> = graph
        .nodes()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut tiers: BTreeMap<NodeId, u32> = BTreeMap::new();

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(node) = ready.pop_first() {
        let tier = graph
            .neighbors_directed(node, Direction::Incoming)
            .filter_map(|dep| tiers.get(dep))
            .map(|t| t + 1)
            .max()
            .unwrap_or(0);
        tiers.insert(node.to_string(), tier);
        order.push(node.to_string());

        for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(d) = in_degree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() == in_degree.len() {
        return Ok((order, tiers));
    }

    let leftover: BTreeSet<&str> = in_degree
        .into_iter()
        .filter(|(n, d)| *d > 0 && !tiers.contains_key(*n))
        .map(|(n, _)| n)
        .collect();
    let on_cycle: BTreeSet<&str> = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .filter(|n| leftover.contains(n))
        .collect();

    Err(DocdagError::Cycle(
        on_cycle.into_iter().map(str::to_string).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs(edges: &[(&str, &[&str])]) -> BTreeMap<String, NodeConfig> {
        edges
            .iter()
            .map(|(id, after)| {
                (
                    id.to_string(),
                    NodeConfig {
                        after: after.iter().map(|s| s.to_string()).collect(),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn tiers_follow_longest_dependency_chain() {
        let graph = PipelineGraph::build(&defs(&[
            ("A", &[]),
            ("B", &["A"]),
            ("C", &[]),
            ("D", &["B", "C"]),
        ]))
        .unwrap();

        assert_eq!(graph.tier_of("A"), Some(0));
        assert_eq!(graph.tier_of("C"), Some(0));
        assert_eq!(graph.tier_of("B"), Some(1));
        assert_eq!(graph.tier_of("D"), Some(2));
        assert_eq!(graph.dependents_of("A"), ["B".to_string()]);
        assert_eq!(
            graph.descendants_of("A").into_iter().collect::<Vec<_>>(),
            vec!["B", "D"]
        );
    }

    #[test]
    fn cycle_error_names_only_cycle_members() {
        let err = PipelineGraph::build(&defs(&[
            ("A", &[]),
            ("B", &["A", "C"]),
            ("C", &["B"]),
            ("D", &["C"]),
        ]))
        .unwrap_err();

        match err {
            DocdagError::Cycle(nodes) => assert_eq!(nodes, vec!["B", "C"]),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let err = PipelineGraph::build(&defs(&[("A", &["A"])])).unwrap_err();
        assert!(matches!(err, DocdagError::Cycle(nodes) if nodes == vec!["A"]));
    }
}
