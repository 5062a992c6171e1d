// tests/dag_tiers.rs

use std::collections::{BTreeMap, BTreeSet};

use docdag::config::NodeConfig;
use docdag::dag::PipelineGraph;
use docdag::errors::DocdagError;
use docdag_test_utils::{NodeBuilder, PipelineBuilder};
use proptest::prelude::*;

// Acyclic by construction: node i may only depend on nodes 0..i.
fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = BTreeMap<String, NodeConfig>> {
    (1..=max_nodes).prop_flat_map(|count| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..count), count)
            .prop_map(|raw_deps| {
                let mut nodes = BTreeMap::new();
                for (i, potential) in raw_deps.into_iter().enumerate() {
                    let mut node = NodeBuilder::new();
                    let deps: BTreeSet<usize> = if i == 0 {
                        BTreeSet::new()
                    } else {
                        potential.into_iter().map(|d| d % i).collect()
                    };
                    for d in deps {
                        node = node.after(&format!("n{d:02}"));
                    }
                    nodes.insert(format!("n{i:02}"), node.build());
                }
                nodes
            })
    })
}

proptest! {
    #[test]
    fn tiers_follow_longest_dependency_chain(nodes in dag_strategy(12)) {
        let graph = PipelineGraph::build(&nodes).unwrap();

        for (id, cfg) in &nodes {
            let expected = cfg
                .after
                .iter()
                .map(|d| graph.tier_of(d).unwrap() + 1)
                .max()
                .unwrap_or(0);
            prop_assert_eq!(graph.tier_of(id), Some(expected));
        }
    }

    #[test]
    fn topological_order_puts_dependencies_first(nodes in dag_strategy(12)) {
        let graph = PipelineGraph::build(&nodes).unwrap();
        let order = graph.topological_order();
        prop_assert_eq!(order.len(), nodes.len());

        let position: BTreeMap<&str, usize> =
            order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        for (id, cfg) in &nodes {
            for dep in &cfg.after {
                prop_assert!(position[dep.as_str()] < position[id.as_str()]);
            }
        }
    }
}

#[test]
fn acquisition_pipeline_tiers() {
    let pipeline = PipelineBuilder::new()
        .node("Requirements", NodeBuilder::new().build())
        .node("MarketResearch", NodeBuilder::new().after("Requirements").build())
        .node("CostEstimate", NodeBuilder::new().after("Requirements").build())
        .node(
            "Strategy",
            NodeBuilder::new()
                .after("MarketResearch")
                .after("CostEstimate")
                .build(),
        )
        .node("Plan", NodeBuilder::new().after("Strategy").build())
        .build();

    let graph = PipelineGraph::build(&pipeline.node).unwrap();
    let tiers = graph.tiers();

    assert_eq!(tiers[&0], vec!["Requirements"]);
    assert_eq!(tiers[&1], vec!["CostEstimate", "MarketResearch"]);
    assert_eq!(tiers[&2], vec!["Strategy"]);
    assert_eq!(tiers[&3], vec!["Plan"]);

    assert_eq!(
        graph.ancestors_of("Plan"),
        ["CostEstimate", "MarketResearch", "Requirements", "Strategy"]
            .into_iter()
            .map(String::from)
            .collect()
    );
    assert_eq!(
        graph.descendants_of("CostEstimate"),
        ["Plan", "Strategy"].into_iter().map(String::from).collect()
    );
}

#[test]
fn cycle_reports_only_its_members() {
    let mut nodes = BTreeMap::new();
    nodes.insert("Root".to_string(), NodeBuilder::new().build());
    nodes.insert("A".to_string(), NodeBuilder::new().after("Root").after("C").build());
    nodes.insert("B".to_string(), NodeBuilder::new().after("A").build());
    nodes.insert("C".to_string(), NodeBuilder::new().after("B").build());
    nodes.insert("Downstream".to_string(), NodeBuilder::new().after("C").build());

    match PipelineGraph::build(&nodes) {
        Err(DocdagError::Cycle(members)) => {
            assert_eq!(members, vec!["A", "B", "C"]);
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
}

#[test]
fn cycle_is_rejected_by_validation() {
    let result = PipelineBuilder::new()
        .node("A", NodeBuilder::new().after("B").build())
        .node("B", NodeBuilder::new().after("A").build())
        .try_build();

    assert!(matches!(result, Err(DocdagError::Cycle(_))));
}

#[test]
fn self_and_unknown_dependencies_are_rejected() {
    let result = PipelineBuilder::new()
        .node("A", NodeBuilder::new().after("A").build())
        .try_build();
    assert!(
        matches!(&result, Err(DocdagError::Cycle(nodes)) if nodes == &vec!["A".to_string()]),
        "{result:?}"
    );

    let err = PipelineBuilder::new()
        .node("A", NodeBuilder::new().after("Ghost").build())
        .try_build()
        .unwrap_err();
    assert!(err.to_string().contains("unknown dependency 'Ghost'"), "{err}");
}
