//! Property tests for the pure orchestration pieces: topological sort and machine scoring.

mod common;

use std::collections::HashMap;

use common::strategies::{
    acyclic_script_strategy, machine_metrics_strategy, machine_with_metrics,
};
use proptest::prelude::*;
use script_orchestrator::orchestration::{DependencyGraph, MachineSelector};

proptest! {
    #[test]
    fn topological_order_is_a_permutation_honoring_every_edge(script in acyclic_script_strategy()) {
        let graph = DependencyGraph::build(
            script.step_ids.iter().map(String::as_str),
            script.edges.iter().map(|(s, t)| (s.as_str(), t.as_str())),
        );
        let order = graph.topological_order().unwrap();

        let mut sorted_order = order.clone();
        sorted_order.sort();
        let mut sorted_ids = script.step_ids.clone();
        sorted_ids.sort();
        prop_assert_eq!(sorted_order, sorted_ids);

        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        for (source, target) in &script.edges {
            prop_assert!(
                position[source.as_str()] < position[target.as_str()],
                "edge {} -> {} violated in {:?}", source, target, order
            );
        }
    }

    #[test]
    fn topological_order_is_deterministic(script in acyclic_script_strategy()) {
        let build = || DependencyGraph::build(
            script.step_ids.iter().map(String::as_str),
            script.edges.iter().map(|(s, t)| (s.as_str(), t.as_str())),
        );
        prop_assert_eq!(build().topological_order().unwrap(), build().topological_order().unwrap());
    }

    #[test]
    fn adding_a_back_edge_creates_a_cycle(script in acyclic_script_strategy()) {
        prop_assume!(!script.edges.is_empty());
        let (source, target) = script.edges[0].clone();
        let graph = DependencyGraph::build(
            script.step_ids.iter().map(String::as_str),
            script
                .edges
                .iter()
                .map(|(s, t)| (s.as_str(), t.as_str()))
                .chain(std::iter::once((target.as_str(), source.as_str()))),
        );
        prop_assert!(graph.topological_order().is_err());
    }

    #[test]
    fn score_is_monotonic_in_each_metric(
        (jobs, cpu, memory) in machine_metrics_strategy(),
        bump in 1i64..10,
    ) {
        let selector = MachineSelector::default();
        let base = selector.score(&machine_with_metrics(jobs, cpu, memory));

        let more_jobs = selector.score(&machine_with_metrics(jobs + bump, cpu, memory));
        let more_cpu = selector.score(&machine_with_metrics(jobs, cpu + bump as f64, memory));
        let more_memory = selector.score(&machine_with_metrics(jobs, cpu, memory + bump as f64));

        prop_assert!(more_jobs > base);
        prop_assert!(more_cpu > base);
        prop_assert!(more_memory < base);
    }

    #[test]
    fn select_best_returns_a_minimum(metrics in prop::collection::vec(machine_metrics_strategy(), 1..20)) {
        let selector = MachineSelector::default();
        let machines: Vec<_> = metrics
            .iter()
            .map(|(jobs, cpu, memory)| machine_with_metrics(*jobs, *cpu, *memory))
            .collect();

        let best = selector.select_best(&machines).unwrap();
        let best_score = selector.score(best);
        prop_assert!(machines.iter().all(|m| selector.score(m) >= best_score));

        let first_minimum = machines
            .iter()
            .find(|m| selector.score(m) == best_score)
            .unwrap();
        prop_assert_eq!(first_minimum.machine_id, best.machine_id);
    }
}
