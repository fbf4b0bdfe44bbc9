#![allow(dead_code)]

use proptest::prelude::*;
use uuid::Uuid;

use script_orchestrator::models::Machine;

/// A generated acyclic script: step ids in creation order and (source, target) edges
#[derive(Debug, Clone)]
pub struct AcyclicScript {
    pub step_ids: Vec<String>,
    pub edges: Vec<(String, String)>,
}

/// Strategy for generating acyclic step graphs.
///
/// Edges only point from an earlier to a later position in a hidden rank order, and
/// creation order is an independent shuffle of the ranks, so creation order alone
/// rarely satisfies the edges.
pub fn acyclic_script_strategy() -> impl Strategy<Value = AcyclicScript> {
    (1usize..12)
        .prop_flat_map(|n| {
            let pairs: Vec<(usize, usize)> = (0..n)
                .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
                .collect();
            let pair_count = pairs.len();
            (
                Just(pairs),
                prop::collection::vec(any::<bool>(), pair_count),
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
            )
        })
        .prop_map(|(pairs, keep, creation)| {
            let id = |rank: usize| format!("step-{rank}");
            let edges = pairs
                .into_iter()
                .zip(keep)
                .filter(|(_, keep)| *keep)
                .map(|((from, to), _)| (id(from), id(to)))
                .collect();
            AcyclicScript {
                step_ids: creation.into_iter().map(id).collect(),
                edges,
            }
        })
}

/// Strategy for machine telemetry: (running jobs, cpu percent, free memory GB)
pub fn machine_metrics_strategy() -> impl Strategy<Value = (i64, f64, f64)> {
    (0i64..50, 0.0f64..100.0, 0.0f64..64.0)
}

pub fn machine_with_metrics(jobs: i64, cpu: f64, free_memory: f64) -> Machine {
    Machine {
        machine_id: Uuid::new_v4(),
        name: "candidate".to_string(),
        online: true,
        tunnel_url: Some("https://candidate.tunnel.test".to_string()),
        running_job_count: Some(jobs),
        cpu_percent: Some(cpu),
        free_memory_gb: Some(free_memory),
        profile_ids: Vec::new(),
        metrics_updated_at: None,
    }
}
