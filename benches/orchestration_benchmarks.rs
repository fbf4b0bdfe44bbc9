use criterion::{black_box, criterion_group, criterion_main, Criterion};
use script_orchestrator::config::SelectorConfig;
use script_orchestrator::models::Machine;
use script_orchestrator::orchestration::{DependencyGraph, MachineSelector};
use uuid::Uuid;

fn layered_graph(layers: usize, width: usize) -> (Vec<String>, Vec<(String, String)>) {
    let ids: Vec<String> = (0..layers * width).map(|i| format!("step-{i}")).collect();
    let mut edges = Vec::new();
    for layer in 1..layers {
        for col in 0..width {
            let target = &ids[layer * width + col];
            for prev in 0..width {
                edges.push((ids[(layer - 1) * width + prev].clone(), target.clone()));
            }
        }
    }
    (ids, edges)
}

fn benchmark_topological_sort(c: &mut Criterion) {
    let (ids, edges) = layered_graph(20, 10);
    c.bench_function("topological_sort_200_steps", |b| {
        b.iter(|| {
            let graph = DependencyGraph::build(
                ids.iter().map(String::as_str),
                edges.iter().map(|(s, t)| (s.as_str(), t.as_str())),
            );
            black_box(graph.topological_order())
        })
    });
}

fn benchmark_machine_selection(c: &mut Criterion) {
    let machines: Vec<Machine> = (0..500)
        .map(|i| Machine {
            machine_id: Uuid::new_v4(),
            name: format!("machine-{i}"),
            online: true,
            tunnel_url: Some(format!("https://machine-{i}.tunnel")),
            running_job_count: Some((i % 7) as i64),
            cpu_percent: Some((i % 100) as f64),
            free_memory_gb: Some((i % 32) as f64),
            profile_ids: Vec::new(),
            metrics_updated_at: None,
        })
        .collect();
    let selector = MachineSelector::new(SelectorConfig::default());

    c.bench_function("select_best_500_machines", |b| {
        b.iter(|| black_box(selector.select_best(&machines)))
    });
}

criterion_group!(benches, benchmark_topological_sort, benchmark_machine_selection);
criterion_main!(benches);
