use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use iso_core::{
    Axis, AxisFilter, Composition, Compiler, Condition, ConnectionEngine, EngineConfig,
    FilterState, Graph, TimeRange, Value, ValueId, execute,
};

const STATUSES: [&str; 4] = ["todo", "doing", "review", "done"];

fn build_graph(nodes: usize, edges_per_node: usize) -> Graph {
    let mut rng = SmallRng::seed_from_u64(42);
    let mut g = Graph::new();
    for i in 0..nodes {
        let day = rng.random_range(1..=28);
        g.put(
            Value::node(format!("n{i}"))
                .with_axis_attr("status", Axis::Categorical, STATUSES[i % STATUSES.len()])
                .with_axis_attr("priority", Axis::Ordinal, rng.random_range(0..10i64))
                .with_axis_attr("due", Axis::Temporal, format!("2024-02-{day:02}"))
                .with_attr("title", format!("task {i}")),
        )
        .unwrap();
    }
    for i in 0..nodes * edges_per_node {
        let s = rng.random_range(0..nodes);
        let t = rng.random_range(0..nodes);
        g.put(Value::edge(format!("e{i}"), format!("n{s}"), format!("n{t}")))
            .unwrap();
    }
    g
}

fn three_axis_state(mode: Composition) -> FilterState {
    FilterState::new()
        .mode(mode)
        .with(
            Axis::Categorical,
            AxisFilter::any(vec![
                Condition::equals("status", "todo"),
                Condition::equals("status", "doing"),
            ]),
        )
        .with(
            Axis::Ordinal,
            AxisFilter::all(vec![Condition::range("priority", Some(3.0.into()), None)]),
        )
        .with(
            Axis::Temporal,
            AxisFilter::all(vec![Condition::during(
                Some("due"),
                vec![
                    TimeRange::days("2024-02-01", "2024-02-07").unwrap(),
                    TimeRange::days("2024-02-20", "2024-02-25").unwrap(),
                ],
            )]),
        )
}

fn bench_separation(c: &mut Criterion) {
    let config = EngineConfig::default();
    let mut group = c.benchmark_group("separation");
    for size in [1_000, 10_000] {
        let g = build_graph(size, 2);
        for mode in [Composition::And, Composition::Or] {
            let plan = Compiler::new(&config)
                .compile(&three_axis_state(mode))
                .unwrap()
                .plan;
            group.bench_with_input(
                BenchmarkId::new(mode.keyword(), size),
                &plan,
                |b, plan| b.iter(|| execute(black_box(&g), plan, None).unwrap()),
            );
        }
    }
    group.finish();
}

fn bench_traversal(c: &mut Criterion) {
    let g = build_graph(10_000, 3);
    let seeds = vec![ValueId::from("n0")];
    let mut group = c.benchmark_group("traversal");
    for depth in [1, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                ConnectionEngine::new(black_box(&g))
                    .traverse(&seeds, depth)
                    .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_separation, bench_traversal);
criterion_main!(benches);
