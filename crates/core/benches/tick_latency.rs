//! Latency benchmark for one control tick, scaled by variant count.

use autoscaler_core::model::{
    CurrentAllocation, DesiredAllocation, ObservedLoad, QueueingParams, SystemSnapshot, Variant,
};
use autoscaler_core::saturation::SaturationConfig;
use autoscaler_core::tick::{run_tick, TelemetryByVariant, TickConfig};
use autoscaler_core::tuner::TunerManagerConfig;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn snapshot_with_variants(n: usize) -> SystemSnapshot {
    let mut snapshot = SystemSnapshot::default();
    snapshot.set_perf(
        "llama-8b",
        "h100",
        QueueingParams { alpha: 20.0, beta: 2.0, gamma: 50.0, delta: 0.05 },
    );
    snapshot.service_classes.insert(
        ("llama-8b".to_string(), "gold".to_string()),
        autoscaler_core::model::SloTargets { slo_ttft_ms: 300.0, slo_itl_ms: 40.0 },
    );
    snapshot.variants = (0..n)
        .map(|i| Variant {
            name: format!("v{i}"),
            namespace: "ns".to_string(),
            model_id: "llama-8b".to_string(),
            accelerator: "h100".to_string(),
            service_class: "gold".to_string(),
            activate_model_tuner: false,
            min_num_replicas: 1,
            current: CurrentAllocation { num_replicas: 2, ready_replicas: 2, max_batch_size: 8 },
            observed: ObservedLoad {
                rpm_total: 300.0,
                avg_input_tokens: 200.0,
                avg_output_tokens: 100.0,
                ttft_avg_ms: 190.0,
                itl_avg_ms: 22.0,
            },
            desired: DesiredAllocation::default(),
            tuner_status: None,
            cost: 10.0,
        })
        .collect();
    snapshot
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_tick");
    let config = TickConfig {
        tuner: TunerManagerConfig::default(),
        saturation: SaturationConfig::new(0.80, 5.0, 0.10, 3.0).unwrap(),
        parallelism: 1,
    };
    let telemetry = TelemetryByVariant::new();

    for num_variants in [1, 10, 100].iter() {
        group.bench_with_input(
            BenchmarkId::new("run_tick", num_variants),
            num_variants,
            |b, &n| {
                b.iter_batched(
                    || snapshot_with_variants(n),
                    |mut snapshot| black_box(run_tick(&mut snapshot, &telemetry, &config)),
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_tick);
criterion_main!(benches);
