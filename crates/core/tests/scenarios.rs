//! End-to-end tick scenarios exercising the full tuning, sizing, and
//! arbitration pipeline together, rather than any one module in
//! isolation. Most arbitration outcomes are covered at the unit level
//! in the saturation and Kalman-filter modules; these two need the
//! whole tick because they depend on the saturation layer and the
//! model-based optimizer disagreeing.

use autoscaler_core::model::{
    CurrentAllocation, DesiredAllocation, ObservedLoad, QueueingParams, ReplicaMetrics,
    ScaleAction, SloTargets, SystemSnapshot, Variant,
};
use autoscaler_core::saturation::SaturationConfig;
use autoscaler_core::tick::{run_tick, TelemetryByVariant, TickConfig};
use autoscaler_core::tuner::TunerManagerConfig;

fn default_config() -> TickConfig {
    TickConfig {
        tuner: TunerManagerConfig::default(),
        saturation: SaturationConfig::new(0.80, 5.0, 0.10, 3.0).unwrap(),
        parallelism: 1,
    }
}

fn pod(name: &str, kv: f64, q: u32) -> ReplicaMetrics {
    ReplicaMetrics {
        pod_name: name.to_string(),
        variant_name: "v1".to_string(),
        model_id: "llama-8b".to_string(),
        accelerator: "h100".to_string(),
        cost: 10.0,
        kv_cache_usage: kv,
        queue_length: q,
    }
}

/// Saturation wants scale-up while the model-based optimizer wants
/// scale-down. The veto wins outright.
#[test]
fn scenario_c_safety_veto_blocks_model_based_scale_down() {
    let mut snapshot = SystemSnapshot::default();
    snapshot.set_perf(
        "llama-8b",
        "h100",
        QueueingParams { alpha: 20.0, beta: 2.0, gamma: 50.0, delta: 0.05 },
    );
    snapshot.service_classes.insert(
        ("llama-8b".to_string(), "gold".to_string()),
        SloTargets { slo_ttft_ms: 300.0, slo_itl_ms: 40.0 },
    );
    snapshot.variants = vec![Variant {
        name: "v1".to_string(),
        namespace: "ns".to_string(),
        model_id: "llama-8b".to_string(),
        accelerator: "h100".to_string(),
        service_class: "gold".to_string(),
        activate_model_tuner: false,
        min_num_replicas: 1,
        current: CurrentAllocation { num_replicas: 3, ready_replicas: 3, max_batch_size: 8 },
        observed: ObservedLoad {
            // Tiny arrival rate: the optimizer sizes this down to a
            // single replica, well below the current allocation of 3.
            rpm_total: 0.1,
            avg_input_tokens: 200.0,
            avg_output_tokens: 100.0,
            ttft_avg_ms: 190.0,
            itl_avg_ms: 22.0,
        },
        desired: DesiredAllocation::default(),
        tuner_status: None,
        cost: 10.0,
    }];

    let mut telemetry = TelemetryByVariant::new();
    telemetry.insert(
        ("v1".to_string(), "ns".to_string()),
        vec![pod("p1", 0.75, 2), pod("p2", 0.76, 2)],
    );

    let outcome = run_tick(&mut snapshot, &telemetry, &default_config());
    assert_eq!(outcome.decisions.len(), 1);
    let decision = &outcome.decisions[0];
    assert_eq!(decision.action, ScaleAction::NoChange);
    assert_eq!(decision.target_replicas, 3);
    assert!(decision.flags.safety_override);
    assert!(decision.reason.contains("Saturation veto"), "reason was: {}", decision.reason);
}

/// A pending desired allocation is preserved, and the cheapest
/// non-preserved variant wins the saturation-driven scale-up, run
/// through the full tick rather than `saturation_targets` directly.
#[test]
fn scenario_d_preserves_pending_desired_and_picks_cheapest_for_scale_up() {
    let mut snapshot = SystemSnapshot::default();
    snapshot.set_perf(
        "shared-model",
        "h100",
        QueueingParams { alpha: 20.0, beta: 2.0, gamma: 50.0, delta: 0.05 },
    );
    snapshot.service_classes.insert(
        ("shared-model".to_string(), "gold".to_string()),
        SloTargets { slo_ttft_ms: 300.0, slo_itl_ms: 40.0 },
    );

    let make_variant = |name: &str, cost: f64, desired: u32| Variant {
        name: name.to_string(),
        namespace: "ns".to_string(),
        model_id: "shared-model".to_string(),
        accelerator: "h100".to_string(),
        service_class: "gold".to_string(),
        activate_model_tuner: false,
        // min_num_replicas=2 pins the model-based target at the
        // current allocation regardless of the exact operating rate,
        // isolating this scenario to the saturation layer's behavior.
        min_num_replicas: 2,
        current: CurrentAllocation { num_replicas: 2, ready_replicas: 2, max_batch_size: 8 },
        observed: ObservedLoad {
            rpm_total: 0.01,
            avg_input_tokens: 200.0,
            avg_output_tokens: 100.0,
            ttft_avg_ms: 190.0,
            itl_avg_ms: 22.0,
        },
        desired: DesiredAllocation { num_replicas: desired },
        tuner_status: None,
        cost,
    };

    snapshot.variants = vec![
        make_variant("v1", 20.0, 4),
        make_variant("v2", 5.0, 0),
        make_variant("v3", 15.0, 0),
    ];

    // No replicas report telemetry this tick; the saturation layer
    // still fires because average spare capacity defaults to zero
    // when nothing is reporting.
    let telemetry = TelemetryByVariant::new();

    let outcome = run_tick(&mut snapshot, &telemetry, &default_config());
    assert_eq!(outcome.decisions.len(), 3);

    let find = |name: &str| outcome.decisions.iter().find(|d| d.variant == name).unwrap();

    let v1 = find("v1");
    assert_eq!(v1.action, ScaleAction::ScaleUp);
    assert_eq!(v1.target_replicas, 4);

    let v2 = find("v2");
    assert_eq!(v2.action, ScaleAction::ScaleUp);
    assert_eq!(v2.target_replicas, 3);
    assert!(v2.flags.saturation_based);

    let v3 = find("v3");
    assert_eq!(v3.action, ScaleAction::NoChange);
    assert_eq!(v3.target_replicas, 2);
}
