//! The control-tick orchestrator. Runs the tuner manager, then the
//! queueing-model optimizer, then the saturation analyzer and
//! arbitration, over a snapshot, in that order, and emits one
//! [`Decision`] per eligible variant. Failures on one variant never
//! stop the others.

use std::collections::HashMap;

use crate::model::{
    CurrentAllocation, Decision, ModelCatalogEntry, ReplicaMetrics, ScaleAction, SystemSnapshot, Variant,
};
use crate::optimizer::{self, OptimizerInput};
use crate::queueing::RequestSize;
use crate::saturation::{self, SaturationConfig, VariantSaturationInput};
use crate::tuner::manager::{self, TunerManagerConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickConfig {
    pub tuner: TunerManagerConfig,
    pub saturation: SaturationConfig,
    /// Worker count for the per-variant tuning pass. `1` runs every
    /// variant on the calling thread, which is what the test suite and
    /// the benchmark use for determinism.
    pub parallelism: usize,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tuner: TunerManagerConfig::default(),
            saturation: SaturationConfig::new(0.80, 5.0, 0.10, 3.0)
                .expect("default saturation thresholds are valid"),
            parallelism: 1,
        }
    }
}

/// Everything the orchestrator needs beyond the snapshot itself:
/// per-replica telemetry, keyed by variant.
pub type TelemetryByVariant = HashMap<(String, String), Vec<ReplicaMetrics>>;

/// The orchestrator's full output for one tick: the arbitrated
/// decisions plus the bookkeeping a caller needs for metrics/logging
/// without re-deriving it from the snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub decisions: Vec<Decision>,
    pub variants_considered: u32,
    pub variants_skipped: u32,
    pub nis_rejections: u32,
}

/// Runs one control tick over `snapshot`, mutating it in place with
/// tuned parameters and returning the final per-variant [`Decision`]s.
/// Variants that must be skipped (variant-scoped permanent errors) are
/// omitted from the result and logged, not propagated as a tick
/// failure.
pub fn run_tick(
    snapshot: &mut SystemSnapshot,
    telemetry: &TelemetryByVariant,
    config: &TickConfig,
) -> TickOutcome {
    let n_variants = snapshot.variants.len();
    let tick_span = tracing::info_span!("tick", n_variants);
    let _tick_guard = tick_span.enter();

    // Tune or fall back, per variant, writing into the snapshot.
    // `models` and `variants` are disjoint fields, borrowed separately
    // so the per-variant catalog lookup doesn't conflict with the
    // mutable iteration below.
    let models = snapshot.models.clone();
    let (mut variants_skipped, nis_rejections, perf_updates) = if config.parallelism <= 1 {
        tune_slice(&mut snapshot.variants, &models, &config.tuner)
    } else {
        let chunk_size = snapshot.variants.len().div_ceil(config.parallelism).max(1);
        let tuner_config = &config.tuner;
        std::thread::scope(|scope| {
            let handles: Vec<_> = snapshot
                .variants
                .chunks_mut(chunk_size)
                .map(|chunk| scope.spawn(|| tune_slice(chunk, &models, tuner_config)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap_or_default()).fold(
                (0, 0, Vec::new()),
                |(sk, nr, mut updates), (s, n, u)| {
                    updates.extend(u);
                    (sk + s, nr + n, updates)
                },
            )
        })
    };
    for (model_id, accelerator, params) in perf_updates {
        snapshot.set_perf(&model_id, &accelerator, params);
    }

    // A variant that tuned fine but has no SLO target for its (model,
    // service class) pair can't be sized or arbitrated either: skip it
    // for this tick the same way a tuning failure would, rather than
    // letting it fall through to a saturation-only decision.
    let mut eligible: Vec<usize> = Vec::new();
    for i in 0..snapshot.variants.len() {
        let variant = &snapshot.variants[i];
        if variant.tuner_status.is_none() {
            continue;
        }
        if snapshot.slo_for(&variant.model_id, &variant.service_class).is_none() {
            variants_skipped += 1;
            tracing::warn!(
                variant = %variant.name,
                namespace = %variant.namespace,
                model = %variant.model_id,
                service_class = %variant.service_class,
                "no SLO target for (model, service class); variant skipped this tick"
            );
            continue;
        }
        eligible.push(i);
    }

    // Model-based optimizer, per eligible variant.
    let mut model_based: HashMap<(String, String), optimizer::OptimizerOutput> = HashMap::new();
    for &i in &eligible {
        let variant = &snapshot.variants[i];
        let slo = snapshot
            .slo_for(&variant.model_id, &variant.service_class)
            .expect("eligible variants have a resolvable SLO target");
        let params = match &variant.tuner_status {
            Some(status) => status.params,
            None => match snapshot.perf_for(&variant.model_id, &variant.accelerator) {
                Some(profile) => profile.params,
                None => continue,
            },
        };
        let input = OptimizerInput {
            params,
            request_size: RequestSize {
                avg_input_tokens: variant.observed.avg_input_tokens,
                avg_output_tokens: variant.observed.avg_output_tokens,
            },
            max_batch_size: variant.current.max_batch_size,
            max_queue_size: snapshot
                .perf_for(&variant.model_id, &variant.accelerator)
                .map(|p| p.max_queue_size)
                .unwrap_or(0),
            slo,
            arrival_rate_per_sec: variant.observed.rpm_total / 60.0,
            min_num_replicas: variant.min_num_replicas,
            current_replicas: variant.current.num_replicas,
        };
        model_based.insert(variant.key(), optimizer::size_variant(&input));
    }

    // Saturation analysis and arbitration, grouped by model.
    let mut by_model: HashMap<String, Vec<usize>> = HashMap::new();
    for &i in &eligible {
        by_model.entry(snapshot.variants[i].model_id.clone()).or_default().push(i);
    }

    let mut decisions = Vec::with_capacity(eligible.len());
    for (_model_id, indices) in by_model {
        let analyses: Vec<_> = indices
            .iter()
            .filter_map(|&i| {
                let variant = &snapshot.variants[i];
                telemetry
                    .get(&variant.key())
                    .and_then(|metrics| saturation::analyze_variant(&config.saturation, variant.key(), metrics))
            })
            .collect();
        let model_saturation = saturation::aggregate_model(&analyses);
        let (should_scale_up, scale_up_reason) =
            saturation::should_scale_up(&model_saturation, &config.saturation);

        let inputs: Vec<VariantSaturationInput> = indices
            .iter()
            .map(|&i| {
                let variant = &snapshot.variants[i];
                let analysis = analyses.iter().find(|a| a.variant_key == variant.key());
                VariantSaturationInput {
                    variant_key: variant.key(),
                    ready_replicas: variant.current.ready_replicas,
                    current_replicas: variant.current.num_replicas,
                    desired_replicas: variant.desired.num_replicas,
                    cost: variant.cost,
                    saturation: analysis,
                }
            })
            .collect();
        let targets = saturation::saturation_targets(&inputs, should_scale_up, &config.saturation);

        for &i in &indices {
            let variant = &snapshot.variants[i];
            let key = variant.key();
            let current_replicas = variant.current.num_replicas;

            let target = targets.iter().find(|t| t.variant_key == key);
            let saturation_target_replicas = target.map(|t| t.target_replicas).unwrap_or(current_replicas);
            let saturation_action = classify(saturation_target_replicas, current_replicas);

            let model_output = model_based.get(&key).copied();
            let model_based_action = model_output.map(|o| o.action).unwrap_or(ScaleAction::NoChange);
            let model_based_target = model_output.map(|o| o.target_replicas).unwrap_or(current_replicas);

            let scale_down_safe = analyses
                .iter()
                .find(|a| a.variant_key == key)
                .map(|a| a.scale_down_safe(&config.saturation))
                .unwrap_or(false);

            let (action, target_replicas, mut reason, flags) = saturation::arbitrate(
                saturation_action,
                saturation_target_replicas,
                model_based_action,
                model_based_target,
                scale_down_safe,
                current_replicas,
            );
            if flags.saturation_based {
                reason = format!("{reason} ({scale_up_reason})");
            }

            decisions.push(Decision {
                variant: variant.name.clone(),
                namespace: variant.namespace.clone(),
                action,
                target_replicas,
                reason,
                flags,
            });
        }
    }

    TickOutcome {
        decisions,
        variants_considered: n_variants as u32,
        variants_skipped,
        nis_rejections,
    }
}

/// Runs the tuning pass over one contiguous slice of variants,
/// mutating each in place. Returns `(variants_skipped,
/// nis_rejections, perf_updates)` for that slice so the caller can sum
/// the counters and apply the per-model profile updates across
/// workers; `set_perf` itself isn't called here since it needs a
/// mutable borrow of the whole snapshot, which a spawned worker never
/// holds.
fn tune_slice(
    variants: &mut [Variant],
    models: &HashMap<String, ModelCatalogEntry>,
    tuner_config: &TunerManagerConfig,
) -> (u32, u32, Vec<(String, String, crate::model::QueueingParams)>) {
    let mut variants_skipped = 0u32;
    let mut nis_rejections = 0u32;
    let mut perf_updates = Vec::new();

    for variant in variants.iter_mut() {
        let variant_span = tracing::debug_span!("variant", name = %variant.name, namespace = %variant.namespace);
        let _variant_guard = variant_span.enter();

        let current = variant.current;
        let observed = variant.observed;
        let accel_profile = models
            .get(&variant.model_id)
            .and_then(|entry| entry.profiles.get(&variant.accelerator))
            .cloned();
        let outcome = manager::tune_variant(
            variant.tuner_status.as_ref(),
            &current,
            &observed,
            accel_profile.as_ref(),
            variant.activate_model_tuner,
            tuner_config,
        );

        match outcome {
            Ok(outcome) => {
                if outcome.validation_failed {
                    nis_rejections += 1;
                    tracing::warn!(nis = ?outcome.last_nis, "tuner observation rejected");
                }
                if !outcome.preserve_existing_covariance {
                    variant.tuner_status = Some(crate::model::TunerStatus {
                        params: outcome.params,
                        covariance: outcome.covariance,
                        last_nis: outcome.last_nis,
                        model_id: variant.model_id.clone(),
                        accelerator: variant.accelerator.clone(),
                        updated_at: variant.tuner_status.as_ref().map(|s| s.updated_at).unwrap_or(0),
                    });
                } else if let Some(existing) = variant.tuner_status.as_mut() {
                    existing.last_nis = outcome.last_nis;
                }
                perf_updates.push((variant.model_id.clone(), variant.accelerator.clone(), outcome.params));
            }
            Err(reason) => {
                // Variant-scoped permanent error: leave tuner_status
                // untouched, skip it below by excluding it from
                // eligible_variants.
                variants_skipped += 1;
                tracing::warn!(error = %reason, "variant skipped this tick");
            }
        }
    }

    (variants_skipped, nis_rejections, perf_updates)
}

fn classify(target: u32, current: u32) -> ScaleAction {
    if target > current {
        ScaleAction::ScaleUp
    } else if target < current {
        ScaleAction::ScaleDown
    } else {
        ScaleAction::NoChange
    }
}

/// Convenience used by the CLI to build an (empty) `CurrentAllocation`
/// for variants with no reported telemetry yet.
pub fn zeroed_allocation(max_batch_size: u32) -> CurrentAllocation {
    CurrentAllocation { num_replicas: 0, ready_replicas: 0, max_batch_size }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CurrentAllocation, DesiredAllocation, ObservedLoad, QueueingParams, Variant};

    fn base_variant(name: &str, cost: f64, replicas: u32) -> Variant {
        Variant {
            name: name.to_string(),
            namespace: "ns".to_string(),
            model_id: "llama-8b".to_string(),
            accelerator: "h100".to_string(),
            service_class: "gold".to_string(),
            activate_model_tuner: false,
            min_num_replicas: 1,
            current: CurrentAllocation { num_replicas: replicas, ready_replicas: replicas, max_batch_size: 8 },
            observed: ObservedLoad {
                rpm_total: 300.0,
                avg_input_tokens: 200.0,
                avg_output_tokens: 100.0,
                ttft_avg_ms: 190.0,
                itl_avg_ms: 22.0,
            },
            desired: DesiredAllocation::default(),
            tuner_status: None,
            cost,
        }
    }

    fn snapshot_with(variants: Vec<Variant>) -> SystemSnapshot {
        let mut snapshot = SystemSnapshot::default();
        snapshot.set_perf(
            "llama-8b",
            "h100",
            QueueingParams { alpha: 20.0, beta: 2.0, gamma: 50.0, delta: 0.05 },
        );
        snapshot.service_classes.insert(
            ("llama-8b".to_string(), "gold".to_string()),
            crate::model::SloTargets { slo_ttft_ms: 300.0, slo_itl_ms: 40.0 },
        );
        snapshot.variants = variants;
        snapshot
    }

    #[test]
    fn tick_emits_one_decision_per_eligible_variant() {
        let mut snapshot = snapshot_with(vec![base_variant("v1", 10.0, 2)]);
        let config = TickConfig {
            tuner: TunerManagerConfig::default(),
            saturation: SaturationConfig::new(0.80, 5.0, 0.10, 3.0).unwrap(),
            parallelism: 1,
        };
        let telemetry = TelemetryByVariant::new();
        let outcome = run_tick(&mut snapshot, &telemetry, &config);
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.decisions[0].variant, "v1");
        assert_eq!(outcome.variants_considered, 1);
        assert_eq!(outcome.variants_skipped, 0);
    }
}
