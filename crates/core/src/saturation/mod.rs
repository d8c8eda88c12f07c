//! Classifies replicas as saturated, aggregates spare capacity at
//! model level, and arbitrates between the saturation recommendation
//! and the model-based optimizer's answer.

use crate::model::{DecisionFlags, ReplicaMetrics, ScaleAction};
use crate::AutoscalerError;

/// No universal value for the minimum non-saturated replica count
/// required before a scale-down is considered safe; made configurable
/// here, default 3.
const DEFAULT_MIN_NON_SATURATED_FOR_SCALE_DOWN: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaturationConfig {
    pub kv_cache_threshold: f64,
    pub queue_length_threshold: f64,
    pub kv_spare_trigger: f64,
    pub queue_spare_trigger: f64,
    pub min_non_saturated_for_scale_down: u32,
}

impl SaturationConfig {
    pub fn new(
        kv_cache_threshold: f64,
        queue_length_threshold: f64,
        kv_spare_trigger: f64,
        queue_spare_trigger: f64,
    ) -> Result<Self, AutoscalerError> {
        let config = Self {
            kv_cache_threshold,
            queue_length_threshold,
            kv_spare_trigger,
            queue_spare_trigger,
            min_non_saturated_for_scale_down: DEFAULT_MIN_NON_SATURATED_FOR_SCALE_DOWN,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AutoscalerError> {
        if !(0.0..=1.0).contains(&self.kv_cache_threshold) {
            return Err(AutoscalerError::ConfigMalformed(
                "kv_cache_threshold must be in [0, 1]".to_string(),
            ));
        }
        if self.queue_length_threshold < 0.0 {
            return Err(AutoscalerError::ConfigMalformed(
                "queue_length_threshold must be >= 0".to_string(),
            ));
        }
        if !(0.0..=self.kv_cache_threshold).contains(&self.kv_spare_trigger) {
            return Err(AutoscalerError::ConfigMalformed(
                "kv_spare_trigger must be in [0, kv_cache_threshold]".to_string(),
            ));
        }
        if !(0.0..=self.queue_length_threshold).contains(&self.queue_spare_trigger) {
            return Err(AutoscalerError::ConfigMalformed(
                "queue_spare_trigger must be in [0, queue_length_threshold]".to_string(),
            ));
        }
        Ok(())
    }

    fn is_saturated(&self, m: &ReplicaMetrics) -> bool {
        m.kv_cache_usage >= self.kv_cache_threshold
            || m.queue_length as f64 >= self.queue_length_threshold
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantSaturation {
    pub variant_key: (String, String),
    pub total: u32,
    pub saturated_pods: Vec<String>,
    pub non_saturated: u32,
    pub max_kv_cache_usage: f64,
    pub max_queue_length: u32,
    pub avg_spare_kv: f64,
    pub avg_spare_queue: f64,
    pub accelerator: String,
    pub cost: f64,
    non_saturated_sum_kv_usage: f64,
    non_saturated_sum_queue_length: f64,
}

impl VariantSaturation {
    /// Scale-down safety check: requires enough non-saturated
    /// replicas, then simulates removing one by redistributing the
    /// non-saturated group's load over the rest.
    pub fn scale_down_safe(&self, config: &SaturationConfig) -> bool {
        if self.non_saturated < config.min_non_saturated_for_scale_down {
            return false;
        }
        let remaining = self.non_saturated - 1;
        if remaining == 0 {
            return false;
        }
        let new_avg_kv = self.non_saturated_sum_kv_usage / remaining as f64;
        let new_avg_queue = self.non_saturated_sum_queue_length / remaining as f64;
        let spare_kv = config.kv_cache_threshold - new_avg_kv;
        let spare_queue = config.queue_length_threshold - new_avg_queue;
        spare_kv >= config.kv_spare_trigger && spare_queue >= config.queue_spare_trigger
    }
}

/// Analyzes one variant's replicas. `None` if `metrics` is empty (a
/// variant with no reporting replicas contributes nothing this tick).
pub fn analyze_variant(
    config: &SaturationConfig,
    variant_key: (String, String),
    metrics: &[ReplicaMetrics],
) -> Option<VariantSaturation> {
    if metrics.is_empty() {
        return None;
    }
    let mut saturated_pods = Vec::new();
    let mut max_kv = 0.0f64;
    let mut max_queue = 0u32;
    let mut sum_kv = 0.0;
    let mut sum_queue = 0.0;
    let mut non_saturated = 0u32;

    for m in metrics {
        if config.is_saturated(m) {
            saturated_pods.push(m.pod_name.clone());
        } else {
            non_saturated += 1;
            sum_kv += m.kv_cache_usage;
            sum_queue += m.queue_length as f64;
        }
        max_kv = max_kv.max(m.kv_cache_usage);
        max_queue = max_queue.max(m.queue_length);
    }

    let avg_spare_kv = if non_saturated > 0 {
        config.kv_cache_threshold - sum_kv / non_saturated as f64
    } else {
        0.0
    };
    let avg_spare_queue = if non_saturated > 0 {
        config.queue_length_threshold - sum_queue / non_saturated as f64
    } else {
        0.0
    };

    let first = &metrics[0];
    Some(VariantSaturation {
        variant_key,
        total: metrics.len() as u32,
        saturated_pods,
        non_saturated,
        max_kv_cache_usage: max_kv,
        max_queue_length: max_queue,
        avg_spare_kv,
        avg_spare_queue,
        accelerator: first.accelerator.clone(),
        cost: first.cost,
        non_saturated_sum_kv_usage: sum_kv,
        non_saturated_sum_queue_length: sum_queue,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSaturation {
    pub total_replicas: u32,
    pub non_saturated_count: u32,
    pub avg_spare_kv: f64,
    pub avg_spare_queue: f64,
}

/// Load-weighted (by each variant's non-saturated count) aggregation
/// across all variants serving one model.
pub fn aggregate_model(variants: &[VariantSaturation]) -> ModelSaturation {
    let total_replicas: u32 = variants.iter().map(|v| v.total).sum();
    let non_saturated_count: u32 = variants.iter().map(|v| v.non_saturated).sum();
    let weight_sum: u32 = non_saturated_count;
    let (avg_spare_kv, avg_spare_queue) = if weight_sum > 0 {
        let kv: f64 = variants
            .iter()
            .map(|v| v.avg_spare_kv * v.non_saturated as f64)
            .sum();
        let queue: f64 = variants
            .iter()
            .map(|v| v.avg_spare_queue * v.non_saturated as f64)
            .sum();
        (kv / weight_sum as f64, queue / weight_sum as f64)
    } else {
        (0.0, 0.0)
    };
    ModelSaturation {
        total_replicas,
        non_saturated_count,
        avg_spare_kv,
        avg_spare_queue,
    }
}

/// Decides whether a model's variants should scale up, with a
/// human-readable reason.
pub fn should_scale_up(model: &ModelSaturation, config: &SaturationConfig) -> (bool, String) {
    let kv_fires = model.avg_spare_kv < config.kv_spare_trigger;
    let queue_fires = model.avg_spare_queue < config.queue_spare_trigger;
    let reason = match (kv_fires, queue_fires) {
        (true, true) => "spare KV and queue capacity below trigger".to_string(),
        (true, false) => "spare KV capacity below trigger".to_string(),
        (false, true) => "spare queue capacity below trigger".to_string(),
        (false, false) => "capacity sufficient".to_string(),
    };
    (kv_fires || queue_fires, reason)
}

/// One variant's input to [`saturation_targets`]: its current
/// allocation, pending desired allocation, cost, and saturation
/// analysis (if it reported any metrics this tick).
pub struct VariantSaturationInput<'a> {
    pub variant_key: (String, String),
    pub ready_replicas: u32,
    pub current_replicas: u32,
    pub desired_replicas: u32,
    pub cost: f64,
    pub saturation: Option<&'a VariantSaturation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaturationTarget {
    pub variant_key: (String, String),
    pub target_replicas: u32,
    pub preserved: bool,
}

/// Computes per-variant saturation targets, run once per model across
/// that model's variants.
pub fn saturation_targets(
    variants: &[VariantSaturationInput],
    model_should_scale_up: bool,
    config: &SaturationConfig,
) -> Vec<SaturationTarget> {
    let mut targets: Vec<SaturationTarget> = variants
        .iter()
        .map(|v| {
            let preserved = v.desired_replicas != 0 && v.desired_replicas != v.current_replicas;
            SaturationTarget {
                variant_key: v.variant_key.clone(),
                target_replicas: if preserved { v.desired_replicas } else { v.ready_replicas },
                preserved,
            }
        })
        .collect();

    if model_should_scale_up {
        if let Some(winner) = variants
            .iter()
            .enumerate()
            .filter(|(i, _)| !targets[*i].preserved)
            .min_by(|(_, a), (_, b)| a.cost.total_cmp(&b.cost).then_with(|| a.variant_key.0.cmp(&b.variant_key.0)))
            .map(|(i, _)| i)
        {
            targets[winner].target_replicas = variants[winner].ready_replicas + 1;
        }
    } else {
        let safe_candidate = variants
            .iter()
            .enumerate()
            .filter(|(i, v)| {
                !targets[*i].preserved
                    && v.current_replicas > 1
                    && v.saturation.map(|s| s.scale_down_safe(config)).unwrap_or(false)
            })
            .max_by(|(_, a), (_, b)| a.cost.total_cmp(&b.cost).then_with(|| a.variant_key.0.cmp(&b.variant_key.0)))
            .map(|(i, _)| i);
        if let Some(winner) = safe_candidate {
            targets[winner].target_replicas = variants[winner].ready_replicas.saturating_sub(1);
        }
    }

    targets
}

/// The arbitration table between saturation and model-based sizing,
/// evaluated in the order the rows are listed (first applicable row
/// wins).
pub fn arbitrate(
    saturation_action: ScaleAction,
    saturation_target: u32,
    model_based_action: ScaleAction,
    model_based_target: u32,
    scale_down_safe: bool,
    current_replicas: u32,
) -> (ScaleAction, u32, String, DecisionFlags) {
    if saturation_action == ScaleAction::ScaleUp && model_based_action == ScaleAction::ScaleDown {
        return (
            ScaleAction::NoChange,
            current_replicas,
            "Saturation veto: blocking model-based scale-down while saturation signals rising load"
                .to_string(),
            DecisionFlags { saturation_based: false, model_based_decision: false, safety_override: true },
        );
    }
    if model_based_action == ScaleAction::ScaleDown && !scale_down_safe {
        return (
            ScaleAction::NoChange,
            current_replicas,
            "Safety block: scale-down unsafe, insufficient non-saturated capacity".to_string(),
            DecisionFlags { saturation_based: false, model_based_decision: false, safety_override: true },
        );
    }
    if saturation_action == ScaleAction::ScaleUp && model_based_action == ScaleAction::NoChange {
        return (
            ScaleAction::ScaleUp,
            saturation_target,
            "Saturation-driven scale-up".to_string(),
            DecisionFlags { saturation_based: true, model_based_decision: false, safety_override: false },
        );
    }
    if model_based_action == ScaleAction::ScaleUp {
        return (
            ScaleAction::ScaleUp,
            model_based_target,
            "Model-based scale-up".to_string(),
            DecisionFlags { saturation_based: false, model_based_decision: true, safety_override: false },
        );
    }
    if model_based_action == ScaleAction::ScaleDown {
        return (
            ScaleAction::ScaleDown,
            model_based_target,
            "Model-based scale-down".to_string(),
            DecisionFlags { saturation_based: false, model_based_decision: true, safety_override: false },
        );
    }
    (
        ScaleAction::NoChange,
        current_replicas,
        "No change".to_string(),
        DecisionFlags::default(),
    )
}
