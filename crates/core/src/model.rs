//! Tick-scoped data model: the types that flow between the tuner, the
//! saturation analyzer, the optimizer, and the orchestrator.
//!
//! [`SystemSnapshot`] is created fresh at the start of each control
//! tick, mutated in place by the tuner manager and optimizer, and
//! dropped at tick end — nothing here is meant to outlive a tick
//! except the bits a caller explicitly persists via [`crate::persist`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// State-dependent queueing parameters for one (model, accelerator)
/// pairing, as produced by the Kalman tuner or, failing that, a
/// catalog default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueingParams {
    /// Decode intercept (msec).
    pub alpha: f64,
    /// Decode per-token-in-batch slope (msec).
    pub beta: f64,
    /// Prefill intercept (msec).
    pub gamma: f64,
    /// Prefill per-(input-token x batch) slope (msec).
    pub delta: f64,
}

impl QueueingParams {
    pub fn as_vec4(&self) -> [f64; 4] {
        [self.alpha, self.beta, self.gamma, self.delta]
    }

    pub fn from_vec4(v: [f64; 4]) -> Self {
        Self {
            alpha: v[0],
            beta: v[1],
            gamma: v[2],
            delta: v[3],
        }
    }

    /// A full result requires alpha and gamma strictly positive, with
    /// delta and beta only required to be non-negative.
    pub fn is_full(&self) -> bool {
        self.alpha > 0.0 && self.gamma > 0.0 && self.beta >= 0.0 && self.delta >= 0.0
    }
}

/// Per-accelerator performance entry in the model catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorProfile {
    pub accelerator: String,
    pub params: QueueingParams,
    pub max_batch_size: u32,
    pub max_queue_size: u32,
}

/// One model's catalog of accelerator profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    pub model_id: String,
    pub profiles: HashMap<String, AcceleratorProfile>,
}

/// SLO targets for one (model, service class) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SloTargets {
    pub slo_ttft_ms: f64,
    pub slo_itl_ms: f64,
}

/// Observed load and latency for a variant, as reported by telemetry
/// and aggregated by the external collaborator before this tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservedLoad {
    /// Aggregate arrival rate across the variant's replicas, req/min.
    pub rpm_total: f64,
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
    pub ttft_avg_ms: f64,
    pub itl_avg_ms: f64,
}

/// Current replica allocation for a variant, as read from its status
/// record at the start of the tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentAllocation {
    pub num_replicas: u32,
    /// Replicas that have actually reported telemetry this tick.
    pub ready_replicas: u32,
    pub max_batch_size: u32,
}

/// Desired allocation, filled in by the orchestrator over the course
/// of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DesiredAllocation {
    pub num_replicas: u32,
}

/// Typed, in-memory form of a variant's persisted tuner state. The
/// wire format (stringly-typed, 6-digit decimal strings) lives in
/// [`crate::persist`]; this is what the filter and manager work with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunerStatus {
    pub params: QueueingParams,
    /// Row-major 4x4 covariance.
    pub covariance: [[f64; 4]; 4],
    pub last_nis: Option<f64>,
    pub model_id: String,
    pub accelerator: String,
    /// Unix seconds of the last update.
    pub updated_at: u64,
}

impl TunerStatus {
    /// A full status is the authoritative warm start for the next
    /// tuning pass: valid params plus a symmetric 4x4 covariance.
    pub fn is_full(&self) -> bool {
        self.params.is_full() && is_symmetric(&self.covariance, 1e-6)
    }
}

pub fn is_symmetric(m: &[[f64; 4]; 4], eps: f64) -> bool {
    for i in 0..4 {
        for j in 0..4 {
            if (m[i][j] - m[j][i]).abs() > eps {
                return false;
            }
        }
    }
    true
}

/// Per-replica telemetry snapshot consumed by the saturation analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaMetrics {
    pub pod_name: String,
    pub variant_name: String,
    pub model_id: String,
    pub accelerator: String,
    pub cost: f64,
    /// Fraction of attention-KV memory in use, in `[0, 1]`.
    pub kv_cache_usage: f64,
    pub queue_length: u32,
}

/// A single variant: a (model, accelerator) deployment pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub namespace: String,
    pub model_id: String,
    pub accelerator: String,
    pub service_class: String,
    pub activate_model_tuner: bool,
    /// 1 by default; 0 only permitted when scale-to-zero is enabled
    /// externally.
    pub min_num_replicas: u32,
    pub current: CurrentAllocation,
    pub observed: ObservedLoad,
    pub desired: DesiredAllocation,
    pub tuner_status: Option<TunerStatus>,
    /// Cost per replica-hour for this variant's accelerator, used by
    /// the saturation analyzer's cheapest/most-expensive tie-break.
    pub cost: f64,
}

impl Variant {
    pub fn key(&self) -> (String, String) {
        (self.name.clone(), self.namespace.clone())
    }
}

/// The tick-scoped input/output bundle. Owns everything for the
/// duration of one control tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub models: HashMap<String, ModelCatalogEntry>,
    /// Keyed by (model_id, service_class_name).
    pub service_classes: HashMap<(String, String), SloTargets>,
    pub variants: Vec<Variant>,
}

impl SystemSnapshot {
    pub fn perf_for(&self, model_id: &str, accelerator: &str) -> Option<&AcceleratorProfile> {
        self.models.get(model_id)?.profiles.get(accelerator)
    }

    pub fn slo_for(&self, model_id: &str, service_class: &str) -> Option<SloTargets> {
        self.service_classes
            .get(&(model_id.to_string(), service_class.to_string()))
            .copied()
    }

    pub fn set_perf(&mut self, model_id: &str, accelerator: &str, params: QueueingParams) {
        let entry = self
            .models
            .entry(model_id.to_string())
            .or_insert_with(|| ModelCatalogEntry {
                model_id: model_id.to_string(),
                profiles: HashMap::new(),
            });
        if let Some(profile) = entry.profiles.get_mut(accelerator) {
            profile.params = params;
        } else {
            entry.profiles.insert(
                accelerator.to_string(),
                AcceleratorProfile {
                    accelerator: accelerator.to_string(),
                    params,
                    max_batch_size: 0,
                    max_queue_size: 0,
                },
            );
        }
    }
}

/// Scaling action arbitrated by the orchestrator for one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    NoChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecisionFlags {
    pub saturation_based: bool,
    pub model_based_decision: bool,
    pub safety_override: bool,
}

/// The orchestrator's final, per-variant output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub variant: String,
    pub namespace: String,
    pub action: ScaleAction,
    pub target_replicas: u32,
    pub reason: String,
    pub flags: DecisionFlags,
}
