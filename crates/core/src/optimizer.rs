//! Given tuned queueing parameters and a variant's SLO targets,
//! computes the minimum replica count that keeps per-replica load
//! within the sizing the analyzer finds sustainable.

use crate::model::{QueueingParams, ScaleAction, SloTargets};
use crate::queueing::{QueueAnalyzer, RequestSize, SizeTargets};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerInput {
    pub params: QueueingParams,
    pub request_size: RequestSize,
    pub max_batch_size: u32,
    pub max_queue_size: u32,
    pub slo: SloTargets,
    /// Total arrival rate across the variant's replicas, req/sec.
    pub arrival_rate_per_sec: f64,
    pub min_num_replicas: u32,
    pub current_replicas: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerOutput {
    pub action: ScaleAction,
    pub target_replicas: u32,
    /// `None` when `Size` failed and the result is the best-effort
    /// scale-up-by-one fallback.
    pub max_rate_per_replica: Option<f64>,
}

/// A rough tokens/sec target derived from the SLO's ITL bound: the
/// fastest decode rate the class tolerates, used only as the `Size`
/// TPS constraint (treated as a fixed safety fraction rather than a
/// real bisection target, so this value mostly just satisfies the
/// call signature).
fn implied_tps_target(slo: &SloTargets) -> f64 {
    if slo.slo_itl_ms <= 0.0 {
        return f64::MAX;
    }
    1000.0 / slo.slo_itl_ms
}

/// Sizes a single variant via `Size`, bounded below by
/// `min_num_replicas`, falling back to `current + 1` if `Size` finds
/// no feasible operating point.
pub fn size_variant(input: &OptimizerInput) -> OptimizerOutput {
    let analyzer = QueueAnalyzer::new(
        input.params,
        input.request_size,
        input.max_batch_size,
        input.max_queue_size,
    );
    let targets = SizeTargets {
        target_ttft_ms: input.slo.slo_ttft_ms,
        target_itl_ms: input.slo.slo_itl_ms,
        target_tps: implied_tps_target(&input.slo),
    };

    match analyzer.size(targets) {
        Ok(result) => {
            let required = (input.arrival_rate_per_sec / result.operating_rate).ceil() as u32;
            finish(
                required.max(input.min_num_replicas),
                input.current_replicas,
                Some(result.operating_rate),
            )
        }
        // Any sizing failure falls back to the same best-effort signal:
        // a variant that can't be sized at all should not stall.
        Err(_) => finish(
            (input.current_replicas + 1).max(input.min_num_replicas),
            input.current_replicas,
            None,
        ),
    }
}

fn finish(target_replicas: u32, current_replicas: u32, max_rate_per_replica: Option<f64>) -> OptimizerOutput {
    let action = if target_replicas > current_replicas {
        ScaleAction::ScaleUp
    } else if target_replicas < current_replicas {
        ScaleAction::ScaleDown
    } else {
        ScaleAction::NoChange
    };
    OptimizerOutput { action, target_replicas, max_rate_per_replica }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> OptimizerInput {
        OptimizerInput {
            params: QueueingParams { alpha: 20.0, beta: 2.0, gamma: 50.0, delta: 0.05 },
            request_size: RequestSize { avg_input_tokens: 200.0, avg_output_tokens: 100.0 },
            max_batch_size: 8,
            max_queue_size: 16,
            slo: SloTargets { slo_ttft_ms: 300.0, slo_itl_ms: 40.0 },
            arrival_rate_per_sec: 3.0,
            min_num_replicas: 1,
            current_replicas: 1,
        }
    }

    #[test]
    fn sizes_up_when_arrival_rate_exceeds_single_replica_capacity() {
        let mut input = base_input();
        input.arrival_rate_per_sec = 1000.0;
        let out = size_variant(&input);
        assert!(out.target_replicas > 1);
        assert_eq!(out.action, ScaleAction::ScaleUp);
    }

    #[test]
    fn respects_min_num_replicas_floor() {
        let mut input = base_input();
        input.arrival_rate_per_sec = 0.001;
        input.min_num_replicas = 3;
        input.current_replicas = 1;
        let out = size_variant(&input);
        assert!(out.target_replicas >= 3);
    }

    #[test]
    fn infeasible_slo_falls_back_to_scale_up_by_one() {
        let mut input = base_input();
        input.slo = SloTargets { slo_ttft_ms: 0.001, slo_itl_ms: 40.0 };
        input.current_replicas = 4;
        let out = size_variant(&input);
        assert_eq!(out.target_replicas, 5);
        assert_eq!(out.action, ScaleAction::ScaleUp);
        assert!(out.max_rate_per_replica.is_none());
    }
}
