//! Wraps the birth-death model with prefill/decode service-time
//! formulas, exposing `analyze` and `size` over external (req/sec)
//! rates.

use super::model::QueueingModel;
use super::EPSILON;
use crate::model::QueueingParams;
use thiserror::Error;

const MSEC_PER_SEC: f64 = 1000.0;
const BISECTION_TOLERANCE: f64 = 1e-9;
const BISECTION_MAX_ITERS: u32 = 100;
/// TPS target uses a fixed 10% safety fraction (lambda_max * 0.9) —
/// no bisection.
const TPS_SAFETY_FRACTION: f64 = 0.9;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueingError {
    #[error("rate {rate} req/sec out of stable range [{min}, {max}]")]
    RateOutOfRange { rate: f64, min: f64, max: f64 },
    #[error("queueing model invalid at rate {rate} req/sec")]
    InvalidModel { rate: f64 },
    #[error("{target} target below bounded region")]
    TargetBelowBoundedRegion { target: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestSize {
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisMetrics {
    pub throughput: f64,
    pub avg_resp_time: f64,
    pub avg_wait_time: f64,
    pub avg_num_in_serv: f64,
    pub avg_prefill_time: f64,
    pub avg_token_time: f64,
    pub max_rate: f64,
    pub rho: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeTargets {
    pub target_ttft_ms: f64,
    pub target_itl_ms: f64,
    pub target_tps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeResult {
    pub max_rate_ttft: f64,
    pub max_rate_itl: f64,
    pub max_rate_tps: f64,
    /// The minimum of the three max rates; what `metrics` was computed at.
    pub operating_rate: f64,
    pub metrics: AnalysisMetrics,
}

pub struct QueueAnalyzer {
    params: QueueingParams,
    request_size: RequestSize,
    max_batch_size: u32,
    max_queue_size: u32,
}

impl QueueAnalyzer {
    pub fn new(
        params: QueueingParams,
        request_size: RequestSize,
        max_batch_size: u32,
        max_queue_size: u32,
    ) -> Self {
        Self {
            params,
            request_size,
            max_batch_size,
            max_queue_size,
        }
    }

    fn prefill_time(&self, b: u32) -> f64 {
        if self.request_size.avg_input_tokens == 0.0 {
            return 0.0;
        }
        self.params.gamma + self.params.delta * self.request_size.avg_input_tokens * b as f64
    }

    fn decode_time(&self, b: u32) -> f64 {
        self.params.alpha + self.params.beta * b as f64
    }

    fn service_time(&self, b: u32) -> f64 {
        self.prefill_time(b) + (self.request_size.avg_output_tokens - 1.0) * self.decode_time(b)
    }

    fn with_model<R>(&self, f: impl FnOnce(&QueueingModel) -> R) -> R {
        let service_time = |b: u32| self.service_time(b);
        let model = QueueingModel::new(self.max_batch_size, self.max_queue_size, &service_time);
        f(&model)
    }

    /// Internal requests/msec lower bound of the stable operating range.
    pub fn lambda_min_per_ms(&self) -> f64 {
        self.with_model(|m| m.mu(1) * EPSILON)
    }

    /// Internal requests/msec upper bound of the stable operating range.
    pub fn lambda_max_per_ms(&self) -> f64 {
        self.with_model(|m| m.mu(self.max_batch_size) * (1.0 - EPSILON))
    }

    pub fn lambda_min_per_sec(&self) -> f64 {
        self.lambda_min_per_ms() * MSEC_PER_SEC
    }

    pub fn lambda_max_per_sec(&self) -> f64 {
        self.lambda_max_per_ms() * MSEC_PER_SEC
    }

    /// Effective concurrency that would produce `avg_service_time_ms`
    /// under the linear prefill/decode forms, clamped to the batch
    /// range.
    fn invert_concurrency(&self, avg_service_time_ms: f64) -> f64 {
        let out_tokens_minus_one = self.request_size.avg_output_tokens - 1.0;
        let numerator =
            avg_service_time_ms - self.params.gamma - out_tokens_minus_one * self.params.alpha;
        let denominator = self.params.delta * self.request_size.avg_input_tokens
            + out_tokens_minus_one * self.params.beta;
        if denominator.abs() < 1e-12 {
            return 1.0f64.clamp(0.0, self.max_batch_size as f64);
        }
        (numerator / denominator).clamp(0.0, self.max_batch_size as f64)
    }

    pub fn analyze(&self, rate_per_sec: f64) -> Result<AnalysisMetrics, QueueingError> {
        let min = self.lambda_min_per_sec();
        let max = self.lambda_max_per_sec();
        if rate_per_sec <= 0.0 || rate_per_sec > max {
            return Err(QueueingError::RateOutOfRange {
                rate: rate_per_sec,
                min,
                max,
            });
        }
        let lambda_per_ms = rate_per_sec / MSEC_PER_SEC;
        let solution = self
            .with_model(|m| m.solve(lambda_per_ms, EPSILON))
            .ok_or(QueueingError::InvalidModel {
                rate: rate_per_sec,
            })?;
        let n_hat = self.invert_concurrency(solution.avg_service_time);
        let avg_prefill_time = if self.request_size.avg_input_tokens == 0.0 {
            0.0
        } else {
            self.params.gamma + self.params.delta * self.request_size.avg_input_tokens * n_hat
        };
        let avg_token_time = self.params.alpha + self.params.beta * n_hat;

        Ok(AnalysisMetrics {
            throughput: solution.throughput * MSEC_PER_SEC,
            avg_resp_time: solution.avg_resp_time,
            avg_wait_time: solution.avg_wait_time,
            avg_num_in_serv: solution.avg_num_in_serv,
            avg_prefill_time,
            avg_token_time,
            max_rate: max,
            rho: solution.rho,
        })
    }

    /// Largest `rate_per_sec` in `[lo, hi]` for which `metric(rate) <=
    /// target` holds, assuming `metric` is monotonically increasing in
    /// rate. `lo` must already satisfy the bound.
    fn bisect_max_rate(
        &self,
        lo: f64,
        hi: f64,
        target: f64,
        metric: impl Fn(&AnalysisMetrics) -> f64,
    ) -> f64 {
        let mut lo = lo;
        let mut hi = hi;
        for _ in 0..BISECTION_MAX_ITERS {
            if hi - lo <= BISECTION_TOLERANCE {
                break;
            }
            let mid = lo + (hi - lo) / 2.0;
            let within = self
                .analyze(mid)
                .map(|m| metric(&m) <= target)
                .unwrap_or(false);
            if within {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn size(&self, targets: SizeTargets) -> Result<SizeResult, QueueingError> {
        let lo = self.lambda_min_per_sec();
        let hi = self.lambda_max_per_sec();

        let max_rate_ttft = self.bounded_size(
            lo,
            hi,
            targets.target_ttft_ms,
            "TTFT",
            |m| m.avg_wait_time + m.avg_prefill_time,
        )?;
        let max_rate_itl = self.bounded_size(lo, hi, targets.target_itl_ms, "ITL", |m| {
            m.avg_token_time
        })?;
        // TPS never fails: it is a fixed safety fraction of the
        // range, independent of the requested target.
        let _ = targets.target_tps;
        let max_rate_tps = hi * TPS_SAFETY_FRACTION;

        let operating_rate = max_rate_ttft.min(max_rate_itl).min(max_rate_tps);
        let metrics = self.analyze(operating_rate)?;

        Ok(SizeResult {
            max_rate_ttft,
            max_rate_itl,
            max_rate_tps,
            operating_rate,
            metrics,
        })
    }

    fn bounded_size(
        &self,
        lo: f64,
        hi: f64,
        target: f64,
        name: &'static str,
        metric: impl Fn(&AnalysisMetrics) -> f64,
    ) -> Result<f64, QueueingError> {
        let at_lo = self.analyze(lo).map(|m| metric(&m)).unwrap_or(f64::MAX);
        if at_lo > target {
            return Err(QueueingError::TargetBelowBoundedRegion { target: name });
        }
        let at_hi = self.analyze(hi).map(|m| metric(&m)).unwrap_or(f64::MAX);
        if at_hi <= target {
            return Ok(hi);
        }
        Ok(self.bisect_max_rate(lo, hi, target, metric))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> QueueAnalyzer {
        QueueAnalyzer::new(
            QueueingParams {
                alpha: 20.0,
                beta: 2.0,
                gamma: 50.0,
                delta: 0.05,
            },
            RequestSize {
                avg_input_tokens: 200.0,
                avg_output_tokens: 100.0,
            },
            8,
            16,
        )
    }

    #[test]
    fn rate_bounds_are_positive_and_ordered() {
        let a = analyzer();
        assert!(a.lambda_min_per_sec() > 0.0);
        assert!(a.lambda_max_per_sec() > a.lambda_min_per_sec());
    }

    #[test]
    fn analyze_rejects_rate_outside_range() {
        let a = analyzer();
        assert!(a.analyze(-1.0).is_err());
        assert!(a.analyze(a.lambda_max_per_sec() * 2.0).is_err());
    }

    #[test]
    fn size_chooses_minimum_of_the_three_rates() {
        let a = analyzer();
        let targets = SizeTargets {
            target_ttft_ms: 1_000.0,
            target_itl_ms: 100.0,
            target_tps: 5_000.0,
        };
        let result = a.size(targets).expect("feasible targets");
        assert_eq!(
            result.operating_rate,
            result
                .max_rate_ttft
                .min(result.max_rate_itl)
                .min(result.max_rate_tps)
        );
        assert!(result.operating_rate > 0.0);
    }

    #[test]
    fn size_fails_when_ttft_target_unreachable() {
        let a = analyzer();
        let targets = SizeTargets {
            target_ttft_ms: 0.001,
            target_itl_ms: 100.0,
            target_tps: 5_000.0,
        };
        let err = a.size(targets).expect_err("target below bounded region");
        assert_eq!(err, QueueingError::TargetBelowBoundedRegion { target: "TTFT" });
    }

    #[test]
    fn analyze_then_size_round_trip_meets_targets_within_tolerance() {
        let a = analyzer();
        let targets = SizeTargets {
            target_ttft_ms: 300.0,
            target_itl_ms: 40.0,
            target_tps: 5_000.0,
        };
        let result = a.size(targets).expect("feasible");
        let re_analyzed = a.analyze(result.operating_rate).expect("valid rate");
        assert!(
            re_analyzed.avg_wait_time + re_analyzed.avg_prefill_time
                <= targets.target_ttft_ms * 1.001
        );
        assert!(re_analyzed.avg_token_time <= targets.target_itl_ms * 1.001);
    }
}
