//! Per-variant extended Kalman filter over queueing parameters.
//!
//! State `x = [alpha, beta, gamma, delta]` is held as a plain `[f64;
//! 4]` and matrix algebra is hand-rolled for the small fixed shapes
//! involved (4x4 covariance, 2x4 Jacobian) rather than pulled in via a
//! linear-algebra crate.

use crate::model::QueueingParams;
use crate::queueing::{QueueAnalyzer, RequestSize};

/// 95%-confidence upper bound for a 2-degree-of-freedom NIS gate. Not
/// a generic chi-squared table lookup — this specific constant is the
/// one the design calls for.
pub const NIS_THRESHOLD: f64 = 7.378;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    /// Fraction of each state component used to build process noise
    /// `Q = diag(pct_change^2 * x^2)`.
    pub pct_change: f64,
    /// Bounded-state clamp factors: `[0.1*x_init, 10*x_init]` by
    /// default.
    pub min_state_factor: f64,
    pub max_state_factor: f64,
    /// Relative measurement noise used to build
    /// `R = diag(error_level^2 * h(x)^2)`.
    pub error_level: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            pct_change: 0.1,
            min_state_factor: 0.1,
            max_state_factor: 10.0,
            error_level: 0.1,
        }
    }
}

/// The operating point the observation function evaluates `h(x)` at:
/// everything about the variant's current load that isn't itself part
/// of the state vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationContext {
    pub rate_per_sec: f64,
    pub request_size: RequestSize,
    pub max_batch_size: u32,
    pub max_queue_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KalmanState {
    pub x: [f64; 4],
    pub p: [[f64; 4]; 4],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateOutcome {
    pub state: KalmanState,
    pub nis: Option<f64>,
    pub validation_failed: bool,
}

/// `h(x)`: predicted `(TTFT, ITL)` for the queueing parameters packed
/// into `x`, evaluated at `ctx`. `None` if the analyzer rejects the
/// rate or parameters outright (non-positive params, rate outside the
/// stable range for this `x`).
fn observe(x: &[f64; 4], ctx: &ObservationContext) -> Option<[f64; 2]> {
    let params = QueueingParams::from_vec4(*x);
    let analyzer = QueueAnalyzer::new(params, ctx.request_size, ctx.max_batch_size, ctx.max_queue_size);
    let metrics = analyzer.analyze(ctx.rate_per_sec).ok()?;
    Some([metrics.avg_wait_time + metrics.avg_prefill_time, metrics.avg_token_time])
}

fn jacobian(x: &[f64; 4], ctx: &ObservationContext) -> Option<[[f64; 4]; 2]> {
    let mut h = [[0.0; 4]; 2];
    for i in 0..4 {
        let step = (x[i].abs() * 1e-3).max(1e-6);
        let mut x_plus = *x;
        let mut x_minus = *x;
        x_plus[i] += step;
        x_minus[i] -= step;
        let y_plus = observe(&x_plus, ctx)?;
        let y_minus = observe(&x_minus, ctx)?;
        h[0][i] = (y_plus[0] - y_minus[0]) / (2.0 * step);
        h[1][i] = (y_plus[1] - y_minus[1]) / (2.0 * step);
    }
    Some(h)
}

fn mat4_add(a: [[f64; 4]; 4], b: [[f64; 4]; 4]) -> [[f64; 4]; 4] {
    let mut out = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            out[i][j] = a[i][j] + b[i][j];
        }
    }
    out
}

/// `P H^T`: 4x4 times 4x2 (H^T) -> 4x2.
fn p_ht(p: &[[f64; 4]; 4], h: &[[f64; 4]; 2]) -> [[f64; 2]; 4] {
    let mut out = [[0.0; 2]; 4];
    for i in 0..4 {
        for k in 0..2 {
            let mut acc = 0.0;
            for j in 0..4 {
                acc += p[i][j] * h[k][j];
            }
            out[i][k] = acc;
        }
    }
    out
}

/// `H P H^T + R`: 2x4 * 4x2 -> 2x2, via the already-computed `P H^T`.
fn innovation_covariance(h: &[[f64; 4]; 2], p_ht: &[[f64; 2]; 4], r: &[[f64; 2]; 2]) -> [[f64; 2]; 2] {
    let mut s = [[0.0; 2]; 2];
    for i in 0..2 {
        for k in 0..2 {
            let mut acc = 0.0;
            for j in 0..4 {
                acc += h[i][j] * p_ht[j][k];
            }
            s[i][k] = acc + r[i][k];
        }
    }
    s
}

fn invert_2x2(m: &[[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [m[1][1] * inv_det, -m[0][1] * inv_det],
        [-m[1][0] * inv_det, m[0][0] * inv_det],
    ])
}

/// `Predict`: identity transition, additive process noise
/// `diag(pct_change^2 * x^2)`.
pub fn predict(state: &KalmanState, config: &FilterConfig) -> KalmanState {
    let mut q = [[0.0; 4]; 4];
    for i in 0..4 {
        q[i][i] = (config.pct_change * state.x[i]).powi(2);
    }
    KalmanState {
        x: state.x,
        p: mat4_add(state.p, q),
    }
}

/// `Update`: extended Kalman update with NIS-gated outlier rejection
/// and post-update bounded-state clamping.
///
/// `x_init` anchors the clamp bounds; it is the state the tuner
/// warm-started from this tick, not necessarily `state.x`.
pub fn update(
    state: &KalmanState,
    observation: [f64; 2],
    ctx: &ObservationContext,
    x_init: &[f64; 4],
    config: &FilterConfig,
) -> UpdateOutcome {
    let reject_with_prior = |nis: Option<f64>| UpdateOutcome {
        state: *state,
        nis,
        validation_failed: true,
    };

    let Some(predicted) = observe(&state.x, ctx) else {
        return reject_with_prior(None);
    };
    let Some(h) = jacobian(&state.x, ctx) else {
        return reject_with_prior(None);
    };

    let r = [
        [(config.error_level * predicted[0]).powi(2), 0.0],
        [0.0, (config.error_level * predicted[1]).powi(2)],
    ];

    let p_ht = p_ht(&state.p, &h);
    let s = innovation_covariance(&h, &p_ht, &r);
    let Some(s_inv) = invert_2x2(&s) else {
        return reject_with_prior(None);
    };

    let y_tilde = [observation[0] - predicted[0], observation[1] - predicted[1]];
    let nis = y_tilde[0] * (s_inv[0][0] * y_tilde[0] + s_inv[0][1] * y_tilde[1])
        + y_tilde[1] * (s_inv[1][0] * y_tilde[0] + s_inv[1][1] * y_tilde[1]);

    if nis >= NIS_THRESHOLD {
        return reject_with_prior(Some(nis));
    }

    // K = P H^T S^-1 (4x2 * 2x2 -> 4x2).
    let mut k = [[0.0; 2]; 4];
    for i in 0..4 {
        for c in 0..2 {
            k[i][c] = p_ht[i][0] * s_inv[0][c] + p_ht[i][1] * s_inv[1][c];
        }
    }

    let mut x_new = state.x;
    for i in 0..4 {
        x_new[i] += k[i][0] * y_tilde[0] + k[i][1] * y_tilde[1];
    }

    // P <- (I - K H) P, then symmetrized.
    let mut kh = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            kh[i][j] = k[i][0] * h[0][j] + k[i][1] * h[1][j];
        }
    }
    let mut p_new = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            let mut acc = 0.0;
            for m in 0..4 {
                let i_minus_kh = if i == m { 1.0 } else { 0.0 } - kh[i][m];
                acc += i_minus_kh * state.p[m][j];
            }
            p_new[i][j] = acc;
        }
    }
    for i in 0..4 {
        for j in 0..4 {
            let sym = (p_new[i][j] + p_new[j][i]) / 2.0;
            p_new[i][j] = sym;
        }
    }

    for i in 0..4 {
        let lo = config.min_state_factor * x_init[i];
        let hi = config.max_state_factor * x_init[i];
        x_new[i] = x_new[i].clamp(lo.min(hi), lo.max(hi));
    }

    UpdateOutcome {
        state: KalmanState { x: x_new, p: p_new },
        nis: Some(nis),
        validation_failed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ObservationContext {
        ObservationContext {
            rate_per_sec: 5.0,
            request_size: RequestSize {
                avg_input_tokens: 200.0,
                avg_output_tokens: 100.0,
            },
            max_batch_size: 8,
            max_queue_size: 16,
        }
    }

    fn warm_state() -> KalmanState {
        KalmanState {
            x: [20.0, 2.0, 50.0, 0.05],
            p: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    #[test]
    fn predict_inflates_covariance_only() {
        let state = warm_state();
        let predicted = predict(&state, &FilterConfig::default());
        assert_eq!(predicted.x, state.x);
        for i in 0..4 {
            assert!(predicted.p[i][i] > state.p[i][i]);
        }
    }

    #[test]
    fn update_accepts_observation_near_prediction() {
        let state = warm_state();
        let ctx = ctx();
        let predicted = observe(&state.x, &ctx).expect("observable");
        let outcome = update(&state, predicted, &ctx, &state.x, &FilterConfig::default());
        assert!(!outcome.validation_failed);
        assert!(outcome.nis.unwrap() < NIS_THRESHOLD);
    }

    #[test]
    fn update_rejects_wildly_inconsistent_observation_and_preserves_state() {
        let state = warm_state();
        let ctx = ctx();
        let outcome = update(&state, [10_000.0, 10_000.0], &ctx, &state.x, &FilterConfig::default());
        assert!(outcome.validation_failed);
        assert_eq!(outcome.state.x, state.x);
        assert_eq!(outcome.state.p, state.p);
        assert!(outcome.nis.unwrap() >= NIS_THRESHOLD);
    }

    #[test]
    fn accepted_update_keeps_state_within_bounds_and_covariance_symmetric() {
        let state = warm_state();
        let ctx = ctx();
        let predicted = observe(&state.x, &ctx).expect("observable");
        let nudged = [predicted[0] * 1.01, predicted[1] * 1.01];
        let outcome = update(&state, nudged, &ctx, &state.x, &FilterConfig::default());
        for i in 0..4 {
            let lo = 0.1 * state.x[i];
            let hi = 10.0 * state.x[i];
            assert!(outcome.state.x[i] >= lo - 1e-9 && outcome.state.x[i] <= hi + 1e-9);
        }
        for i in 0..4 {
            for j in 0..4 {
                assert!((outcome.state.p[i][j] - outcome.state.p[j][i]).abs() <= 1e-9);
            }
        }
    }
}
