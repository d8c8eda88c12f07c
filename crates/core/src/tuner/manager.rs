//! Owns tuner state across the variants active this tick. Resolves
//! which initial state to warm-start from, runs predict/update, and
//! decides what to write back on every outcome — success, NIS
//! rejection, or fallback.

use super::kalman::{self, FilterConfig, KalmanState, ObservationContext};
use crate::model::{AcceleratorProfile, CurrentAllocation, ObservedLoad, QueueingParams, TunerStatus};
use crate::queueing::RequestSize;
use crate::AutoscalerError;

/// `BASE_FACTOR` in the warm-start guess formula below.
const GUESS_BASE_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunerManagerConfig {
    pub auto_guess_initial_state: bool,
    pub filter: FilterConfig,
}

impl Default for TunerManagerConfig {
    fn default() -> Self {
        Self {
            auto_guess_initial_state: false,
            filter: FilterConfig::default(),
        }
    }
}

/// Where a tuning attempt's resulting parameters came from — carried
/// only for observability, never branched on by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    WarmStart,
    Tuned,
    Guess,
    Catalog,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuneOutcome {
    pub params: QueueingParams,
    pub covariance: [[f64; 4]; 4],
    pub last_nis: Option<f64>,
    pub validation_failed: bool,
    pub source: ParamSource,
    /// If true, an existing status covariance must not be overwritten
    /// with this outcome's covariance — preserves Kalman warm-start
    /// potential across a fallback tick.
    pub preserve_existing_covariance: bool,
}

/// A rough initial parameter guess from aggregate observed load.
/// Returns `None` ("insufficient metrics") when preconditions aren't
/// met.
pub fn guess(observed: &ObservedLoad, num_replicas: u32) -> Option<QueueingParams> {
    if !(num_replicas > 0
        && observed.rpm_total > 0.0
        && observed.avg_input_tokens > 0.0
        && observed.avg_output_tokens > 0.0
        && (observed.ttft_avg_ms + observed.itl_avg_ms) > 0.0)
    {
        return None;
    }
    let lambda_prime = observed.rpm_total / (num_replicas as f64 * 60.0 * 1000.0);
    let avg_latency = observed.ttft_avg_ms + observed.itl_avg_ms * observed.avg_output_tokens;
    let avg_conc = lambda_prime * avg_latency;
    if avg_conc <= 0.0 {
        return None;
    }
    let alpha = GUESS_BASE_FACTOR * observed.itl_avg_ms;
    let beta = (observed.itl_avg_ms - alpha) / avg_conc;
    let gamma = GUESS_BASE_FACTOR * observed.ttft_avg_ms;
    let delta = (observed.ttft_avg_ms - gamma) / (avg_conc * observed.avg_input_tokens);
    Some(QueueingParams { alpha, beta, gamma, delta })
}

/// Environment validity: `{numReplicas>0, arrivalRate>=0,
/// maxBatch>0}`.
fn environment_valid(current: &CurrentAllocation, observed: &ObservedLoad) -> bool {
    current.num_replicas > 0 && observed.rpm_total >= 0.0 && current.max_batch_size > 0
}

/// Rate-per-replica in requests/sec, as the analyzer expects.
fn rate_per_replica_per_sec(current: &CurrentAllocation, observed: &ObservedLoad) -> f64 {
    (observed.rpm_total / current.num_replicas as f64) / 60.0
}

fn default_covariance(x_init: &[f64; 4]) -> [[f64; 4]; 4] {
    let mut p = [[0.0; 4]; 4];
    for i in 0..4 {
        p[i][i] = (0.5 * x_init[i]).powi(2);
    }
    p
}

/// Resolves the initial parameter vector by priority, *not* counting
/// an already-full `TunerStatus` (callers check that first since it
/// also carries covariance).
fn resolve_fallback_params(
    observed: &ObservedLoad,
    num_replicas: u32,
    profile: Option<&AcceleratorProfile>,
    auto_guess: bool,
) -> Option<(QueueingParams, ParamSource)> {
    let catalog = profile.map(|p| (p.params, ParamSource::Catalog));
    let guessed = guess(observed, num_replicas).map(|p| (p, ParamSource::Guess));
    if auto_guess {
        guessed.or(catalog)
    } else {
        catalog.or(guessed)
    }
}

/// Runs the tuner for one variant. `profile` is the catalog entry for
/// the variant's (model, accelerator); `status` is its prior
/// `TunerStatus`, if any.
pub fn tune_variant(
    status: Option<&TunerStatus>,
    current: &CurrentAllocation,
    observed: &ObservedLoad,
    profile: Option<&AcceleratorProfile>,
    activate_model_tuner: bool,
    config: &TunerManagerConfig,
) -> Result<TuneOutcome, AutoscalerError> {
    let has_warm_start = status.map(|s| s.is_full()).unwrap_or(false);

    if !activate_model_tuner || !environment_valid(current, observed) {
        return fallback_outcome(status, observed, current.num_replicas, profile, config, has_warm_start);
    }

    if has_warm_start {
        let status = status.expect("has_warm_start implies status is Some");
        let x_init = status.params.as_vec4();
        let state = KalmanState { x: x_init, p: status.covariance };
        return run_filter(state, &x_init, observed, current, profile, config, ParamSource::WarmStart);
    }

    let Some((params, source)) =
        resolve_fallback_params(observed, current.num_replicas, profile, config.auto_guess_initial_state)
    else {
        return Err(AutoscalerError::VariantSkipped {
            variant: String::new(),
            reason: "no tuner status, no catalog profile, and insufficient metrics to guess".to_string(),
        });
    };

    let x_init = params.as_vec4();
    let state = KalmanState { x: x_init, p: default_covariance(&x_init) };
    run_filter(state, &x_init, observed, current, profile, config, source)
}

fn run_filter(
    state: KalmanState,
    x_init: &[f64; 4],
    observed: &ObservedLoad,
    current: &CurrentAllocation,
    profile: Option<&AcceleratorProfile>,
    config: &TunerManagerConfig,
    source: ParamSource,
) -> Result<TuneOutcome, AutoscalerError> {
    let ctx = ObservationContext {
        rate_per_sec: rate_per_replica_per_sec(current, observed),
        request_size: RequestSize {
            avg_input_tokens: observed.avg_input_tokens,
            avg_output_tokens: observed.avg_output_tokens,
        },
        max_batch_size: current.max_batch_size,
        max_queue_size: profile.map(|p| p.max_queue_size).unwrap_or(current.max_batch_size),
    };

    let predicted = kalman::predict(&state, &config.filter);
    let observation = [observed.ttft_avg_ms, observed.itl_avg_ms];
    let outcome = kalman::update(&predicted, observation, &ctx, x_init, &config.filter);

    Ok(TuneOutcome {
        params: QueueingParams::from_vec4(outcome.state.x),
        covariance: outcome.state.p,
        last_nis: outcome.nis,
        validation_failed: outcome.validation_failed,
        source: if outcome.validation_failed { source } else { ParamSource::Tuned },
        preserve_existing_covariance: false,
    })
}

fn fallback_outcome(
    status: Option<&TunerStatus>,
    observed: &ObservedLoad,
    num_replicas: u32,
    profile: Option<&AcceleratorProfile>,
    config: &TunerManagerConfig,
    had_valid_covariance: bool,
) -> Result<TuneOutcome, AutoscalerError> {
    let Some((params, source)) =
        resolve_fallback_params(observed, num_replicas, profile, config.auto_guess_initial_state)
    else {
        return Err(AutoscalerError::VariantSkipped {
            variant: String::new(),
            reason: "no tuner status, no catalog profile, and insufficient metrics to guess".to_string(),
        });
    };
    let covariance = status.map(|s| s.covariance).unwrap_or_else(|| default_covariance(&params.as_vec4()));
    Ok(TuneOutcome {
        params,
        covariance,
        last_nis: status.and_then(|s| s.last_nis),
        validation_failed: false,
        source,
        preserve_existing_covariance: had_valid_covariance,
    })
}
