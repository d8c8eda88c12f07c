//! The stringly-typed wire format for `TunerStatus`, exchanged with
//! the external variant-status record.
//!
//! Stringly-typed serialization is an unfortunate persistence choice
//! preserved for back-compat at the external boundary. Internally,
//! parse into typed state vectors at ingress and emit only at egress.
//! This module is that boundary; nothing outside it should touch the
//! string form.

use crate::model::{QueueingParams, TunerStatus};
use crate::AutoscalerError;

/// Decimal precision mandated for every persisted field.
const PERSIST_PRECISION: usize = 6;

/// The wire shape of a persisted tuner status: every numeric field is
/// a decimal string, as the external status record requires.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PersistedTunerStatus {
    pub model: String,
    pub accelerator: String,
    pub alpha: String,
    pub beta: String,
    pub gamma: String,
    pub delta: String,
    /// Empty string if NIS has not yet been computed.
    pub nis: String,
    /// Row-major 4x4, each entry a decimal string.
    pub covariance: [[String; 4]; 4],
    pub updated_at: u64,
}

fn fmt6(v: f64) -> String {
    format!("{:.*}", PERSIST_PRECISION, v)
}

fn parse6(s: &str, field: &str) -> Result<f64, AutoscalerError> {
    s.trim()
        .parse::<f64>()
        .map_err(|e| AutoscalerError::InvalidTunerStatus(format!("field {field}: {e}")))
}

/// Emit a [`TunerStatus`] as its wire form. Always succeeds: emission
/// never fails in this design — the invariants are parse-time-only.
pub fn emit_tuner_status(status: &TunerStatus) -> PersistedTunerStatus {
    let mut covariance: [[String; 4]; 4] = Default::default();
    for i in 0..4 {
        for j in 0..4 {
            covariance[i][j] = fmt6(status.covariance[i][j]);
        }
    }
    PersistedTunerStatus {
        model: status.model_id.clone(),
        accelerator: status.accelerator.clone(),
        alpha: fmt6(status.params.alpha),
        beta: fmt6(status.params.beta),
        gamma: fmt6(status.params.gamma),
        delta: fmt6(status.params.delta),
        nis: status.last_nis.map(fmt6).unwrap_or_default(),
        covariance,
        updated_at: status.updated_at,
    }
}

/// Parse a persisted wire record back into typed state. Rejects
/// non-parseable fields and non-symmetric covariance — non-square and
/// non-4x4 shapes can't occur given the `[[String; 4]; 4]` wire type,
/// so only parseability and symmetry are checked here.
pub fn parse_tuner_status(raw: &PersistedTunerStatus) -> Result<TunerStatus, AutoscalerError> {
    let params = QueueingParams {
        alpha: parse6(&raw.alpha, "alpha")?,
        beta: parse6(&raw.beta, "beta")?,
        gamma: parse6(&raw.gamma, "gamma")?,
        delta: parse6(&raw.delta, "delta")?,
    };

    let mut covariance = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            covariance[i][j] = parse6(&raw.covariance[i][j], "covariance")?;
        }
    }
    if !crate::model::is_symmetric(&covariance, 1e-6) {
        return Err(AutoscalerError::InvalidTunerStatus(
            "covariance is not symmetric within tolerance".to_string(),
        ));
    }

    let last_nis = if raw.nis.trim().is_empty() {
        None
    } else {
        Some(parse6(&raw.nis, "nis")?)
    };

    Ok(TunerStatus {
        params,
        covariance,
        last_nis,
        model_id: raw.model.clone(),
        accelerator: raw.accelerator.clone(),
        updated_at: raw.updated_at,
    })
}
