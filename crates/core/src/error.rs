//! Error taxonomy for the decision core.
//!
//! Only two of the five classes in the design are represented as
//! `Err`: variant-scoped-permanent and tick-scoped-permanent
//! conditions. Transient and local-fail-open conditions are not
//! errors here — the caller must keep making progress on other
//! variants, so those are ordinary return values (fallback
//! parameters, `validationFailed: true`, a scale-up-by-one signal).
//! Fatal conditions (logger init, binary misconfiguration) belong to
//! the CLI binary, not this library.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AutoscalerError {
    /// A single variant cannot be scored this tick and must be
    /// skipped; other variants proceed unaffected.
    #[error("variant {variant} skipped: {reason}")]
    VariantSkipped { variant: String, reason: String },

    /// Service-class or accelerator-cost catalog failed to parse or
    /// validate. Tick-scoped: the whole tick is abandoned, the next
    /// tick retries against (presumably corrected) configuration.
    #[error("configuration malformed: {0}")]
    ConfigMalformed(String),

    /// A persisted `TunerStatus` covariance or parameter vector
    /// failed validation (non-square, non-4x4, unparseable, or
    /// non-symmetric beyond tolerance). Callers must treat this as
    /// "no warm start available", not propagate it.
    #[error("invalid tuner status: {0}")]
    InvalidTunerStatus(String),

    /// A telemetry or control-plane write failed in a way the caller
    /// should retry with backoff (see the tick's retry policy).
    #[error("transient failure: {0}")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, AutoscalerError>;
