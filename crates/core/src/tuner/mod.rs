//! The per-variant Kalman tuner and the manager that owns one per
//! active variant, resolving initial state and falling back
//! gracefully when tuning can't proceed.

pub mod kalman;
pub mod manager;

pub use kalman::{FilterConfig, KalmanState, ObservationContext, UpdateOutcome, NIS_THRESHOLD};
pub use manager::{TuneOutcome, TunerManagerConfig};
