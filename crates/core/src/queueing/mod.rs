//! The queueing model and its prefill/decode-aware analyzer.

pub mod analyzer;
pub mod model;

pub use analyzer::{AnalysisMetrics, QueueAnalyzer, QueueingError, RequestSize, SizeResult, SizeTargets};
pub use model::QueueingModel;

/// Shared slack fraction: stable operating range is `(0, rho_max)`
/// with `rho_max = 1 - EPSILON`, and rate bounds are padded by the
/// same fraction at both ends.
pub const EPSILON: f64 = 0.001;
