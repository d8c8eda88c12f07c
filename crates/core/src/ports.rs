//! External collaborators, named as traits.
//!
//! The core never speaks HTTP, TLS, or Kubernetes directly — it asks
//! these ports for data and hands decisions back through them. The CLI
//! binary owns the concrete implementations (Prometheus client,
//! custom-resource client, etc.); tests use in-memory fakes.

use crate::model::{Decision, ReplicaMetrics, Variant};
use crate::AutoscalerError;

/// Per-replica telemetry, scraped from the metrics backend.
pub trait TelemetrySource {
    fn replica_metrics(&self, variant_key: &(String, String)) -> Result<Vec<ReplicaMetrics>, AutoscalerError>;
}

/// Read/write access to variant custom-resource records.
pub trait VariantStore {
    fn list_active_variants(&self) -> Result<Vec<Variant>, AutoscalerError>;

    /// Applies a desired-allocation update. Implementations retry
    /// optimistic-lock conflicts internally before surfacing a
    /// [`AutoscalerError::Transient`].
    fn write_desired_allocation(
        &self,
        variant_key: &(String, String),
        num_replicas: u32,
    ) -> Result<(), AutoscalerError>;

    fn write_tuner_status(
        &self,
        variant_key: &(String, String),
        status: &crate::persist::PersistedTunerStatus,
    ) -> Result<(), AutoscalerError>;
}

/// Source of the service-class SLO catalog.
pub trait ServiceClassCatalogSource {
    fn load(&self) -> Result<crate::config::ServiceClassCatalog, AutoscalerError>;
}

/// Source of the accelerator cost catalog.
pub trait AcceleratorCostCatalogSource {
    fn load(&self) -> Result<crate::config::AcceleratorCostCatalog, AutoscalerError>;
}

/// Where finished [`Decision`]s go — the reconciler that actually
/// patches replica counts.
pub trait DecisionSink {
    fn emit(&self, decisions: &[Decision]) -> Result<(), AutoscalerError>;
}
