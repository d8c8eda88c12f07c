//! Simple file-backed implementations of the core's port traits, for
//! `tick`/`serve` offline use. These are not production adapters —
//! no HTTP, no CRD watch, no retry/backoff — just enough to drive the
//! decision core against files on disk.

use autoscaler_core::config::{AcceleratorCostCatalog, ServiceClassCatalog};
use autoscaler_core::model::{Decision, ReplicaMetrics, TunerStatus, Variant};
use autoscaler_core::persist::{self, PersistedTunerStatus};
use autoscaler_core::ports::{
    AcceleratorCostCatalogSource, DecisionSink, ServiceClassCatalogSource, TelemetrySource, VariantStore,
};
use autoscaler_core::AutoscalerError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

fn read_err(path: &PathBuf, e: std::io::Error) -> AutoscalerError {
    AutoscalerError::Transient(format!("reading {}: {e}", path.display()))
}

fn write_err(path: &PathBuf, e: std::io::Error) -> AutoscalerError {
    AutoscalerError::Transient(format!("writing {}: {e}", path.display()))
}

/// A flat JSON array of [`Variant`] records, re-read on every call —
/// no in-process caching, so `serve`'s loop always sees the latest
/// file contents.
pub struct FileVariantStore {
    pub path: PathBuf,
}

impl FileVariantStore {
    fn read_all(&self) -> Result<Vec<Variant>, AutoscalerError> {
        let contents = fs::read_to_string(&self.path).map_err(|e| read_err(&self.path, e))?;
        serde_json::from_str(&contents)
            .map_err(|e| AutoscalerError::ConfigMalformed(format!("variant store {}: {e}", self.path.display())))
    }

    fn write_all(&self, variants: &[Variant]) -> Result<(), AutoscalerError> {
        let data = serde_json::to_string_pretty(variants)
            .map_err(|e| AutoscalerError::ConfigMalformed(e.to_string()))?;
        fs::write(&self.path, data).map_err(|e| write_err(&self.path, e))
    }
}

impl VariantStore for FileVariantStore {
    fn list_active_variants(&self) -> Result<Vec<Variant>, AutoscalerError> {
        self.read_all()
    }

    fn write_desired_allocation(&self, variant_key: &(String, String), num_replicas: u32) -> Result<(), AutoscalerError> {
        let mut variants = self.read_all()?;
        if let Some(variant) = variants.iter_mut().find(|v| &v.key() == variant_key) {
            variant.desired.num_replicas = num_replicas;
        }
        self.write_all(&variants)
    }

    fn write_tuner_status(&self, variant_key: &(String, String), status: &PersistedTunerStatus) -> Result<(), AutoscalerError> {
        let parsed: TunerStatus = persist::parse_tuner_status(status)?;
        let mut variants = self.read_all()?;
        if let Some(variant) = variants.iter_mut().find(|v| &v.key() == variant_key) {
            variant.tuner_status = Some(parsed);
        }
        self.write_all(&variants)
    }
}

/// Per-variant telemetry, keyed the same way as [`crate::TelemetryFile`].
#[derive(Debug, Deserialize, Serialize, Default)]
struct TelemetryRecords(Vec<TelemetryRecord>);

#[derive(Debug, Deserialize, Serialize)]
struct TelemetryRecord {
    variant: String,
    namespace: String,
    replicas: Vec<ReplicaMetrics>,
}

pub struct FileTelemetrySource {
    pub path: PathBuf,
}

impl TelemetrySource for FileTelemetrySource {
    fn replica_metrics(&self, variant_key: &(String, String)) -> Result<Vec<ReplicaMetrics>, AutoscalerError> {
        let contents = fs::read_to_string(&self.path).map_err(|e| read_err(&self.path, e))?;
        let records: TelemetryRecords = serde_json::from_str(&contents)
            .map_err(|e| AutoscalerError::ConfigMalformed(format!("telemetry file {}: {e}", self.path.display())))?;
        Ok(records
            .0
            .into_iter()
            .find(|r| &(r.variant.clone(), r.namespace.clone()) == variant_key)
            .map(|r| r.replicas)
            .unwrap_or_default())
    }
}

pub struct FileServiceClassCatalogSource {
    pub path: PathBuf,
}

impl ServiceClassCatalogSource for FileServiceClassCatalogSource {
    fn load(&self) -> Result<ServiceClassCatalog, AutoscalerError> {
        let raw = fs::read_to_string(&self.path).map_err(|e| read_err(&self.path, e))?;
        ServiceClassCatalog::from_yaml(&raw)
    }
}

pub struct FileAcceleratorCostCatalogSource {
    pub path: PathBuf,
}

impl AcceleratorCostCatalogSource for FileAcceleratorCostCatalogSource {
    fn load(&self) -> Result<AcceleratorCostCatalog, AutoscalerError> {
        let raw = fs::read_to_string(&self.path).map_err(|e| read_err(&self.path, e))?;
        AcceleratorCostCatalog::from_json(&raw)
    }
}

/// Writes decisions as pretty JSON to a file, or to stdout when no
/// path is configured.
pub struct FileDecisionSink {
    pub path: Option<PathBuf>,
}

impl DecisionSink for FileDecisionSink {
    fn emit(&self, decisions: &[Decision]) -> Result<(), AutoscalerError> {
        let data = serde_json::to_string_pretty(decisions)
            .map_err(|e| AutoscalerError::ConfigMalformed(e.to_string()))?;
        match &self.path {
            Some(path) => fs::write(path, data).map_err(|e| write_err(path, e)),
            None => {
                println!("{data}");
                Ok(())
            }
        }
    }
}
