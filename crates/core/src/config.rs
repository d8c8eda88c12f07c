//! The two catalogs loaded from external configuration —
//! service-class SLO targets (YAML) and accelerator cost (JSON).
//! Loading and validating these is in scope for the core; fetching the
//! bytes (file, ConfigMap, etc.) is the binary's job.

use crate::model::SloTargets;
use crate::AutoscalerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceClassModelTarget {
    pub model: String,
    #[serde(rename = "slo-ttft")]
    pub slo_ttft_ms: f64,
    #[serde(rename = "slo-itl")]
    pub slo_itl_ms: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceClassEntry {
    pub name: String,
    pub priority: i32,
    #[serde(default)]
    pub targets: Vec<ServiceClassModelTarget>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceClassCatalog {
    #[serde(default)]
    pub classes: Vec<ServiceClassEntry>,
}

impl ServiceClassCatalog {
    /// Parses and validates a YAML document. Every (model, class) SLO
    /// pair must have both targets strictly positive.
    pub fn from_yaml(raw: &str) -> Result<Self, AutoscalerError> {
        let catalog: ServiceClassCatalog = serde_yaml::from_str(raw)
            .map_err(|e| AutoscalerError::ConfigMalformed(format!("service class catalog: {e}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), AutoscalerError> {
        for class in &self.classes {
            for target in &class.targets {
                if target.slo_ttft_ms <= 0.0 || target.slo_itl_ms <= 0.0 {
                    return Err(AutoscalerError::ConfigMalformed(format!(
                        "service class {} model {}: SLO targets must be > 0 (got ttft={}, itl={})",
                        class.name, target.model, target.slo_ttft_ms, target.slo_itl_ms
                    )));
                }
            }
        }
        Ok(())
    }

    /// Flattens into the `(model_id, class_name) -> SloTargets` map
    /// that [`crate::model::SystemSnapshot`] indexes by.
    pub fn into_slo_map(self) -> HashMap<(String, String), SloTargets> {
        let mut map = HashMap::new();
        for class in self.classes {
            for target in class.targets {
                map.insert(
                    (target.model.clone(), class.name.clone()),
                    SloTargets {
                        slo_ttft_ms: target.slo_ttft_ms,
                        slo_itl_ms: target.slo_itl_ms,
                    },
                );
            }
        }
        map
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcceleratorCostEntry {
    pub device: String,
    /// Cost is wire-encoded as a string, parsed here.
    pub cost: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AcceleratorCostCatalog {
    #[serde(flatten)]
    pub entries: HashMap<String, AcceleratorCostEntry>,
}

impl AcceleratorCostCatalog {
    pub fn from_json(raw: &str) -> Result<Self, AutoscalerError> {
        let catalog: AcceleratorCostCatalog = serde_json::from_str(raw)
            .map_err(|e| AutoscalerError::ConfigMalformed(format!("accelerator cost catalog: {e}")))?;
        Ok(catalog)
    }

    /// Cost per replica-hour for the named accelerator, or `None` if
    /// absent or unparseable as `f32`.
    pub fn cost_for(&self, accelerator: &str) -> Option<f32> {
        self.entries.get(accelerator)?.cost.trim().parse::<f32>().ok()
    }
}
