use autoscaler_core::model::{
    ModelCatalogEntry, ReplicaMetrics, SloTargets, SystemSnapshot, Variant,
};
use autoscaler_core::ports::{AcceleratorCostCatalogSource, ServiceClassCatalogSource};
use autoscaler_core::saturation::SaturationConfig;
use autoscaler_core::tick::{self, TickConfig, TickOutcome, TelemetryByVariant};
use autoscaler_core::tuner::{FilterConfig, TunerManagerConfig};
use autoscaler_core::model::ScaleAction;
use clap::{Parser, Subcommand, ValueEnum};
use miette::{Context, IntoDiagnostic, Result};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Response, Server};

mod ports_file;
use ports_file::{FileAcceleratorCostCatalogSource, FileServiceClassCatalogSource};

#[derive(Parser)]
#[command(name = "autoscaler", version, about = "Inference autoscaler decision core CLI")]
struct Cli {
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long)]
    metrics_addr: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single control tick against file-backed inputs and print
    /// the resulting decisions.
    Tick {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        telemetry: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        auto_guess_initial_state: bool,
    },
    /// Run the periodic tick loop against file-backed inputs, re-reading
    /// them from disk every interval.
    Serve {
        #[arg(long)]
        snapshot: PathBuf,
        #[arg(long)]
        telemetry: Option<PathBuf>,
        #[arg(long, default_value_t = 30)]
        interval: u64,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        auto_guess_initial_state: bool,
    },
    /// Load and validate the service-class and accelerator-cost
    /// catalogs, printing "OK" or the first validation error.
    Validate {
        #[arg(long)]
        service_classes: PathBuf,
        #[arg(long)]
        accelerator_costs: PathBuf,
    },
}

/// File-backed wire shape for a [`SystemSnapshot`]: the `service_classes`
/// map is tuple-keyed internally, which has no direct JSON encoding, so
/// the file format spells it out as a list of entries instead.
#[derive(Debug, Deserialize, Serialize)]
struct SnapshotFile {
    #[serde(default)]
    models: HashMap<String, ModelCatalogEntry>,
    #[serde(default)]
    service_classes: Vec<ServiceClassSloEntry>,
    #[serde(default)]
    variants: Vec<Variant>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ServiceClassSloEntry {
    model_id: String,
    service_class: String,
    slo_ttft_ms: f64,
    slo_itl_ms: f64,
}

impl From<SnapshotFile> for SystemSnapshot {
    fn from(file: SnapshotFile) -> Self {
        let mut service_classes = HashMap::new();
        for entry in file.service_classes {
            service_classes.insert(
                (entry.model_id, entry.service_class),
                SloTargets { slo_ttft_ms: entry.slo_ttft_ms, slo_itl_ms: entry.slo_itl_ms },
            );
        }
        SystemSnapshot { models: file.models, service_classes, variants: file.variants }
    }
}

/// File-backed wire shape for per-variant telemetry: the same
/// tuple-key-as-list treatment as [`SnapshotFile::service_classes`].
#[derive(Debug, Deserialize, Serialize, Default)]
struct TelemetryFile(Vec<TelemetryEntry>);

#[derive(Debug, Deserialize, Serialize)]
struct TelemetryEntry {
    variant: String,
    namespace: String,
    replicas: Vec<ReplicaMetrics>,
}

impl From<TelemetryFile> for TelemetryByVariant {
    fn from(file: TelemetryFile) -> Self {
        file.0
            .into_iter()
            .map(|entry| ((entry.variant, entry.namespace), entry.replicas))
            .collect()
    }
}

struct Metrics {
    registry: Registry,
    ticks_total: IntCounter,
    variants_considered_total: IntCounter,
    variants_skipped_total: IntCounter,
    nis_rejections_total: IntCounter,
    scale_up_total: IntCounter,
    scale_down_total: IntCounter,
    no_change_total: IntCounter,
    safety_veto_total: IntCounter,
}

impl Metrics {
    fn init(addr: Option<&str>) -> Result<Arc<Self>> {
        let registry = Registry::new();
        let ticks_total =
            IntCounter::new("autoscaler_ticks_total", "Control ticks run").into_diagnostic()?;
        let variants_considered_total = IntCounter::new(
            "autoscaler_variants_considered_total",
            "Variants seen across all ticks",
        )
        .into_diagnostic()?;
        let variants_skipped_total = IntCounter::new(
            "autoscaler_variants_skipped_total",
            "Variants skipped due to a variant-scoped permanent error",
        )
        .into_diagnostic()?;
        let nis_rejections_total = IntCounter::new(
            "autoscaler_nis_rejections_total",
            "Kalman observations rejected by the NIS outlier test",
        )
        .into_diagnostic()?;
        let scale_up_total =
            IntCounter::new("autoscaler_scale_up_total", "Decisions arbitrated to scale up")
                .into_diagnostic()?;
        let scale_down_total = IntCounter::new(
            "autoscaler_scale_down_total",
            "Decisions arbitrated to scale down",
        )
        .into_diagnostic()?;
        let no_change_total =
            IntCounter::new("autoscaler_no_change_total", "Decisions arbitrated to no change")
                .into_diagnostic()?;
        let safety_veto_total = IntCounter::new(
            "autoscaler_safety_veto_total",
            "Decisions overridden by a saturation veto or scale-down safety block",
        )
        .into_diagnostic()?;

        for metric in [
            &ticks_total,
            &variants_considered_total,
            &variants_skipped_total,
            &nis_rejections_total,
            &scale_up_total,
            &scale_down_total,
            &no_change_total,
            &safety_veto_total,
        ] {
            registry.register(Box::new(metric.clone())).into_diagnostic()?;
        }

        let metrics = Arc::new(Self {
            registry,
            ticks_total,
            variants_considered_total,
            variants_skipped_total,
            nis_rejections_total,
            scale_up_total,
            scale_down_total,
            no_change_total,
            safety_veto_total,
        });

        if let Some(addr) = addr {
            let registry = metrics.registry.clone();
            let addr = addr.to_string();
            thread::spawn(move || start_metrics_server(&addr, &registry));
        }

        Ok(metrics)
    }

    fn record_tick(&self, outcome: &TickOutcome) {
        self.ticks_total.inc();
        self.variants_considered_total.inc_by(outcome.variants_considered as u64);
        self.variants_skipped_total.inc_by(outcome.variants_skipped as u64);
        self.nis_rejections_total.inc_by(outcome.nis_rejections as u64);
        for decision in &outcome.decisions {
            match decision.action {
                ScaleAction::ScaleUp => self.scale_up_total.inc(),
                ScaleAction::ScaleDown => self.scale_down_total.inc(),
                ScaleAction::NoChange => self.no_change_total.inc(),
            }
            if decision.flags.safety_override {
                self.safety_veto_total.inc();
            }
        }
    }
}

fn start_metrics_server(addr: &str, registry: &Registry) {
    let server = match Server::http(addr) {
        Ok(server) => server,
        Err(_) => return,
    };
    for request in server.incoming_requests() {
        let encoder = TextEncoder::new();
        let metric_families = registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_ok() {
            let response = Response::from_data(buffer);
            let _ = request.respond(response);
        }
    }
}

fn init_tracing(log_format: LogFormat, log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .into_diagnostic()?;
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    match log_format {
        LogFormat::Json => fmt.json().init(),
        LogFormat::Pretty => fmt.init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_level)?;
    let metrics = Metrics::init(cli.metrics_addr.as_deref())?;

    match cli.command {
        Commands::Tick { snapshot, telemetry, out, auto_guess_initial_state } => {
            tick_command(&snapshot, telemetry.as_deref(), out.as_ref(), auto_guess_initial_state, &metrics)
        }
        Commands::Serve { snapshot, telemetry, interval, out, auto_guess_initial_state } => serve_command(
            &snapshot,
            telemetry.as_deref(),
            interval,
            out.as_ref(),
            auto_guess_initial_state,
            &metrics,
        ),
        Commands::Validate { service_classes, accelerator_costs } => {
            validate_command(&service_classes, &accelerator_costs)
        }
    }
}

fn default_tick_config(auto_guess_initial_state: bool) -> Result<TickConfig> {
    Ok(TickConfig {
        tuner: TunerManagerConfig { auto_guess_initial_state, filter: FilterConfig::default() },
        saturation: SaturationConfig::new(0.80, 5.0, 0.10, 3.0).into_diagnostic()?,
        parallelism: 1,
    })
}

fn tick_command(
    snapshot_path: &Path,
    telemetry_path: Option<&Path>,
    out: Option<&PathBuf>,
    auto_guess_initial_state: bool,
    metrics: &Metrics,
) -> Result<()> {
    tracing::info!(command = "tick", snapshot = %snapshot_path.display());
    let mut snapshot = load_snapshot(snapshot_path)?;
    let telemetry = load_telemetry(telemetry_path)?;
    let config = default_tick_config(auto_guess_initial_state)?;

    let outcome = tick::run_tick(&mut snapshot, &telemetry, &config);
    metrics.record_tick(&outcome);
    write_output(out, &outcome.decisions)
}

fn serve_command(
    snapshot_path: &Path,
    telemetry_path: Option<&Path>,
    interval: u64,
    out: Option<&PathBuf>,
    auto_guess_initial_state: bool,
    metrics: &Metrics,
) -> Result<()> {
    tracing::info!(command = "serve", interval, snapshot = %snapshot_path.display());
    let config = default_tick_config(auto_guess_initial_state)?;
    loop {
        let mut snapshot = load_snapshot(snapshot_path)?;
        let telemetry = load_telemetry(telemetry_path)?;
        let outcome = tick::run_tick(&mut snapshot, &telemetry, &config);
        metrics.record_tick(&outcome);
        write_output(out, &outcome.decisions)?;
        thread::sleep(Duration::from_secs(interval));
    }
}

fn validate_command(service_classes_path: &Path, accelerator_costs_path: &Path) -> Result<()> {
    tracing::info!(command = "validate", service_classes = %service_classes_path.display());

    let service_classes = FileServiceClassCatalogSource { path: service_classes_path.to_path_buf() };
    service_classes
        .load()
        .map_err(|e| miette::miette!("{e}"))
        .with_context(|| "service class catalog failed validation".to_string())?;

    let accelerator_costs = FileAcceleratorCostCatalogSource { path: accelerator_costs_path.to_path_buf() };
    accelerator_costs
        .load()
        .map_err(|e| miette::miette!("{e}"))
        .with_context(|| "accelerator cost catalog failed validation".to_string())?;

    println!("OK");
    Ok(())
}

fn load_snapshot(path: &Path) -> Result<SystemSnapshot> {
    let contents = fs::read_to_string(path)
        .into_diagnostic()
        .with_context(|| format!("Failed to read snapshot file {}", path.display()))?;
    let file: SnapshotFile = serde_json::from_str(&contents)
        .into_diagnostic()
        .with_context(|| format!("Invalid snapshot JSON in {}", path.display()))?;
    Ok(file.into())
}

fn load_telemetry(path: Option<&Path>) -> Result<TelemetryByVariant> {
    let Some(path) = path else {
        return Ok(TelemetryByVariant::new());
    };
    let contents = fs::read_to_string(path)
        .into_diagnostic()
        .with_context(|| format!("Failed to read telemetry file {}", path.display()))?;
    let file: TelemetryFile = serde_json::from_str(&contents)
        .into_diagnostic()
        .with_context(|| format!("Invalid telemetry JSON in {}", path.display()))?;
    Ok(file.into())
}

fn write_output<T: Serialize>(path: Option<&PathBuf>, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value).into_diagnostic()?;
    if let Some(path) = path {
        fs::write(path, data)
            .into_diagnostic()
            .with_context(|| format!("Failed to write output file {}", path.display()))?;
    } else {
        println!("{}", data);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_core::model::{CurrentAllocation, DesiredAllocation, ObservedLoad, QueueingParams};
    use tempfile::NamedTempFile;

    fn sample_variant() -> Variant {
        Variant {
            name: "v1".to_string(),
            namespace: "ns".to_string(),
            model_id: "llama-8b".to_string(),
            accelerator: "h100".to_string(),
            service_class: "gold".to_string(),
            activate_model_tuner: false,
            min_num_replicas: 1,
            current: CurrentAllocation { num_replicas: 2, ready_replicas: 2, max_batch_size: 8 },
            observed: ObservedLoad {
                rpm_total: 300.0,
                avg_input_tokens: 200.0,
                avg_output_tokens: 100.0,
                ttft_avg_ms: 190.0,
                itl_avg_ms: 22.0,
            },
            desired: DesiredAllocation::default(),
            tuner_status: None,
            cost: 10.0,
        }
    }

    fn sample_snapshot_file() -> SnapshotFile {
        let mut models = HashMap::new();
        models.insert(
            "llama-8b".to_string(),
            ModelCatalogEntry {
                model_id: "llama-8b".to_string(),
                profiles: {
                    let mut m = HashMap::new();
                    m.insert(
                        "h100".to_string(),
                        autoscaler_core::model::AcceleratorProfile {
                            accelerator: "h100".to_string(),
                            params: QueueingParams { alpha: 20.0, beta: 2.0, gamma: 50.0, delta: 0.05 },
                            max_batch_size: 8,
                            max_queue_size: 16,
                        },
                    );
                    m
                },
            },
        );
        SnapshotFile {
            models,
            service_classes: vec![ServiceClassSloEntry {
                model_id: "llama-8b".to_string(),
                service_class: "gold".to_string(),
                slo_ttft_ms: 300.0,
                slo_itl_ms: 40.0,
            }],
            variants: vec![sample_variant()],
        }
    }

    #[test]
    fn snapshot_file_round_trips_tuple_keyed_service_classes() {
        let file = sample_snapshot_file();
        let json = serde_json::to_string(&file).expect("serializable");
        let parsed: SnapshotFile = serde_json::from_str(&json).expect("deserializable");
        let snapshot: SystemSnapshot = parsed.into();
        assert_eq!(
            snapshot.slo_for("llama-8b", "gold"),
            Some(SloTargets { slo_ttft_ms: 300.0, slo_itl_ms: 40.0 })
        );
    }

    #[test]
    fn tick_command_reads_snapshot_and_writes_decisions() {
        let snapshot_file = NamedTempFile::new().expect("tempfile");
        let json = serde_json::to_string(&sample_snapshot_file()).unwrap();
        fs::write(snapshot_file.path(), json).unwrap();

        let out_file = NamedTempFile::new().expect("tempfile");
        let metrics = Metrics::init(None).expect("metrics init");

        let result = tick_command(
            snapshot_file.path(),
            None,
            Some(&out_file.path().to_path_buf()),
            false,
            &metrics,
        );
        assert!(result.is_ok());

        let output = fs::read_to_string(out_file.path()).unwrap();
        let decisions: Vec<autoscaler_core::model::Decision> = serde_json::from_str(&output).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].variant, "v1");
    }

    #[test]
    fn validate_command_accepts_well_formed_catalogs() {
        let classes = NamedTempFile::new().expect("tempfile");
        fs::write(
            classes.path(),
            "classes:\n  - name: gold\n    priority: 1\n    targets:\n      - model: llama-8b\n        slo-ttft: 200.0\n        slo-itl: 20.0\n",
        )
        .unwrap();
        let costs = NamedTempFile::new().expect("tempfile");
        fs::write(costs.path(), r#"{"h100": {"device": "h100", "cost": "4.50"}}"#).unwrap();

        let result = validate_command(classes.path(), costs.path());
        assert!(result.is_ok());
    }

    #[test]
    fn validate_command_rejects_malformed_catalog() {
        let classes = NamedTempFile::new().expect("tempfile");
        fs::write(
            classes.path(),
            "classes:\n  - name: gold\n    priority: 1\n    targets:\n      - model: llama-8b\n        slo-ttft: 0.0\n        slo-itl: 20.0\n",
        )
        .unwrap();
        let costs = NamedTempFile::new().expect("tempfile");
        fs::write(costs.path(), r#"{"h100": {"device": "h100", "cost": "4.50"}}"#).unwrap();

        let result = validate_command(classes.path(), costs.path());
        assert!(result.is_err());
    }
}
