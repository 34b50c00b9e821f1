//! `autocapd` CLI/daemon: boot, shutdown, doctor, archive verification,
//! query, state layer eval, perf gate, and key rotation, with a local
//! Prometheus metrics and health endpoint.
//!
//! Exit codes: 0 ok, 1 gate/eval failure, 2 configuration or contract
//! error.

use autocap_kernel::{ConfigError, Kernel, KernelOptions};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use prometheus::Encoder;
use serde::Serialize;
use serde_json::{json, Value};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(author, version, about = "Local-first capture and query engine", long_about = None)]
struct Cli {
    /// Increase output verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Override log level (e.g. info, debug, trace).
    #[arg(long, env = "AUTOCAPTURE_LOG_LEVEL")]
    log_level: Option<String>,
    /// Bind address for /metrics, /healthz, and /readyz ("off" disables).
    #[arg(long, env = "AUTOCAPTURE_STATUS_ADDR", default_value = "127.0.0.1:9187")]
    status_addr: String,
    /// Boot in safe mode (also via AUTOCAPTURE_SAFE_MODE).
    #[arg(long)]
    safe_mode: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Boot the engine and run until interrupted.
    Boot {
        /// Run a single conductor tick and exit (for scripting).
        #[arg(long)]
        once: bool,
    },
    /// Reconcile storage and mark the run state stopped.
    Shutdown,
    /// Run the doctor checks.
    Doctor,
    /// Verify an exported archive.
    VerifyArchive {
        /// Archive path.
        #[arg(long)]
        path: std::path::PathBuf,
    },
    /// Answer a query with citations.
    Query {
        /// Query text.
        text: String,
    },
    /// Drain idle processing under governor budgets.
    Drain {
        /// Run even while the governor reports an active user.
        #[arg(long)]
        no_require_idle: bool,
        /// Loop ceiling.
        #[arg(long, default_value = "500")]
        max_loops: u32,
    },
    /// Validate derived-state records against their payload hashes.
    StateLayerEval,
    /// Check capture encode latency against the performance budget.
    PerfGate,
    /// Rotate a vault purpose key.
    RotateKeys {
        /// Key purpose, e.g. `entity_tokens` or `blob_store`.
        #[arg(long, default_value = "entity_tokens")]
        purpose: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            if err.downcast_ref::<ConfigError>().is_some() {
                eprintln!("configuration error: {err}");
                ExitCode::from(2)
            } else {
                eprintln!("error: {err}");
                ExitCode::from(1)
            }
        }
    }
}

fn init_tracing(cli: &Cli) {
    let level = cli
        .log_level
        .as_deref()
        .map(|raw| match raw.to_ascii_uppercase().as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            _ => Level::INFO,
        })
        .unwrap_or(match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        });
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(env_filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let options = KernelOptions {
        safe_mode: cli.safe_mode,
        start_conductor: false,
        paths: None,
    };
    match cli.command {
        Commands::Boot { once } => boot(options, &cli.status_addr, once),
        Commands::Shutdown => {
            let kernel = Kernel::boot(options)?;
            kernel.shutdown()?;
            println!("stopped");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Doctor => {
            let kernel = Kernel::boot(options)?;
            let checks = kernel.doctor();
            let mut failed = 0;
            for check in &checks {
                println!(
                    "{} {} {}",
                    if check.ok { "ok " } else { "FAIL" },
                    check.name,
                    check.detail
                );
                if !check.ok {
                    failed += 1;
                }
            }
            kernel.shutdown()?;
            Ok(if failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Commands::VerifyArchive { path } => {
            let issues = autocap_store::archive::verify_archive(&path)?;
            if issues.is_empty() {
                println!("archive ok");
                Ok(ExitCode::SUCCESS)
            } else {
                for issue in &issues {
                    eprintln!("{issue}");
                }
                Ok(ExitCode::from(1))
            }
        }
        Commands::Query { text } => {
            let kernel = Kernel::boot(options)?;
            let (answer, trace) = kernel.query(&text)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "answer": answer,
                    "trace": trace,
                }))?
            );
            kernel.shutdown()?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Drain {
            no_require_idle,
            max_loops,
        } => {
            let kernel = Kernel::boot(options)?;
            let outcome = kernel.run_batch(!no_require_idle, max_loops);
            println!("{}", serde_json::to_string_pretty(&outcome.manifest)?);
            let done = outcome.done;
            kernel.shutdown()?;
            Ok(if done { ExitCode::SUCCESS } else { ExitCode::from(1) })
        }
        Commands::StateLayerEval => {
            let kernel = Kernel::boot(options)?;
            let outcome = state_layer_eval(&kernel)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            let ok = outcome["invalid"].as_u64() == Some(0);
            kernel.shutdown()?;
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::from(1) })
        }
        Commands::PerfGate => {
            let kernel = Kernel::boot(options)?;
            let outcome = perf_gate(&kernel)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            let ok = outcome["ok"].as_bool().unwrap_or(false);
            kernel.shutdown()?;
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::from(1) })
        }
        Commands::RotateKeys { purpose } => {
            let kernel = Kernel::boot(options)?;
            let key_id = kernel.rotate_key(&purpose)?;
            println!("rotated {purpose} to generation {key_id}");
            kernel.shutdown()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn boot(options: KernelOptions, status_addr: &str, once: bool) -> anyhow::Result<ExitCode> {
    let kernel = Kernel::boot(options)?;
    let conductor = kernel
        .conductor()
        .ok_or_else(|| anyhow::anyhow!("conductor unavailable"))?;
    if once {
        let tick = conductor.run_once()?;
        println!("{}", serde_json::to_string_pretty(&tick)?);
        kernel.shutdown()?;
        return Ok(ExitCode::SUCCESS);
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let metrics = DaemonMetrics::new()?;
        let state = Arc::new(StatusState {
            metrics,
            telemetry: kernel.telemetry(),
            run_id: kernel.run_id().to_string(),
        });
        match status_addr {
            "off" | "disabled" => info!("status/metrics server disabled"),
            addr => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                info!("status/metrics server listening on {}", listener.local_addr()?);
                tokio::spawn(start_status_server(listener, Arc::clone(&state)));
            }
        }
        conductor.start();
        info!(run_id = %state.run_id, "autocapd running");
        tokio::signal::ctrl_c().await?;
        info!("interrupt received; shutting down");
        Ok::<(), anyhow::Error>(())
    })?;
    kernel.shutdown()?;
    Ok(ExitCode::SUCCESS)
}

/// Validate every metadata record that carries a `payload_hash`, plus
/// the pipeline DAG record for this run.
fn state_layer_eval(kernel: &Kernel) -> anyhow::Result<Value> {
    let metadata = kernel.metadata();
    let mut checked = 0u64;
    let mut invalid = Vec::new();
    for encoded in metadata.keys()? {
        let Some(record) = metadata.get_encoded(&encoded)? else {
            continue;
        };
        if record.get("payload_hash").is_none() {
            continue;
        }
        checked += 1;
        if !autocap_spec::records::payload_hash_valid(&record) {
            invalid.push(encoded);
        }
    }
    let dag_id = format!("{}/derived.pipeline_dag/v1", kernel.run_id());
    let dag_present = metadata.get(&dag_id)?.is_some();
    Ok(json!({
        "checked": checked,
        "invalid": invalid.len(),
        "invalid_samples": invalid.iter().take(5).collect::<Vec<_>>(),
        "pipeline_dag_present": dag_present,
    }))
}

/// Compare the p95 of per-segment worst-frame encode latency against the
/// configured budget.
fn perf_gate(kernel: &Kernel) -> anyhow::Result<Value> {
    let budget_ms = kernel
        .config()
        .pointer("/runtime/perf/cpu_budget_ms_p95")
        .and_then(Value::as_u64)
        .unwrap_or(200);
    let events =
        autocap_store::journal::read_events(&kernel.data_dir().join("journal.ndjson"))?;
    let mut samples: Vec<u64> = events
        .iter()
        .filter(|event| event.event_type == "capture.segment")
        .filter_map(|event| event.payload.get("encode_ms_max").and_then(Value::as_u64))
        .collect();
    if samples.is_empty() {
        return Ok(json!({
            "ok": true,
            "budget_ms": budget_ms,
            "samples": 0,
            "detail": "insufficient data",
        }));
    }
    samples.sort_unstable();
    let idx = ((0.95 * samples.len() as f64).ceil() as usize).saturating_sub(1);
    let p95 = samples[idx.min(samples.len() - 1)];
    Ok(json!({
        "ok": p95 <= budget_ms,
        "budget_ms": budget_ms,
        "p95_ms": p95,
        "samples": samples.len(),
    }))
}

struct DaemonMetrics {
    registry: prometheus::Registry,
    uptime_seconds: prometheus::IntGauge,
    started: std::time::Instant,
}

impl DaemonMetrics {
    fn new() -> anyhow::Result<Self> {
        let registry = prometheus::Registry::new();
        let uptime_seconds =
            prometheus::IntGauge::new("autocapd_uptime_seconds", "Daemon uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;
        Ok(DaemonMetrics {
            registry,
            uptime_seconds,
            started: std::time::Instant::now(),
        })
    }

    fn render(&self) -> anyhow::Result<String> {
        self.uptime_seconds
            .set(self.started.elapsed().as_secs() as i64);
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

struct StatusState {
    metrics: DaemonMetrics,
    telemetry: Arc<autocap_store::TelemetryStore>,
    run_id: String,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    run_id: String,
    runtime: Value,
}

async fn start_status_server(listener: tokio::net::TcpListener, state: Arc<StatusState>) {
    let app = Router::new()
        .route("/metrics", get(metrics_endpoint))
        .route("/healthz", get(health_endpoint))
        .route("/readyz", get(ready_endpoint))
        .with_state(state);
    if let Err(err) = axum::serve(listener, app.into_make_service()).await {
        tracing::warn!(error = %err, "status server terminated");
    }
}

async fn metrics_endpoint(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn health_endpoint(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    Json(HealthReport {
        status: "ok",
        run_id: state.run_id.clone(),
        runtime: state.telemetry.latest("runtime").unwrap_or(Value::Null),
    })
}

async fn ready_endpoint(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    Json(HealthReport {
        status: "ready",
        run_id: state.run_id.clone(),
        runtime: state.telemetry.latest("runtime").unwrap_or(Value::Null),
    })
}
