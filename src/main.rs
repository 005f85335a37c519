use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use mlops_pipeline::broadcast::Broadcaster;
use mlops_pipeline::config::Settings;
use mlops_pipeline::notebook::{self, Notebook};
use mlops_pipeline::observability::{MetricsCollector, log_snapshot};
use mlops_pipeline::phases::PapermillRunner;
use mlops_pipeline::pipeline::{Attempt, Collaborators, PipelineEngine, RunOutcome};
use mlops_pipeline::queue::TaskQueue;
use mlops_pipeline::serving::HttpModelLoader;
use mlops_pipeline::source::{GithubSource, parse_repo_url};
use mlops_pipeline::store::Store;
use mlops_pipeline::tracker::MlflowClient;
use mlops_pipeline::trigger::TriggerGateway;
use serde_json::{json, to_writer_pretty};
use tracing::info;
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing(cli.otlp_endpoint.as_deref())?;
    let settings = Settings::load(cli.config.as_deref())?;

    let command_result = match cli.command {
        Commands::RepoAdd {
            url,
            branch,
            notebook_path,
        } => repo_add(&settings, &url, &branch, &notebook_path),
        Commands::Run {
            repo_id,
            commit,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        } => run_pipeline(
            &settings,
            repo_id,
            &commit,
            MetricsOutput {
                print: print_metrics,
                json: metrics_json,
                prometheus: metrics_prometheus,
            },
        ),
        Commands::Trigger {
            event,
            payload,
            timeout_secs,
        } => trigger(&settings, &event, &payload, Duration::from_secs(timeout_secs)),
        Commands::Validate { notebook } => validate_notebook(&notebook),
        Commands::Status {
            pipeline_id,
            page,
            size,
        } => status(&settings, pipeline_id.as_deref(), page, size),
        Commands::Logs { pipeline_id } => logs(&settings, &pipeline_id),
        Commands::Deployments { model_name } => deployments(&settings, &model_name),
        #[cfg(feature = "server")]
        Commands::Serve {
            listen,
            local_artifacts,
        } => serve(&settings, &listen, local_artifacts),
    };

    #[cfg(feature = "otel")]
    if cli.otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "mlops-pipeline")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn open_store(settings: &Settings) -> Result<Store> {
    Store::open(&settings.database_path).with_context(|| {
        format!(
            "Failed to open database: {}",
            settings.database_path.display()
        )
    })
}

fn build_engine(settings: &Settings, store: Store, metrics: MetricsCollector) -> Result<PipelineEngine> {
    let collaborators = Collaborators {
        source: Arc::new(GithubSource::new(
            &settings.github_api_url,
            &settings.github_token,
        )?),
        runner: Arc::new(PapermillRunner::new(&settings.papermill_bin)),
        tracker: Arc::new(MlflowClient::new(&settings.mlflow_tracking_uri)?),
        loader: Arc::new(HttpModelLoader::new(&settings.model_server_url)?),
    };
    let publisher = Arc::new(Broadcaster::new(store.clone()));
    Ok(PipelineEngine::new(
        store,
        publisher,
        collaborators,
        settings.deploy_policy(),
        &settings.mlflow_tracking_uri,
    )
    .with_metrics(metrics))
}

fn repo_add(settings: &Settings, url: &str, branch: &str, notebook_path: &str) -> Result<()> {
    parse_repo_url(url)?;
    let store = open_store(settings)?;
    let repository = store.register_repository(url, branch, notebook_path)?;
    println!("{}", serde_json::to_string_pretty(&repository)?);
    Ok(())
}

struct MetricsOutput {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
}

fn run_pipeline(settings: &Settings, repo_id: i64, commit: &str, output: MetricsOutput) -> Result<()> {
    let store = open_store(settings)?;
    let repository = store.get_repository(repo_id)?;
    let metrics = MetricsCollector::new();
    let engine = build_engine(settings, store.clone(), metrics.clone())?;

    let run = store.create_run(repo_id, commit)?;
    info!(pipeline_id = run.id.as_str(), repo_id, "Pipeline created");
    let outcome = engine.execute(&run.id, &repository, commit, Attempt::single())?;
    let record = store.get_run(&run.id)?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    write_metrics(&metrics, &output)?;

    match outcome {
        RunOutcome::Succeeded { .. } => Ok(()),
        RunOutcome::Failed { phase, reason, .. } => match phase {
            Some(phase) => bail!("Pipeline {} failed at {phase}: {reason}", run.id),
            None => bail!("Pipeline {} failed: {reason}", run.id),
        },
        RunOutcome::RetryScheduled { reason, .. } => bail!("Pipeline {} left queued: {reason}", run.id),
        RunOutcome::Interrupted => bail!("Pipeline {} interrupted", run.id),
    }
}

fn write_metrics(metrics: &MetricsCollector, output: &MetricsOutput) -> Result<()> {
    if !output.print && output.json.is_none() && output.prometheus.is_none() {
        return Ok(());
    }
    let snapshot = metrics.snapshot();
    if output.print {
        log_snapshot(&snapshot);
    }
    if let Some(path) = &output.json {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &output.prometheus {
        ensure_parent(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create metrics directory: {}", parent.display()))?;
    }
    Ok(())
}

fn trigger(settings: &Settings, event: &str, payload: &Path, timeout: Duration) -> Result<()> {
    let body = std::fs::read(payload)
        .with_context(|| format!("Failed to read payload: {}", payload.display()))?;
    let store = open_store(settings)?;
    let engine = Arc::new(build_engine(settings, store.clone(), MetricsCollector::new())?);
    let queue = Arc::new(TaskQueue::start(
        engine,
        settings.worker_count,
        settings.retry_delay(),
    ));
    let gateway = TriggerGateway::new(store, queue.clone());

    let decision = gateway.handle(event, &body)?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    drop(gateway);

    if !queue.wait_idle(timeout) {
        bail!("Queue did not drain within {}s", timeout.as_secs());
    }
    if let Ok(queue) = Arc::try_unwrap(queue) {
        queue.shutdown();
    }
    Ok(())
}

fn validate_notebook(path: &Path) -> Result<()> {
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read notebook: {}", path.display()))?;
    let parsed = Notebook::from_slice(&raw)
        .with_context(|| format!("Failed to parse notebook: {}", path.display()))?;
    notebook::validate_required_sections(&parsed)?;
    let identity = notebook::extract_config(&parsed);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "valid": true,
            "model_name": identity.model_name,
            "version": identity.version,
        }))?
    );
    Ok(())
}

fn status(settings: &Settings, pipeline_id: Option<&str>, page: u32, size: u32) -> Result<()> {
    let store = open_store(settings)?;
    match pipeline_id {
        Some(id) => {
            let run = store.get_run(id)?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        None => {
            let (runs, total) = store.list_runs(page, size)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "items": runs,
                    "total": total,
                    "page": page,
                    "size": size,
                }))?
            );
        }
    }
    Ok(())
}

fn logs(settings: &Settings, pipeline_id: &str) -> Result<()> {
    let store = open_store(settings)?;
    store.get_run(pipeline_id)?;
    store.purge_expired_events()?;
    for event in store.events(pipeline_id)? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

fn deployments(settings: &Settings, model_name: &str) -> Result<()> {
    let store = open_store(settings)?;
    let records = store.deployments(model_name)?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

#[cfg(feature = "server")]
fn serve(settings: &Settings, listen: &str, local_artifacts: bool) -> Result<()> {
    use mlops_pipeline::serving::server::ModelServer;
    use mlops_pipeline::serving::{
        ArtifactFetcher, JsonPredictorLoader, LocalArtifactStore, ModelRegistry,
    };

    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid listen address: {listen}"))?;
    let fetcher: Arc<dyn ArtifactFetcher> = if local_artifacts {
        Arc::new(LocalArtifactStore::new(&settings.models_base_path))
    } else {
        Arc::new(MlflowClient::new(&settings.mlflow_tracking_uri)?)
    };
    let registry = Arc::new(ModelRegistry::new(fetcher, Arc::new(JsonPredictorLoader)));
    let server = ModelServer::start(addr, registry, MetricsCollector::new())?;
    info!(address = %server.address(), "Serving models");
    server.wait();
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "mlops-pipeline",
    version,
    about = "Notebook-driven training and deployment pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// YAML settings file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long = "otlp-endpoint", global = true)]
    otlp_endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a repository to watch.
    RepoAdd {
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long = "notebook-path", default_value = "notebooks/train.ipynb")]
        notebook_path: String,
    },
    /// Create a run for a repository and execute it in the foreground.
    Run {
        #[arg(long = "repo-id")]
        repo_id: i64,
        #[arg(long, default_value = "manual")]
        commit: String,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
    },
    /// Feed a webhook payload through the gateway and drain the queue.
    Trigger {
        #[arg(long, default_value = "push")]
        event: String,
        #[arg(long)]
        payload: PathBuf,
        #[arg(long = "timeout-secs", default_value_t = 3600)]
        timeout_secs: u64,
    },
    /// Check a local notebook for the required tagged sections.
    Validate { notebook: PathBuf },
    Status {
        pipeline_id: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        size: u32,
    },
    /// Replay the durable phase log of a run.
    Logs { pipeline_id: String },
    Deployments { model_name: String },
    #[cfg(feature = "server")]
    Serve {
        #[arg(long, default_value = "0.0.0.0:8001")]
        listen: String,
        /// Read artifacts from `models_base_path` instead of the tracker.
        #[arg(long)]
        local_artifacts: bool,
    },
}
