//! Phase handlers. Each returns a typed outcome and performs no run
//! bookkeeping; persistence and broadcasting belong to the engine.

use std::path::Path;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::digest::compute_sha256;
use crate::error::{ContractError, FailureClass, LoadError, SourceError, StoreError, TrackerError};
use crate::notebook::{self, ModelIdentity, Notebook};
use crate::run::{Metrics, ModelDeploymentRecord, RepositoryDescriptor};
use crate::serving::{LoadRequest, MODEL_ARTIFACT_DIR, ModelLoader};
use crate::source::NotebookSource;
use crate::store::Store;
use crate::tracker::{ArtifactRegistry, RunEnd, TrackingRun};

pub mod execute;

pub use execute::{ExecutionOutput, NotebookRunner, PapermillRunner, cell_log_excerpt, execute_notebook};

/// A finished phase: its value plus the excerpt stored on the record.
#[derive(Debug)]
pub struct PhaseSuccess<T> {
    pub value: T,
    pub logs: String,
}

impl<T> PhaseSuccess<T> {
    pub fn new(value: T, logs: impl Into<String>) -> Self {
        Self {
            value,
            logs: logs.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseFailure {
    pub message: String,
    pub class: FailureClass,
}

impl PhaseFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class,
        }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Contract, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }
}

impl From<SourceError> for PhaseFailure {
    fn from(err: SourceError) -> Self {
        Self::new(FailureClass::from(&err), err.to_string())
    }
}

impl From<ContractError> for PhaseFailure {
    fn from(err: ContractError) -> Self {
        Self::contract(err.to_string())
    }
}

impl From<crate::error::ExecutionError> for PhaseFailure {
    fn from(err: crate::error::ExecutionError) -> Self {
        Self::new(FailureClass::from(&err), err.to_string())
    }
}

impl From<TrackerError> for PhaseFailure {
    fn from(err: TrackerError) -> Self {
        Self::transient(err.to_string())
    }
}

impl From<LoadError> for PhaseFailure {
    fn from(err: LoadError) -> Self {
        Self::transient(err.to_string())
    }
}

impl From<StoreError> for PhaseFailure {
    fn from(err: StoreError) -> Self {
        Self::transient(err.to_string())
    }
}

pub type PhaseResult<T> = Result<PhaseSuccess<T>, PhaseFailure>;

/// Identity of the run a phase is working for.
#[derive(Debug, Clone)]
pub struct RunContext<'a> {
    pub pipeline_id: &'a str,
    pub commit_sha: &'a str,
    pub repository: &'a RepositoryDescriptor,
}

impl RunContext<'_> {
    /// First eight characters of the pipeline id.
    pub fn short_id(&self) -> &str {
        let end = self
            .pipeline_id
            .char_indices()
            .nth(8)
            .map_or(self.pipeline_id.len(), |(idx, _)| idx);
        &self.pipeline_id[..end]
    }
}

pub fn download(source: &dyn NotebookSource, ctx: &RunContext<'_>) -> PhaseResult<Vec<u8>> {
    let repo = ctx.repository;
    let bytes = source.download(repo, &repo.branch, &repo.notebook_path)?;
    let logs = format!(
        "Downloaded {} ({} bytes) from {}@{}",
        repo.notebook_path,
        bytes.len(),
        repo.github_url,
        repo.branch
    );
    Ok(PhaseSuccess::new(bytes, logs))
}

pub fn validate(raw: &[u8]) -> PhaseResult<ModelIdentity> {
    let parsed = Notebook::from_slice(raw)?;
    notebook::validate_required_sections(&parsed)?;
    let identity = notebook::extract_config(&parsed);
    let logs = format!(
        "Contract satisfied; model {} version {}",
        identity.model_name, identity.version
    );
    Ok(PhaseSuccess::new(identity, logs))
}

pub fn execute(
    runner: &dyn NotebookRunner,
    workdir: &Path,
    raw: &[u8],
    ctx: &RunContext<'_>,
    tracking_uri: &str,
) -> PhaseResult<ExecutionOutput> {
    let output = execute_notebook(runner, workdir, raw, ctx.pipeline_id, tracking_uri)?;
    let logs = cell_log_excerpt(&output.cell_logs);
    Ok(PhaseSuccess::new(output, logs))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub run_reference: String,
    pub metrics: Metrics,
    pub accuracy: f64,
}

pub fn experiment_key(model_name: &str) -> String {
    format!("mlops-{model_name}")
}

pub fn register(
    tracker: &dyn ArtifactRegistry,
    ctx: &RunContext<'_>,
    identity: &ModelIdentity,
    artifact: Option<&Path>,
) -> PhaseResult<Registration> {
    let run_name = format!("{}-{}", identity.model_name, ctx.short_id());
    let run = tracker.begin_run(&experiment_key(&identity.model_name), &run_name)?;

    match record_run(tracker, &run, ctx, identity, artifact) {
        Ok(()) => {}
        Err(err) => {
            if let Err(end_err) = tracker.end_run(&run, RunEnd::Failed) {
                warn!(run_id = run.run_id.as_str(), error = %end_err, "Failed to close tracking run");
            }
            return Err(err.into());
        }
    }

    let metrics = tracker.read_metrics(&run);
    let accuracy = metrics.get("accuracy").and_then(Value::as_f64).unwrap_or(0.0);
    if let Err(err) = tracker.end_run(&run, RunEnd::Finished) {
        warn!(run_id = run.run_id.as_str(), error = %err, "Failed to close tracking run");
    }

    info!(run_id = run.run_id.as_str(), accuracy, "Tracking run registered");
    let logs = format!("Tracking run {} (accuracy {accuracy})", run.run_id);
    Ok(PhaseSuccess::new(
        Registration {
            run_reference: run.run_id,
            metrics,
            accuracy,
        },
        logs,
    ))
}

fn record_run(
    tracker: &dyn ArtifactRegistry,
    run: &TrackingRun,
    ctx: &RunContext<'_>,
    identity: &ModelIdentity,
    artifact: Option<&Path>,
) -> Result<(), TrackerError> {
    tracker.tag(run, "pipeline_id", ctx.pipeline_id)?;
    tracker.tag(run, "commit_sha", ctx.commit_sha)?;
    tracker.tag(run, "model_name", &identity.model_name)?;
    tracker.tag(run, "version", &identity.version)?;

    if let Some(path) = artifact.filter(|p| p.is_file()) {
        tracker.log_artifact(run, path, MODEL_ARTIFACT_DIR)?;
        match compute_sha256(path) {
            Ok(digest) => tracker.tag(run, "artifact_sha256", &digest)?,
            Err(err) => warn!(path = %path.display(), error = %err, "Artifact digest unavailable"),
        }
    }
    Ok(())
}

/// Promotion settings applied after registration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployPolicy {
    pub enabled: bool,
    pub min_accuracy: f64,
    pub model_server_url: String,
}

impl DeployPolicy {
    /// `Some(reason)` when the deploy phase must be skipped.
    pub fn skip_reason(&self, accuracy: f64) -> Option<String> {
        if !self.enabled {
            return Some("auto deploy disabled".to_string());
        }
        if accuracy < self.min_accuracy {
            return Some(format!("accuracy {accuracy} < {}", self.min_accuracy));
        }
        None
    }

    pub fn endpoint_for(&self, model_name: &str) -> String {
        format!(
            "{}/predict/{model_name}",
            self.model_server_url.trim_end_matches('/')
        )
    }
}

pub fn deploy(
    loader: &dyn ModelLoader,
    store: &Store,
    policy: &DeployPolicy,
    ctx: &RunContext<'_>,
    identity: &ModelIdentity,
    registration: &Registration,
) -> PhaseResult<ModelDeploymentRecord> {
    loader.load_model(
        &identity.model_name,
        &LoadRequest {
            run_reference: registration.run_reference.clone(),
            version: identity.version.clone(),
        },
    )?;

    let record = store.promote(&ModelDeploymentRecord {
        id: None,
        model_name: identity.model_name.clone(),
        version: identity.version.clone(),
        accuracy: registration.accuracy,
        endpoint_url: policy.endpoint_for(&identity.model_name),
        deployed_at: Utc::now(),
        is_active: true,
        pipeline_id: Some(ctx.pipeline_id.to_string()),
    })?;
    let logs = format!("Serving at {}", record.endpoint_url);
    Ok(PhaseSuccess::new(record, logs))
}
