use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::broadcast::PhasePublisher;
use crate::error::{FailureClass, StoreError};
use crate::notebook::ModelIdentity;
use crate::observability::MetricsCollector;
use crate::phases::{
    self, DeployPolicy, NotebookRunner, PhaseFailure, PhaseResult, PhaseSuccess, RunContext,
};
use crate::run::{
    COMPLETE_PHASE, Metrics, PhaseEvent, PhaseName, PhaseRecord, PhaseStatus, PipelineRun,
    RETRY_PHASE, RepositoryDescriptor, RunStatus, SHUTDOWN_PHASE,
};
use crate::serving::ModelLoader;
use crate::source::NotebookSource;
use crate::store::Store;
use crate::tracker::ArtifactRegistry;

/// Failure reason stored when a run is cut short by shutdown.
pub const SHUTDOWN_REASON: &str = "worker_shutdown";

/// Cooperative stop flag shared between the queue and the engine. Checked
/// between phases only.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// External systems the phases talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn NotebookSource>,
    pub runner: Arc<dyn NotebookRunner>,
    pub tracker: Arc<dyn ArtifactRegistry>,
    pub loader: Arc<dyn ModelLoader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub max: u32,
}

impl Attempt {
    /// One run with no automatic retry.
    pub fn single() -> Self {
        Self { number: 1, max: 1 }
    }

    pub fn first(max: u32) -> Self {
        Self {
            number: 1,
            max: max.max(1),
        }
    }

    pub fn next(self) -> Self {
        Self {
            number: self.number + 1,
            max: self.max,
        }
    }

    pub fn has_retry(self) -> bool {
        self.number < self.max
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded {
        metrics: Metrics,
    },
    Failed {
        phase: Option<PhaseName>,
        reason: String,
        class: FailureClass,
    },
    /// Run went back to `queued`; the queue owns the next attempt.
    RetryScheduled {
        phase: PhaseName,
        reason: String,
    },
    Interrupted,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Succeeded { .. } => RunStatus::Success,
            RunOutcome::RetryScheduled { .. } => RunStatus::Queued,
            RunOutcome::Failed { .. } | RunOutcome::Interrupted => RunStatus::Failed,
        }
    }
}

/// Drives one run through download, validate, execute, register and deploy.
///
/// Phase handlers in [`crate::phases`] only compute; every persist and
/// broadcast happens here, in the order mark, persist, publish.
pub struct PipelineEngine {
    store: Store,
    publisher: Arc<dyn PhasePublisher>,
    collaborators: Collaborators,
    policy: DeployPolicy,
    tracking_uri: String,
    shutdown: ShutdownSignal,
    metrics: MetricsCollector,
}

struct Halt {
    phase: PhaseName,
    failure: PhaseFailure,
}

impl PipelineEngine {
    pub fn new(
        store: Store,
        publisher: Arc<dyn PhasePublisher>,
        collaborators: Collaborators,
        policy: DeployPolicy,
        tracking_uri: impl Into<String>,
    ) -> Self {
        Self {
            store,
            publisher,
            collaborators,
            policy,
            tracking_uri: tracking_uri.into(),
            shutdown: ShutdownSignal::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Runs `pipeline_id`, which must be `queued`. Errors only when the run
    /// cannot be picked up; every phase failure is folded into the outcome.
    #[instrument(name = "pipeline", skip(self, repository, attempt), fields(commit_sha = commit_sha))]
    pub fn execute(
        &self,
        pipeline_id: &str,
        repository: &RepositoryDescriptor,
        commit_sha: &str,
        attempt: Attempt,
    ) -> Result<RunOutcome, StoreError> {
        let mut run = self.store.get_run(pipeline_id)?;
        if run.status != RunStatus::Queued {
            return Err(StoreError::NotQueued {
                id: pipeline_id.to_string(),
                status: run.status.to_string(),
            });
        }
        if attempt.number > 1 {
            // Earlier attempts stay in the durable event log only.
            run.phases.clear();
            run.metrics.clear();
        }
        run.status = RunStatus::Running;
        if run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        run.failure_reason = None;
        self.store.save_run(&run)?;
        info!(attempt = attempt.number, "Pipeline started");

        let ctx = RunContext {
            pipeline_id,
            commit_sha,
            repository,
        };

        let outcome = match self.drive(&mut run, &ctx, attempt.number) {
            Ok(Progress::Done(metrics)) => self.succeed(&mut run, metrics),
            Ok(Progress::Interrupted) => self.interrupt(&mut run),
            Err(halt) => self.fail(&mut run, halt, attempt),
        };
        Ok(outcome)
    }

    /// Fails a run that never reached the phase loop, such as one whose
    /// repository is gone or whose retry was cut off by shutdown.
    /// Terminal runs are left alone and reported as [`StoreError::Terminal`].
    pub fn abandon(
        &self,
        pipeline_id: &str,
        reason: &str,
        class: FailureClass,
    ) -> Result<RunOutcome, StoreError> {
        let mut run = self.store.get_run(pipeline_id)?;
        if run.status.is_terminal() {
            return Err(StoreError::Terminal(pipeline_id.to_string()));
        }
        if class == FailureClass::Interrupted {
            return Ok(self.interrupt(&mut run));
        }
        run.status = RunStatus::Failed;
        run.finished_at = Some(Utc::now());
        run.failure_reason = Some(reason.to_string());
        self.finalize(&run, reason);
        self.metrics.record_run(RunStatus::Failed);
        warn!(pipeline_id, reason, "Pipeline abandoned");
        Ok(RunOutcome::Failed {
            phase: None,
            reason: reason.to_string(),
            class,
        })
    }

    fn drive(
        &self,
        run: &mut PipelineRun,
        ctx: &RunContext<'_>,
        attempt: u32,
    ) -> Result<Progress, Halt> {
        let raw = self.phase(run, PhaseName::Download, attempt, || {
            phases::download(self.collaborators.source.as_ref(), ctx)
        })?;

        if self.shutdown.is_triggered() {
            return Ok(Progress::Interrupted);
        }
        let identity = self.phase(run, PhaseName::Validate, attempt, || phases::validate(&raw))?;

        if self.shutdown.is_triggered() {
            return Ok(Progress::Interrupted);
        }
        let (workdir, output) = self.phase(run, PhaseName::Execute, attempt, || {
            let workdir = tempfile::Builder::new()
                .prefix("mlops-run-")
                .tempdir()
                .map_err(|err| PhaseFailure::transient(format!("Cannot create workspace: {err}")))?;
            let executed = phases::execute(
                self.collaborators.runner.as_ref(),
                workdir.path(),
                &raw,
                ctx,
                &self.tracking_uri,
            )?;
            Ok(PhaseSuccess::new((workdir, executed.value), executed.logs))
        })?;

        if self.shutdown.is_triggered() {
            close_workdir(workdir);
            return Ok(Progress::Interrupted);
        }
        let registration = self.phase(run, PhaseName::Register, attempt, || {
            phases::register(
                self.collaborators.tracker.as_ref(),
                ctx,
                &identity,
                output.artifact.as_deref(),
            )
        });
        close_workdir(workdir);
        let registration = registration?;

        let mut metrics = registration.metrics.clone();
        if !metrics.contains_key("accuracy") {
            metrics.insert("accuracy".to_string(), Value::from(registration.accuracy));
        }

        if self.shutdown.is_triggered() {
            return Ok(Progress::Interrupted);
        }
        let deployed = self.deploy(run, ctx, &identity, &registration, attempt);
        metrics.insert("deployed".to_string(), Value::Bool(deployed));
        Ok(Progress::Done(metrics))
    }

    /// Deploy is the one phase whose failure does not fail the run.
    fn deploy(
        &self,
        run: &mut PipelineRun,
        ctx: &RunContext<'_>,
        identity: &ModelIdentity,
        registration: &phases::Registration,
        attempt: u32,
    ) -> bool {
        if let Some(reason) = self.policy.skip_reason(registration.accuracy) {
            info!(
                model_name = identity.model_name.as_str(),
                reason = reason.as_str(),
                "Deploy skipped"
            );
            self.metrics.record_deploy_skipped();
            return false;
        }
        let result = self.phase(run, PhaseName::Deploy, attempt, || {
            phases::deploy(
                self.collaborators.loader.as_ref(),
                &self.store,
                &self.policy,
                ctx,
                identity,
                registration,
            )
        });
        match result {
            Ok(record) => {
                self.metrics.record_deployment();
                info!(
                    model_name = record.model_name.as_str(),
                    version = record.version.as_str(),
                    endpoint = record.endpoint_url.as_str(),
                    "Model promoted"
                );
                true
            }
            Err(halt) => {
                warn!(error = halt.failure.message.as_str(), "Deploy failed; run still succeeds");
                false
            }
        }
    }

    /// Appends a record for `name`, runs `handler` and records its outcome.
    fn phase<T, F>(
        &self,
        run: &mut PipelineRun,
        name: PhaseName,
        attempt: u32,
        handler: F,
    ) -> Result<T, Halt>
    where
        F: FnOnce() -> PhaseResult<T>,
    {
        let span = tracing::span!(tracing::Level::INFO, "phase", phase = name.as_str());
        let _guard = span.enter();
        let mut timer = self.metrics.start_phase(name);
        let halt = |failure: PhaseFailure| Halt {
            phase: name,
            failure,
        };

        run.phases.push(PhaseRecord::pending(name, attempt));
        let index = run.phases.len() - 1;
        run.phases[index].mark_running();
        if let Err(err) = self.checkpoint(run, index) {
            timer.mark_failed();
            run.phases[index].finish(PhaseStatus::Failed, err.to_string());
            return Err(halt(err.into()));
        }

        match handler() {
            Ok(success) => {
                run.phases[index].finish(PhaseStatus::Success, success.logs);
                if let Err(err) = self.checkpoint(run, index) {
                    timer.mark_failed();
                    run.phases[index].finish(PhaseStatus::Failed, err.to_string());
                    return Err(halt(err.into()));
                }
                Ok(success.value)
            }
            Err(failure) => {
                timer.mark_failed();
                warn!(error = failure.message.as_str(), class = ?failure.class, "Phase failed");
                run.phases[index].finish(PhaseStatus::Failed, failure.message.clone());
                if let Err(err) = self.checkpoint(run, index) {
                    warn!(error = %err, "Failed to persist phase failure");
                }
                Err(halt(failure))
            }
        }
    }

    /// Persists the whole run, then publishes the record at `index`.
    fn checkpoint(&self, run: &PipelineRun, index: usize) -> Result<(), StoreError> {
        self.store.save_run(run)?;
        self.publish(&PhaseEvent::from_record(&run.id, &run.phases[index]));
        Ok(())
    }

    fn publish(&self, event: &PhaseEvent) {
        if let Err(err) = self.publisher.publish(event) {
            warn!(
                pipeline_id = event.pipeline_id.as_str(),
                phase = event.phase.as_str(),
                error = %err,
                "Phase event not broadcast"
            );
        }
    }

    fn succeed(&self, run: &mut PipelineRun, metrics: Metrics) -> RunOutcome {
        run.status = RunStatus::Success;
        run.finished_at = Some(Utc::now());
        run.metrics = metrics.clone();
        self.finalize(run, "Pipeline completed successfully");
        self.metrics.record_run(RunStatus::Success);
        info!("Pipeline succeeded");
        RunOutcome::Succeeded { metrics }
    }

    fn fail(&self, run: &mut PipelineRun, halt: Halt, attempt: Attempt) -> RunOutcome {
        let Halt { phase, failure } = halt;
        if failure.class.is_retryable() && attempt.has_retry() {
            if self.shutdown.is_triggered() {
                info!(phase = phase.as_str(), "Retry dropped during shutdown");
                return self.interrupt(run);
            }
            run.status = RunStatus::Queued;
            run.failure_reason = Some(failure.message.clone());
            if let Err(err) = self.store.save_run(run) {
                warn!(error = %err, "Failed to requeue run");
            }
            self.publish(&PhaseEvent::new(
                &run.id,
                RETRY_PHASE,
                RunStatus::Queued.as_str(),
                format!("{phase} failed: {}", failure.message),
            ));
            self.metrics.record_retry();
            info!(phase = phase.as_str(), next_attempt = attempt.number + 1, "Retry scheduled");
            return RunOutcome::RetryScheduled {
                phase,
                reason: failure.message,
            };
        }

        run.status = RunStatus::Failed;
        run.finished_at = Some(Utc::now());
        run.failure_reason = Some(failure.message.clone());
        self.finalize(run, &format!("Pipeline failed at {phase}: {}", failure.message));
        self.metrics.record_run(RunStatus::Failed);
        info!(phase = phase.as_str(), "Pipeline failed");
        RunOutcome::Failed {
            phase: Some(phase),
            reason: failure.message,
            class: failure.class,
        }
    }

    fn interrupt(&self, run: &mut PipelineRun) -> RunOutcome {
        run.status = RunStatus::Failed;
        run.finished_at = Some(Utc::now());
        run.failure_reason = Some(SHUTDOWN_REASON.to_string());
        self.publish(&PhaseEvent::new(
            &run.id,
            SHUTDOWN_PHASE,
            RunStatus::Failed.as_str(),
            SHUTDOWN_REASON,
        ));
        self.finalize(run, SHUTDOWN_REASON);
        self.metrics.record_run(RunStatus::Failed);
        info!("Pipeline interrupted by shutdown");
        RunOutcome::Interrupted
    }

    /// Terminal write followed by the `complete` sentinel.
    fn finalize(&self, run: &PipelineRun, logs: &str) {
        if let Err(err) = self.store.save_run(run) {
            warn!(error = %err, status = run.status.as_str(), "Failed to persist terminal state");
        }
        self.publish(&PhaseEvent::new(
            &run.id,
            COMPLETE_PHASE,
            run.status.as_str(),
            logs,
        ));
    }
}

enum Progress {
    Done(Metrics),
    Interrupted,
}

fn close_workdir(workdir: tempfile::TempDir) {
    let path = workdir.path().to_path_buf();
    if let Err(err) = workdir.close() {
        warn!(path = %path.display(), error = %err, "Workspace cleanup failed");
    }
}
