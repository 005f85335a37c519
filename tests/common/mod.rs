#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mlops_pipeline::broadcast::{BroadcastError, PhasePublisher};
use mlops_pipeline::error::{ExecutionError, LoadError, SourceError, TrackerError};
use mlops_pipeline::phases::DeployPolicy;
use mlops_pipeline::phases::execute::{ExecutionParams, NotebookRunner};
use mlops_pipeline::pipeline::{Collaborators, PipelineEngine, ShutdownSignal};
use mlops_pipeline::run::{Metrics, PhaseEvent, RepositoryDescriptor};
use mlops_pipeline::serving::{LoadRequest, ModelLoader};
use mlops_pipeline::source::NotebookSource;
use mlops_pipeline::store::Store;
use mlops_pipeline::tracker::{ArtifactRegistry, RunEnd, TrackingRun};
use serde_json::{Value, json};

pub const ALL_TAGS: [&str; 4] = [
    "mlops:config",
    "mlops:preprocessing",
    "mlops:training",
    "mlops:export",
];

/// One code cell per tag; the config cell carries `config_source`.
pub fn notebook_bytes(tags: &[&str], config_source: &str) -> Vec<u8> {
    let cells: Vec<Value> = tags
        .iter()
        .map(|tag| {
            let source = if *tag == "mlops:config" {
                config_source.to_string()
            } else {
                format!("# {tag}")
            };
            json!({
                "cell_type": "code",
                "source": source,
                "metadata": {"tags": [tag]},
                "outputs": []
            })
        })
        .collect();
    serde_json::to_vec(&json!({ "cells": cells, "nbformat": 4, "nbformat_minor": 5 })).unwrap()
}

pub fn iris_notebook() -> Vec<u8> {
    notebook_bytes(&ALL_TAGS, "MODEL_NAME = \"iris-classifier\"\nVERSION = \"1\"\n")
}

pub fn network_error() -> SourceError {
    SourceError::Network("connection refused".into())
}

/// Serves canned responses in order; the last one repeats.
pub struct FakeSource {
    responses: Mutex<Vec<Result<Vec<u8>, SourceError>>>,
    pub calls: AtomicUsize,
    on_download: Option<ShutdownSignal>,
}

impl FakeSource {
    pub fn returning(bytes: Vec<u8>) -> Self {
        Self::sequence(vec![Ok(bytes)])
    }

    pub fn sequence(responses: Vec<Result<Vec<u8>, SourceError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
            on_download: None,
        }
    }

    /// Raises `signal` while the download phase is in flight.
    pub fn triggering(mut self, signal: ShutdownSignal) -> Self {
        self.on_download = Some(signal);
        self
    }
}

impl NotebookSource for FakeSource {
    fn download(
        &self,
        _repository: &RepositoryDescriptor,
        _branch: &str,
        _path: &str,
    ) -> Result<Vec<u8>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(signal) = &self.on_download {
            signal.trigger();
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            responses.remove(0)
        } else {
            match &responses[0] {
                Ok(bytes) => Ok(bytes.clone()),
                Err(SourceError::Network(msg)) => Err(SourceError::Network(msg.clone())),
                Err(other) => Err(SourceError::Decode(other.to_string())),
            }
        }
    }
}

/// Copies the input notebook to the output with a stdout line per cell and
/// optionally writes a model artifact.
pub struct FakeRunner {
    pub write_artifact: bool,
    pub fail: bool,
    pub params: Mutex<Vec<(String, String)>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            write_artifact: true,
            fail: false,
            params: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

impl NotebookRunner for FakeRunner {
    fn run(
        &self,
        input: &Path,
        output: &Path,
        _workdir: &Path,
        params: &ExecutionParams,
    ) -> Result<(), ExecutionError> {
        self.params.lock().unwrap().extend(
            params
                .pairs()
                .into_iter()
                .map(|(key, value)| (key.to_string(), value)),
        );
        if self.fail {
            return Err(ExecutionError::Failed {
                status: "exit status: 1".into(),
                stderr: "ZeroDivisionError".into(),
            });
        }
        let mut notebook: Value = serde_json::from_slice(&fs::read(input)?).unwrap();
        for cell in notebook["cells"].as_array_mut().unwrap() {
            cell["outputs"] = json!([{ "output_type": "stream", "name": "stdout", "text": "ok\n" }]);
        }
        fs::write(output, serde_json::to_vec(&notebook).unwrap())?;
        if self.write_artifact {
            fs::write(
                &params.model_output_path,
                br#"{"kind": "linear", "weights": [[1.0]], "bias": [0.0]}"#,
            )?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct TrackerLog {
    pub experiments: Vec<String>,
    pub run_names: Vec<String>,
    pub tags: Vec<(String, String)>,
    pub artifacts: Vec<String>,
    pub ended: Vec<RunEnd>,
}

pub struct FakeTracker {
    metrics: Metrics,
    fail_begin: bool,
    pub log: Mutex<TrackerLog>,
}

impl FakeTracker {
    pub fn with_accuracy(accuracy: f64) -> Self {
        let mut metrics = Metrics::new();
        metrics.insert("accuracy".into(), json!(accuracy));
        Self {
            metrics,
            fail_begin: false,
            log: Mutex::new(TrackerLog::default()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            fail_begin: true,
            ..Self::with_accuracy(0.0)
        }
    }
}

impl ArtifactRegistry for FakeTracker {
    fn begin_run(&self, experiment_key: &str, run_name: &str) -> Result<TrackingRun, TrackerError> {
        if self.fail_begin {
            return Err(TrackerError::Request {
                endpoint: "runs/create".into(),
                message: "connection refused".into(),
            });
        }
        let mut log = self.log.lock().unwrap();
        log.experiments.push(experiment_key.to_string());
        log.run_names.push(run_name.to_string());
        Ok(TrackingRun {
            run_id: format!("run-{}", log.run_names.len()),
            experiment_id: "1".into(),
        })
    }

    fn tag(&self, _run: &TrackingRun, key: &str, value: &str) -> Result<(), TrackerError> {
        self.log
            .lock()
            .unwrap()
            .tags
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    fn log_artifact(
        &self,
        _run: &TrackingRun,
        path: &Path,
        artifact_dir: &str,
    ) -> Result<(), TrackerError> {
        let name = path.file_name().unwrap().to_string_lossy();
        self.log
            .lock()
            .unwrap()
            .artifacts
            .push(format!("{artifact_dir}/{name}"));
        Ok(())
    }

    fn read_metrics(&self, _run: &TrackingRun) -> Metrics {
        self.metrics.clone()
    }

    fn end_run(&self, _run: &TrackingRun, end: RunEnd) -> Result<(), TrackerError> {
        self.log.lock().unwrap().ended.push(end);
        Ok(())
    }
}

pub struct FakeLoader {
    fail: bool,
    pub loads: Mutex<Vec<(String, LoadRequest)>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            fail: false,
            loads: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

impl ModelLoader for FakeLoader {
    fn load_model(&self, name: &str, request: &LoadRequest) -> Result<(), LoadError> {
        self.loads
            .lock()
            .unwrap()
            .push((name.to_string(), request.clone()));
        if self.fail {
            return Err(LoadError::Status {
                status: 500,
                body: "model server unavailable".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<PhaseEvent>>,
}

impl RecordingPublisher {
    pub fn phases(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.phase.clone(), e.status.clone()))
            .collect()
    }
}

impl PhasePublisher for RecordingPublisher {
    fn publish(&self, event: &PhaseEvent) -> Result<(), BroadcastError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct FailingPublisher;

impl PhasePublisher for FailingPublisher {
    fn publish(&self, _event: &PhaseEvent) -> Result<(), BroadcastError> {
        Err(BroadcastError::Poisoned)
    }
}

pub fn policy(min_accuracy: f64) -> DeployPolicy {
    DeployPolicy {
        enabled: true,
        min_accuracy,
        model_server_url: "http://model-server:8001".into(),
    }
}

pub struct Harness {
    pub store: Store,
    pub repository: RepositoryDescriptor,
    pub source: Arc<FakeSource>,
    pub runner: Arc<FakeRunner>,
    pub tracker: Arc<FakeTracker>,
    pub loader: Arc<FakeLoader>,
}

impl Harness {
    pub fn new(source: FakeSource, tracker: FakeTracker, loader: FakeLoader) -> Self {
        let store = Store::open_in_memory().unwrap();
        let repository = store
            .register_repository(
                "https://github.com/acme/iris",
                "main",
                "notebooks/train.ipynb",
            )
            .unwrap();
        Self {
            store,
            repository,
            source: Arc::new(source),
            runner: Arc::new(FakeRunner::new()),
            tracker: Arc::new(tracker),
            loader: Arc::new(loader),
        }
    }

    pub fn iris(accuracy: f64) -> Self {
        Self::new(
            FakeSource::returning(iris_notebook()),
            FakeTracker::with_accuracy(accuracy),
            FakeLoader::new(),
        )
    }

    pub fn with_runner(mut self, runner: FakeRunner) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    pub fn engine(&self, publisher: Arc<dyn PhasePublisher>, policy: DeployPolicy) -> PipelineEngine {
        let collaborators = Collaborators {
            source: self.source.clone(),
            runner: self.runner.clone(),
            tracker: self.tracker.clone(),
            loader: self.loader.clone(),
        };
        PipelineEngine::new(
            self.store.clone(),
            publisher,
            collaborators,
            policy,
            "http://mlflow:5000",
        )
    }
}
