//! Experiment tracker client. Speaks the MLflow REST API.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::TrackerError;
use crate::run::Metrics;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Handle on an open tracking run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRun {
    pub run_id: String,
    pub experiment_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    Finished,
    Failed,
}

impl RunEnd {
    fn as_mlflow(self) -> &'static str {
        match self {
            RunEnd::Finished => "FINISHED",
            RunEnd::Failed => "FAILED",
        }
    }
}

pub trait ArtifactRegistry: Send + Sync {
    /// Opens a run inside the experiment, creating the experiment if needed.
    fn begin_run(&self, experiment_key: &str, run_name: &str) -> Result<TrackingRun, TrackerError>;

    fn tag(&self, run: &TrackingRun, key: &str, value: &str) -> Result<(), TrackerError>;

    /// Uploads a local file under `artifact_dir` of the run.
    fn log_artifact(
        &self,
        run: &TrackingRun,
        path: &Path,
        artifact_dir: &str,
    ) -> Result<(), TrackerError>;

    /// Never fails; an unreadable run yields an empty map.
    fn read_metrics(&self, run: &TrackingRun) -> Metrics;

    fn end_run(&self, run: &TrackingRun, end: RunEnd) -> Result<(), TrackerError>;
}

pub struct MlflowClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ExperimentEnvelope {
    experiment: ExperimentInfo,
}

#[derive(Deserialize)]
struct ExperimentInfo {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreatedExperiment {
    experiment_id: String,
}

#[derive(Deserialize)]
struct RunEnvelope {
    run: RunPayload,
}

#[derive(Deserialize)]
struct RunPayload {
    info: RunInfo,
    #[serde(default)]
    data: RunData,
}

#[derive(Deserialize)]
struct RunInfo {
    run_id: String,
    experiment_id: String,
}

#[derive(Default, Deserialize)]
struct RunData {
    #[serde(default)]
    metrics: Vec<MetricEntry>,
}

#[derive(Deserialize)]
struct MetricEntry {
    key: String,
    value: f64,
}

#[derive(Deserialize)]
struct ArtifactListing {
    #[serde(default)]
    files: Vec<ArtifactFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactFile {
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
}

impl MlflowClient {
    pub fn new(tracking_uri: impl Into<String>) -> Result<Self, TrackerError> {
        let base_url = tracking_uri.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TrackerError::Request {
                endpoint: base_url.clone(),
                message: err.to_string(),
            })?;
        Ok(Self { client, base_url })
    }

    fn api(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/{endpoint}", self.base_url)
    }

    fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<reqwest::blocking::Response, TrackerError> {
        let response = request.send().map_err(|err| TrackerError::Request {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        Err(TrackerError::Status {
            endpoint: endpoint.to_string(),
            status,
            body,
        })
    }

    fn json<T: DeserializeOwned>(&self, endpoint: &str, request: RequestBuilder) -> Result<T, TrackerError> {
        self.send(endpoint, request)?
            .json()
            .map_err(|err| TrackerError::Request {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            })
    }

    fn experiment_id(&self, name: &str) -> Result<String, TrackerError> {
        let endpoint = "mlflow/experiments/get-by-name";
        let request = self
            .client
            .get(self.api(endpoint))
            .query(&[("experiment_name", name)]);
        match self.json::<ExperimentEnvelope>(endpoint, request) {
            Ok(found) => return Ok(found.experiment.experiment_id),
            Err(TrackerError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {}
            Err(err) => return Err(err),
        }

        let endpoint = "mlflow/experiments/create";
        let request = self.client.post(self.api(endpoint)).json(&json!({ "name": name }));
        let created: CreatedExperiment = self.json(endpoint, request)?;
        debug!(experiment = name, id = created.experiment_id.as_str(), "Experiment created");
        Ok(created.experiment_id)
    }

    fn get_run(&self, run_id: &str) -> Result<RunPayload, TrackerError> {
        let endpoint = "mlflow/runs/get";
        let request = self
            .client
            .get(self.api(endpoint))
            .query(&[("run_id", run_id)]);
        Ok(self.json::<RunEnvelope>(endpoint, request)?.run)
    }

    fn artifact_url(&self, experiment_id: &str, run_id: &str, relative: &str) -> String {
        format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{experiment_id}/{run_id}/artifacts/{relative}",
            self.base_url
        )
    }

    pub fn list_artifacts(&self, run_id: &str, path: &str) -> Result<Vec<ArtifactFile>, TrackerError> {
        let endpoint = "mlflow/artifacts/list";
        let request = self
            .client
            .get(self.api(endpoint))
            .query(&[("run_id", run_id), ("path", path)]);
        Ok(self.json::<ArtifactListing>(endpoint, request)?.files)
    }

    pub fn download_artifact(&self, run_id: &str, path: &str) -> Result<Vec<u8>, TrackerError> {
        let info = self.get_run(run_id)?.info;
        let url = self.artifact_url(&info.experiment_id, &info.run_id, path);
        let bytes = self
            .send("mlflow-artifacts/artifacts", self.client.get(url))?
            .bytes()
            .map_err(|err| TrackerError::Request {
                endpoint: "mlflow-artifacts/artifacts".to_string(),
                message: err.to_string(),
            })?;
        Ok(bytes.to_vec())
    }
}

impl ArtifactRegistry for MlflowClient {
    fn begin_run(&self, experiment_key: &str, run_name: &str) -> Result<TrackingRun, TrackerError> {
        let experiment_id = self.experiment_id(experiment_key)?;
        let endpoint = "mlflow/runs/create";
        let request = self.client.post(self.api(endpoint)).json(&json!({
            "experiment_id": experiment_id,
            "run_name": run_name,
            "start_time": Utc::now().timestamp_millis(),
        }));
        let created: RunEnvelope = self.json(endpoint, request)?;
        Ok(TrackingRun {
            run_id: created.run.info.run_id,
            experiment_id: created.run.info.experiment_id,
        })
    }

    fn tag(&self, run: &TrackingRun, key: &str, value: &str) -> Result<(), TrackerError> {
        let endpoint = "mlflow/runs/set-tag";
        let request = self.client.post(self.api(endpoint)).json(&json!({
            "run_id": run.run_id,
            "key": key,
            "value": value,
        }));
        self.send(endpoint, request).map(|_| ())
    }

    fn log_artifact(
        &self,
        run: &TrackingRun,
        path: &Path,
        artifact_dir: &str,
    ) -> Result<(), TrackerError> {
        let data = std::fs::read(path).map_err(|source| TrackerError::Artifact {
            path: path.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        let url = self.artifact_url(
            &run.experiment_id,
            &run.run_id,
            &format!("{artifact_dir}/{file_name}"),
        );
        self.send("mlflow-artifacts/artifacts", self.client.put(url).body(data))
            .map(|_| ())
    }

    fn read_metrics(&self, run: &TrackingRun) -> Metrics {
        match self.get_run(&run.run_id) {
            Ok(payload) => payload
                .data
                .metrics
                .into_iter()
                .filter_map(|m| serde_json::Number::from_f64(m.value).map(|n| (m.key, Value::Number(n))))
                .collect(),
            Err(err) => {
                warn!(run_id = run.run_id.as_str(), error = %err, "Metric read-back failed");
                Metrics::new()
            }
        }
    }

    fn end_run(&self, run: &TrackingRun, end: RunEnd) -> Result<(), TrackerError> {
        let endpoint = "mlflow/runs/update";
        let request = self.client.post(self.api(endpoint)).json(&json!({
            "run_id": run.run_id,
            "status": end.as_mlflow(),
            "end_time": Utc::now().timestamp_millis(),
        }));
        self.send(endpoint, request).map(|_| ())
    }
}
