//! Serving-side model directory: loaded predictors keyed by model name.
//!
//! Loads fetch and deserialize outside the lock; only the map swap is
//! guarded, so predictions never wait on a slow load. A replaced entry is
//! dropped once its in-flight callers release their `Arc`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::digest::sha256_hex;
use crate::error::{LoadError, RegistryError};
use crate::tracker::MlflowClient;

#[cfg(feature = "server")]
pub mod server;

/// Directory under a tracking run that holds the model artifact.
pub const MODEL_ARTIFACT_DIR: &str = "model";

const LOAD_TIMEOUT: Duration = Duration::from_secs(120);

pub trait Predictor: Send + Sync {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<Value>, RegistryError>;
}

/// Turns artifact bytes into an invokable predictor.
pub trait PredictorLoader: Send + Sync {
    fn load(&self, bytes: &[u8]) -> Result<Box<dyn Predictor>, RegistryError>;
}

/// Locates the model artifact produced by a tracking run.
pub trait ArtifactFetcher: Send + Sync {
    fn fetch(&self, run_reference: &str) -> Result<Vec<u8>, RegistryError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredictorSpec {
    /// `scores = weights · row + bias`, one weight row per output.
    Linear {
        weights: Vec<Vec<f64>>,
        #[serde(default)]
        bias: Vec<f64>,
        #[serde(default)]
        classes: Option<Vec<Value>>,
    },
}

pub struct LinearPredictor {
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
    classes: Option<Vec<Value>>,
}

impl LinearPredictor {
    fn scores(&self, row: &[f64]) -> Result<Vec<f64>, RegistryError> {
        self.weights
            .iter()
            .enumerate()
            .map(|(idx, weights)| {
                if weights.len() != row.len() {
                    return Err(RegistryError::Predict(format!(
                        "expected {} features, got {}",
                        weights.len(),
                        row.len()
                    )));
                }
                let dot: f64 = weights.iter().zip(row).map(|(w, x)| w * x).sum();
                Ok(dot + self.bias.get(idx).copied().unwrap_or(0.0))
            })
            .collect()
    }
}

impl Predictor for LinearPredictor {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<Value>, RegistryError> {
        rows.iter()
            .map(|row| {
                let scores = self.scores(row)?;
                match (&self.classes, scores.as_slice()) {
                    (Some(classes), _) => {
                        let best = scores
                            .iter()
                            .enumerate()
                            .max_by(|a, b| a.1.total_cmp(b.1))
                            .map(|(idx, _)| idx)
                            .unwrap_or(0);
                        classes.get(best).cloned().ok_or_else(|| {
                            RegistryError::Predict(format!("no class label for output {best}"))
                        })
                    }
                    (None, [single]) => Ok(json!(single)),
                    (None, many) => Ok(json!(many)),
                }
            })
            .collect()
    }
}

/// Reads [`PredictorSpec`] JSON documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPredictorLoader;

impl PredictorLoader for JsonPredictorLoader {
    fn load(&self, bytes: &[u8]) -> Result<Box<dyn Predictor>, RegistryError> {
        let spec: PredictorSpec = serde_json::from_slice(bytes)
            .map_err(|err| RegistryError::Deserialize(err.to_string()))?;
        match spec {
            PredictorSpec::Linear {
                weights,
                bias,
                classes,
            } => {
                if weights.is_empty() {
                    return Err(RegistryError::Deserialize(
                        "linear model needs at least one weight row".into(),
                    ));
                }
                if let Some(labels) = &classes
                    && labels.len() != weights.len()
                {
                    return Err(RegistryError::Deserialize(format!(
                        "{} class labels for {} outputs",
                        labels.len(),
                        weights.len()
                    )));
                }
                Ok(Box::new(LinearPredictor {
                    weights,
                    bias,
                    classes,
                }))
            }
        }
    }
}

impl ArtifactFetcher for MlflowClient {
    fn fetch(&self, run_reference: &str) -> Result<Vec<u8>, RegistryError> {
        let unavailable = |message: String| RegistryError::Artifact {
            run: run_reference.to_string(),
            message,
        };
        let files = self
            .list_artifacts(run_reference, MODEL_ARTIFACT_DIR)
            .map_err(|err| unavailable(err.to_string()))?;
        let candidates: Vec<_> = files.into_iter().filter(|f| !f.is_dir).collect();
        let chosen = candidates
            .iter()
            .find(|f| f.path.ends_with(".json"))
            .or_else(|| candidates.first())
            .ok_or_else(|| unavailable(format!("no files under '{MODEL_ARTIFACT_DIR}'")))?;
        self.download_artifact(run_reference, &chosen.path)
            .map_err(|err| unavailable(err.to_string()))
    }
}

/// Artifacts laid out as `<root>/<run_reference>/model/<file>`.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactFetcher for LocalArtifactStore {
    fn fetch(&self, run_reference: &str) -> Result<Vec<u8>, RegistryError> {
        let unavailable = |message: String| RegistryError::Artifact {
            run: run_reference.to_string(),
            message,
        };
        let dir = self.root.join(run_reference).join(MODEL_ARTIFACT_DIR);
        let pattern = dir.join("*");
        let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map_err(|err| unavailable(err.to_string()))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        let chosen = files
            .iter()
            .find(|path| path.extension().is_some_and(|ext| ext == "json"))
            .or_else(|| files.first())
            .ok_or_else(|| unavailable(format!("no model files in {}", dir.display())))?;
        std::fs::read(chosen).map_err(|err| unavailable(format!("{}: {err}", chosen.display())))
    }
}

pub struct LoadedModel {
    pub model_name: String,
    pub version: String,
    pub run_reference: String,
    pub artifact_sha256: String,
    pub loaded_at: DateTime<Utc>,
    predictor: Box<dyn Predictor>,
    request_count: AtomicU64,
}

impl LoadedModel {
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            model_name: self.model_name.clone(),
            version: self.version.clone(),
            run_reference: self.run_reference.clone(),
            artifact_sha256: self.artifact_sha256.clone(),
            loaded_at: self.loaded_at,
            request_count: self.request_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub version: String,
    #[serde(rename = "mlflow_run_id")]
    pub run_reference: String,
    pub artifact_sha256: String,
    pub loaded_at: DateTime<Utc>,
    pub request_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub prediction: Vec<Value>,
    pub model_name: String,
    pub version: String,
}

pub struct ModelRegistry {
    entries: Mutex<HashMap<String, Arc<LoadedModel>>>,
    fetcher: Arc<dyn ArtifactFetcher>,
    loader: Arc<dyn PredictorLoader>,
}

impl ModelRegistry {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>, loader: Arc<dyn PredictorLoader>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fetcher,
            loader,
        }
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<LoadedModel>>>, RegistryError> {
        self.entries.lock().map_err(|_| RegistryError::Poisoned)
    }

    /// Fetches and deserializes the artifact, then swaps it in under `name`.
    pub fn load(
        &self,
        name: &str,
        run_reference: &str,
        version: &str,
    ) -> Result<ModelInfo, RegistryError> {
        let bytes = self.fetcher.fetch(run_reference).inspect_err(|err| {
            warn!(model_name = name, error = %err, "Model load failed");
        })?;
        let predictor = self.loader.load(&bytes)?;
        let entry = Arc::new(LoadedModel {
            model_name: name.to_string(),
            version: version.to_string(),
            run_reference: run_reference.to_string(),
            artifact_sha256: sha256_hex(&bytes),
            loaded_at: Utc::now(),
            predictor,
            request_count: AtomicU64::new(0),
        });
        let info = entry.info();

        let previous = self.entries()?.insert(name.to_string(), entry);
        info!(
            model_name = name,
            version,
            run_reference,
            replaced = previous.as_ref().map(|p| p.version.as_str()),
            "Model loaded"
        );
        Ok(info)
    }

    pub fn predict(&self, name: &str, rows: &[Vec<f64>]) -> Result<Prediction, RegistryError> {
        let entry = self
            .entries()?
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let prediction = entry.predictor.predict(rows)?;
        let request_count = entry.request_count.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            model_name = name,
            input_rows = rows.len(),
            request_count,
            "Prediction served"
        );
        Ok(Prediction {
            prediction,
            model_name: name.to_string(),
            version: entry.version.clone(),
        })
    }

    pub fn unload(&self, name: &str) -> Result<(), RegistryError> {
        self.entries()?
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        info!(model_name = name, "Model unloaded");
        Ok(())
    }

    /// Point-in-time snapshot, sorted by name.
    pub fn list(&self) -> Result<Vec<ModelInfo>, RegistryError> {
        let mut infos: Vec<ModelInfo> = self.entries()?.values().map(|e| e.info()).collect();
        infos.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        Ok(infos)
    }

    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    #[serde(rename = "mlflow_run_id")]
    pub run_reference: String,
    pub version: String,
}

/// Promotion contract used by the deploy phase. Synchronous and slow.
pub trait ModelLoader: Send + Sync {
    fn load_model(&self, name: &str, request: &LoadRequest) -> Result<(), LoadError>;
}

impl ModelLoader for ModelRegistry {
    fn load_model(&self, name: &str, request: &LoadRequest) -> Result<(), LoadError> {
        self.load(name, &request.run_reference, &request.version)?;
        Ok(())
    }
}

/// Calls a remote model server's load endpoint.
pub struct HttpModelLoader {
    client: Client,
    base_url: String,
}

impl HttpModelLoader {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LoadError> {
        let client = Client::builder()
            .timeout(LOAD_TIMEOUT)
            .build()
            .map_err(|err| LoadError::Request(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl ModelLoader for HttpModelLoader {
    fn load_model(&self, name: &str, request: &LoadRequest) -> Result<(), LoadError> {
        let url = format!("{}/internal/load/{name}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .map_err(|err| LoadError::Request(err.to_string()))?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status().as_u16();
        Err(LoadError::Status {
            status,
            body: response.text().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_predictor_picks_highest_scoring_class() {
        let bytes = br#"{"kind":"linear","weights":[[1.0,0.0],[0.0,1.0]],"bias":[0.0,0.5],"classes":["setosa","virginica"]}"#;
        let predictor = JsonPredictorLoader.load(bytes).unwrap();
        let out = predictor
            .predict(&[vec![2.0, 1.0], vec![0.0, 0.0]])
            .unwrap();
        assert_eq!(out, vec![json!("setosa"), json!("virginica")]);
    }

    #[test]
    fn single_output_regression_returns_scalars() {
        let bytes = br#"{"kind":"linear","weights":[[2.0]],"bias":[1.0]}"#;
        let predictor = JsonPredictorLoader.load(bytes).unwrap();
        assert_eq!(predictor.predict(&[vec![3.0]]).unwrap(), vec![json!(7.0)]);
    }

    #[test]
    fn feature_count_mismatch_is_a_prediction_error() {
        let bytes = br#"{"kind":"linear","weights":[[1.0,1.0]]}"#;
        let predictor = JsonPredictorLoader.load(bytes).unwrap();
        assert!(matches!(
            predictor.predict(&[vec![1.0]]),
            Err(RegistryError::Predict(_))
        ));
    }

    #[test]
    fn mismatched_class_labels_are_rejected() {
        let bytes = br#"{"kind":"linear","weights":[[1.0]],"classes":["a","b"]}"#;
        assert!(matches!(
            JsonPredictorLoader.load(bytes),
            Err(RegistryError::Deserialize(_))
        ));
    }
}
