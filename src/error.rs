use thiserror::Error;

use crate::notebook::REQUIRED_TAGS;

/// Notebook contract violations. Never retried.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error(
        "Notebook is missing required MLOps tags: {}. Each section must carry the matching tag in metadata.tags. Required tags: {}",
        .missing.join(", "),
        REQUIRED_TAGS.join(", ")
    )]
    MissingTags { missing: Vec<String> },
    #[error("Notebook is not valid JSON: {0}")]
    Unparsable(#[from] serde_json::Error),
    #[error("Unsupported repository URL '{0}': expected https://github.com/<owner>/<repo>")]
    InvalidRepositoryUrl(String),
}

impl ContractError {
    pub fn missing_tags(&self) -> &[String] {
        match self {
            ContractError::MissingTags { missing } => missing,
            _ => &[],
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Notebook '{path}' not found on branch '{branch}'")]
    NotFound { path: String, branch: String },
    #[error("Notebook source rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },
    #[error("Notebook download failed: {0}")]
    Network(String),
    #[error("Notebook payload could not be decoded: {0}")]
    Decode(String),
    #[error(transparent)]
    Contract(#[from] ContractError),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to prepare working directory: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("Notebook execution failed (exit status {status}): {stderr}")]
    Failed { status: String, stderr: String },
    #[error("Executed notebook could not be read: {0}")]
    Output(String),
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Tracker request '{endpoint}' failed: {message}")]
    Request { endpoint: String, message: String },
    #[error("Tracker returned HTTP {status} for '{endpoint}': {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("Failed to read artifact '{path}': {source}")]
    Artifact {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Model server request failed: {0}")]
    Request(String),
    #[error("Model server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Model '{0}' is not loaded.")]
    NotFound(String),
    #[error("Artifact for run '{run}' unavailable: {message}")]
    Artifact { run: String, message: String },
    #[error("Failed to deserialize predictor: {0}")]
    Deserialize(String),
    #[error("Prediction failed: {0}")]
    Predict(String),
    #[error("Model registry lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Stored record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Pipeline {0} not found.")]
    PipelineNotFound(String),
    #[error("Repository {0} not found.")]
    RepositoryNotFound(i64),
    #[error("Pipeline {id} is '{status}', expected 'queued'")]
    NotQueued { id: String, status: String },
    #[error("Pipeline {0} already finished; terminal runs are immutable")]
    Terminal(String),
    #[error("Stored timestamp is invalid: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("Store lock poisoned")]
    Poisoned,
}

/// How a phase failure should be treated by the queue layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Broken notebook or source reference. Terminal, no retry.
    Contract,
    /// Network or backend outage. Eligible for one whole-run retry.
    Transient,
    /// Operator shutdown. Terminal, no retry.
    Interrupted,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::Transient)
    }
}

impl From<&SourceError> for FailureClass {
    fn from(err: &SourceError) -> Self {
        match err {
            SourceError::Network(_) => FailureClass::Transient,
            SourceError::Contract(_)
            | SourceError::NotFound { .. }
            | SourceError::Unauthorized { .. }
            | SourceError::Decode(_) => FailureClass::Contract,
        }
    }
}

impl From<&ExecutionError> for FailureClass {
    fn from(err: &ExecutionError) -> Self {
        match err {
            // A notebook that raises is a content problem, not an outage.
            ExecutionError::Failed { .. } => FailureClass::Contract,
            ExecutionError::Workspace(_) | ExecutionError::Output(_) => FailureClass::Transient,
        }
    }
}
