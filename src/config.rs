use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::phases::DeployPolicy;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub github_token: String,
    pub github_api_url: String,
    pub mlflow_tracking_uri: String,
    pub model_server_url: String,
    pub database_path: PathBuf,
    pub models_base_path: PathBuf,
    pub auto_deploy_on_success: bool,
    pub min_accuracy_threshold: f64,
    pub worker_count: usize,
    pub retry_delay_secs: u64,
    pub papermill_bin: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            github_token: String::new(),
            github_api_url: "https://api.github.com".to_string(),
            mlflow_tracking_uri: "http://mlflow:5000".to_string(),
            model_server_url: "http://model-server:8001".to_string(),
            database_path: PathBuf::from("./mlops.db"),
            models_base_path: PathBuf::from("/app/models"),
            auto_deploy_on_success: true,
            min_accuracy_threshold: 0.70,
            worker_count: 2,
            retry_delay_secs: 30,
            papermill_bin: "papermill".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then the optional YAML file, then process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        Ok(settings)
    }

    /// Overrides fields from `lookup`, keyed by upper-case variable name.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("GITHUB_TOKEN") {
            self.github_token = value;
        }
        if let Some(value) = lookup("GITHUB_API_URL") {
            self.github_api_url = value;
        }
        if let Some(value) = lookup("MLFLOW_TRACKING_URI") {
            self.mlflow_tracking_uri = value;
        }
        if let Some(value) = lookup("MODEL_SERVER_URL") {
            self.model_server_url = value;
        }
        if let Some(value) = lookup("DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("MODELS_BASE_PATH") {
            self.models_base_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("AUTO_DEPLOY_ON_SUCCESS") {
            self.auto_deploy_on_success = parse_bool(&value)
                .with_context(|| format!("AUTO_DEPLOY_ON_SUCCESS={value}"))?;
        }
        if let Some(value) = lookup("MIN_ACCURACY_THRESHOLD") {
            self.min_accuracy_threshold = value
                .trim()
                .parse()
                .with_context(|| format!("MIN_ACCURACY_THRESHOLD={value}"))?;
        }
        if let Some(value) = lookup("WORKER_COUNT") {
            self.worker_count = value
                .trim()
                .parse()
                .with_context(|| format!("WORKER_COUNT={value}"))?;
        }
        if let Some(value) = lookup("RETRY_DELAY_SECS") {
            self.retry_delay_secs = value
                .trim()
                .parse()
                .with_context(|| format!("RETRY_DELAY_SECS={value}"))?;
        }
        if let Some(value) = lookup("PAPERMILL_BIN") {
            self.papermill_bin = value;
        }
        Ok(())
    }

    pub fn deploy_policy(&self) -> DeployPolicy {
        DeployPolicy {
            enabled: self.auto_deploy_on_success,
            min_accuracy: self.min_accuracy_threshold,
            model_server_url: self.model_server_url.clone(),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_values_fill_gaps_with_defaults() {
        let settings: Settings =
            serde_yaml::from_str("min_accuracy_threshold: 0.9\nworker_count: 4\n").unwrap();
        assert_eq!(settings.min_accuracy_threshold, 0.9);
        assert_eq!(settings.worker_count, 4);
        assert_eq!(settings.mlflow_tracking_uri, "http://mlflow:5000");
        assert!(settings.auto_deploy_on_success);
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("AUTO_DEPLOY_ON_SUCCESS", "false"),
            ("MIN_ACCURACY_THRESHOLD", "0.85"),
            ("MODEL_SERVER_URL", "http://localhost:9000"),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::default();
        settings
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        let policy = settings.deploy_policy();
        assert!(!policy.enabled);
        assert_eq!(policy.min_accuracy, 0.85);
        assert_eq!(policy.model_server_url, "http://localhost:9000");
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(|key| (key == "WORKER_COUNT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("WORKER_COUNT"));
    }
}
