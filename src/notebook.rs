//! Notebook document model and the tagged-section contract.
//!
//! A notebook qualifies for the pipeline when it carries one cell tagged with
//! each of [`REQUIRED_TAGS`]. Model identity is read from the first
//! `mlops:config` cell by scanning its source for literal assignments; the
//! source is never executed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::error::ContractError;

pub const CONFIG_TAG: &str = "mlops:config";
pub const PREPROCESSING_TAG: &str = "mlops:preprocessing";
pub const TRAINING_TAG: &str = "mlops:training";
pub const EXPORT_TAG: &str = "mlops:export";

pub const REQUIRED_TAGS: [&str; 4] = [CONFIG_TAG, PREPROCESSING_TAG, TRAINING_TAG, EXPORT_TAG];

pub const DEFAULT_MODEL_NAME: &str = "default-model";
pub const DEFAULT_MODEL_VERSION: &str = "1";

static MODEL_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"MODEL_NAME\s*=\s*['"]([^'"]+)['"]"#).expect("valid regex"));
static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"VERSION\s*=\s*['"]([^'"]+)['"]"#).expect("valid regex"));

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Notebook {
    #[serde(default)]
    pub cells: Vec<Cell>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Cell {
    #[serde(default)]
    pub cell_type: String,
    #[serde(default)]
    pub source: CellSource,
    #[serde(default)]
    pub metadata: CellMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Value>,
}

/// nbformat allows the source as one string or as a list of lines.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CellSource {
    Text(String),
    Lines(Vec<String>),
}

impl Default for CellSource {
    fn default() -> Self {
        CellSource::Text(String::new())
    }
}

impl CellSource {
    pub fn text(&self) -> String {
        match self {
            CellSource::Text(text) => text.clone(),
            CellSource::Lines(lines) => lines.concat(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CellMetadata {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cell {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.iter().any(|t| t == tag)
    }
}

impl Notebook {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ContractError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn cells_by_tag(&self, tag: &str) -> Vec<&Cell> {
        self.cells.iter().filter(|cell| cell.has_tag(tag)).collect()
    }
}

/// Model identity declared by the config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelIdentity {
    pub model_name: String,
    pub version: String,
}

impl Default for ModelIdentity {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            version: DEFAULT_MODEL_VERSION.to_string(),
        }
    }
}

/// Fails with every missing tag, in the order of [`REQUIRED_TAGS`].
pub fn validate_required_sections(notebook: &Notebook) -> Result<(), ContractError> {
    let missing: Vec<String> = REQUIRED_TAGS
        .iter()
        .filter(|tag| notebook.cells_by_tag(tag).is_empty())
        .map(|tag| tag.to_string())
        .collect();

    if !missing.is_empty() {
        error!(missing_tags = ?missing, "Notebook validation failed");
        return Err(ContractError::MissingTags { missing });
    }

    info!("Notebook validation passed");
    Ok(())
}

/// Scans the first config cell. Absent fields fall back to the defaults.
pub fn extract_config(notebook: &Notebook) -> ModelIdentity {
    let mut identity = ModelIdentity::default();
    let Some(cell) = notebook.cells_by_tag(CONFIG_TAG).into_iter().next() else {
        return identity;
    };

    let source = cell.source.text();
    if let Some(captures) = MODEL_NAME_PATTERN.captures(&source) {
        identity.model_name = captures[1].to_string();
    }
    if let Some(captures) = VERSION_PATTERN.captures(&source) {
        identity.version = captures[1].to_string();
    }

    info!(
        model_name = identity.model_name.as_str(),
        version = identity.version.as_str(),
        "Notebook config extracted"
    );
    identity
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notebook(cells: Value) -> Notebook {
        serde_json::from_value(json!({ "cells": cells, "nbformat": 4 })).unwrap()
    }

    #[test]
    fn source_lines_are_joined() {
        let nb = notebook(json!([{
            "cell_type": "code",
            "metadata": {"tags": ["mlops:config"]},
            "source": ["MODEL_NAME = 'a'\n", "VERSION = \"7\"\n"]
        }]));
        assert_eq!(
            extract_config(&nb),
            ModelIdentity {
                model_name: "a".into(),
                version: "7".into()
            }
        );
    }

    #[test]
    fn version_scan_takes_the_earliest_assignment() {
        let nb = notebook(json!([{
            "cell_type": "code",
            "metadata": {"tags": ["mlops:config"]},
            "source": "MODEL_VERSION = \"9\"\nMODEL_NAME = \"x\"\nVERSION = \"2\""
        }]));
        let identity = extract_config(&nb);
        assert_eq!(identity.model_name, "x");
        assert_eq!(identity.version, "9");
    }

    #[test]
    fn tag_match_is_exact() {
        let nb = notebook(json!([{
            "cell_type": "code",
            "metadata": {"tags": ["mlops:configs", "MLOPS:CONFIG"]},
            "source": ""
        }]));
        assert!(nb.cells_by_tag(CONFIG_TAG).is_empty());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let nb = notebook(json!([]));
        let value = serde_json::to_value(&nb).unwrap();
        assert_eq!(value["nbformat"], json!(4));
    }
}
