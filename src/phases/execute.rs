use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::ExecutionError;
use crate::notebook::Notebook;

/// Per-cell output cap, in characters.
pub const CELL_OUTPUT_LIMIT: usize = 2000;
/// Cells kept in the log excerpt.
pub const CELL_LOG_LIMIT: usize = 20;

pub const INPUT_NOTEBOOK: &str = "input.ipynb";
pub const OUTPUT_NOTEBOOK: &str = "output.ipynb";
pub const MODEL_ARTIFACT: &str = "model.json";

/// Run-scoped values injected as notebook parameters.
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    pub model_output_path: PathBuf,
    pub pipeline_id: String,
    pub tracking_uri: String,
}

impl ExecutionParams {
    pub fn pairs(&self) -> [(&'static str, String); 3] {
        [
            (
                "MODEL_OUTPUT_PATH",
                self.model_output_path.to_string_lossy().to_string(),
            ),
            ("PIPELINE_ID", self.pipeline_id.clone()),
            ("MLFLOW_TRACKING_URI", self.tracking_uri.clone()),
        ]
    }
}

/// Runs a notebook to completion, writing the executed copy to `output`.
pub trait NotebookRunner: Send + Sync {
    fn run(
        &self,
        input: &Path,
        output: &Path,
        workdir: &Path,
        params: &ExecutionParams,
    ) -> Result<(), ExecutionError>;
}

pub struct PapermillRunner {
    binary: String,
}

impl PapermillRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl NotebookRunner for PapermillRunner {
    fn run(
        &self,
        input: &Path,
        output: &Path,
        workdir: &Path,
        params: &ExecutionParams,
    ) -> Result<(), ExecutionError> {
        let mut command = Command::new(&self.binary);
        command.arg(input).arg(output);
        for (key, value) in params.pairs() {
            command.arg("-p").arg(key).arg(value);
        }
        command.arg("--cwd").arg(workdir).current_dir(workdir);
        debug!(binary = self.binary.as_str(), ?command, "Spawning notebook runner");

        let result = command.output()?;
        if result.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&result.stderr);
        Err(ExecutionError::Failed {
            status: result.status.to_string(),
            stderr: tail(&stderr, CELL_OUTPUT_LIMIT),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellLog {
    pub cell: usize,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    /// Present only when the notebook wrote its model.
    pub artifact: Option<PathBuf>,
    pub cell_logs: Vec<CellLog>,
}

/// Writes `raw` into `workdir`, runs it and collects the cell outputs.
pub fn execute_notebook(
    runner: &dyn NotebookRunner,
    workdir: &Path,
    raw: &[u8],
    pipeline_id: &str,
    tracking_uri: &str,
) -> Result<ExecutionOutput, ExecutionError> {
    let input = workdir.join(INPUT_NOTEBOOK);
    let output = workdir.join(OUTPUT_NOTEBOOK);
    let model_output_path = workdir.join(MODEL_ARTIFACT);
    fs::write(&input, raw)?;

    let params = ExecutionParams {
        model_output_path: model_output_path.clone(),
        pipeline_id: pipeline_id.to_string(),
        tracking_uri: tracking_uri.to_string(),
    };
    runner.run(&input, &output, workdir, &params)?;

    let executed = fs::read(&output)
        .map_err(|err| ExecutionError::Output(format!("{}: {err}", output.display())))?;
    let notebook = Notebook::from_slice(&executed)
        .map_err(|err| ExecutionError::Output(err.to_string()))?;

    Ok(ExecutionOutput {
        artifact: model_output_path.is_file().then_some(model_output_path),
        cell_logs: collect_cell_logs(&notebook),
    })
}

/// Text output of each code cell, indexed by position in the notebook.
pub fn collect_cell_logs(notebook: &Notebook) -> Vec<CellLog> {
    notebook
        .cells
        .iter()
        .enumerate()
        .filter(|(_, cell)| cell.cell_type == "code")
        .map(|(idx, cell)| {
            let text: String = cell.outputs.iter().filter_map(output_text).collect();
            CellLog {
                cell: idx,
                output: truncate_chars(&text, CELL_OUTPUT_LIMIT),
            }
        })
        .take(CELL_LOG_LIMIT)
        .collect()
}

pub fn cell_log_excerpt(logs: &[CellLog]) -> String {
    serde_json::to_string(logs).unwrap_or_else(|_| "[]".to_string())
}

fn output_text(output: &Value) -> Option<String> {
    if let Some(text) = output.get("text") {
        return Some(multiline(text));
    }
    output
        .get("data")
        .and_then(|data| data.get("text/plain"))
        .map(multiline)
}

fn multiline(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(lines) => lines.iter().filter_map(Value::as_str).collect(),
        _ => String::new(),
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn tail(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(limit)).collect()
}
