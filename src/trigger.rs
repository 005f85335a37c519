use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::queue::{Job, JobSink};
use crate::run::RunStatus;
use crate::store::Store;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub repository: PushRepository,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushRepository {
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushCommit {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

impl PushPayload {
    pub fn branch(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.git_ref)
    }

    pub fn touches_notebook(&self) -> bool {
        self.commits
            .iter()
            .flat_map(|commit| commit.added.iter().chain(&commit.modified))
            .any(|path| path.ends_with(".ipynb"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TriggerDecision {
    /// Not a push; acknowledged and dropped.
    Ignored { event: String },
    NoMatchingRepository { url: String },
    /// Push matched a repository but does not warrant a run.
    Skipped { reason: String },
    Queued { pipeline_id: String, repo_id: i64 },
}

/// Maps inbound repository events to queued runs.
pub struct TriggerGateway {
    store: Store,
    sink: Arc<dyn JobSink>,
}

impl TriggerGateway {
    pub fn new(store: Store, sink: Arc<dyn JobSink>) -> Self {
        Self { store, sink }
    }

    pub fn handle(&self, event_type: &str, payload: &[u8]) -> Result<TriggerDecision> {
        if event_type != "push" {
            info!(event_type, "Ignoring non-push event");
            return Ok(TriggerDecision::Ignored {
                event: event_type.to_string(),
            });
        }
        let payload: PushPayload =
            serde_json::from_slice(payload).context("Malformed push payload")?;
        self.handle_push(&payload)
    }

    pub fn handle_push(&self, payload: &PushPayload) -> Result<TriggerDecision> {
        let url = payload.repository.html_url.as_str();
        let branch = payload.branch();
        info!(repo_url = url, branch, commit_sha = payload.after.as_str(), "Push received");

        let mut candidates = self.store.find_repositories_by_url(url)?;
        if candidates.is_empty() {
            candidates = self.store.find_repositories_by_url(&format!("{url}.git"))?;
        }
        let Some(repository) = candidates.into_iter().next() else {
            info!(repo_url = url, "No registered repository matches push");
            return Ok(TriggerDecision::NoMatchingRepository {
                url: url.to_string(),
            });
        };

        if repository.branch != branch {
            return Ok(TriggerDecision::Skipped {
                reason: format!(
                    "Push to branch '{branch}' ignored (monitoring '{}')",
                    repository.branch
                ),
            });
        }
        if !payload.touches_notebook() {
            return Ok(TriggerDecision::Skipped {
                reason: "No notebook files modified in this push".to_string(),
            });
        }

        let mut run = self.store.create_run(repository.id, &payload.after)?;
        if let Err(err) = self
            .sink
            .enqueue(Job::new(run.id.clone(), repository.id, payload.after.clone()))
        {
            // A run no worker will pick up must not stay queued.
            run.status = RunStatus::Failed;
            run.finished_at = Some(Utc::now());
            run.failure_reason = Some(format!("Failed to enqueue: {err:#}"));
            if let Err(save_err) = self.store.save_run(&run) {
                warn!(pipeline_id = run.id.as_str(), error = %save_err, "Failed to mark unqueued run");
            }
            return Err(err.context(format!("Failed to enqueue pipeline {}", run.id)));
        }
        info!(pipeline_id = run.id.as_str(), repo_id = repository.id, "Pipeline queued");
        Ok(TriggerDecision::Queued {
            pipeline_id: run.id,
            repo_id: repository.id,
        })
    }
}
