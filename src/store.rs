//! Authoritative SQLite record of repositories, runs, deployments and the
//! durable per-pipeline event log.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::run::{
    Metrics, ModelDeploymentRecord, PhaseEvent, PhaseRecord, PipelineRun, RepositoryDescriptor,
    RunStatus,
};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Retention of the durable phase log.
pub const EVENT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    github_url TEXT NOT NULL,
    branch TEXT NOT NULL DEFAULT 'main',
    notebook_path TEXT NOT NULL DEFAULT 'notebooks/train.ipynb',
    created_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_repositories_url ON repositories(github_url);

CREATE TABLE IF NOT EXISTS pipelines (
    id TEXT PRIMARY KEY,
    repo_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    commit_sha TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    phases TEXT NOT NULL DEFAULT '[]',
    metrics TEXT NOT NULL DEFAULT '{}',
    failure_reason TEXT,
    FOREIGN KEY (repo_id) REFERENCES repositories(id)
);
CREATE INDEX IF NOT EXISTS idx_pipelines_created ON pipelines(created_at);

CREATE TABLE IF NOT EXISTS model_deployments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_name TEXT NOT NULL,
    version TEXT NOT NULL DEFAULT '1',
    accuracy REAL NOT NULL DEFAULT 0.0,
    endpoint_url TEXT NOT NULL DEFAULT '',
    deployed_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    pipeline_id TEXT,
    FOREIGN KEY (pipeline_id) REFERENCES pipelines(id)
);
CREATE INDEX IF NOT EXISTS idx_deployments_model ON model_deployments(model_name);
CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_one_active
    ON model_deployments(model_name) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS phase_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_phase_events_pipeline ON phase_events(pipeline_id, seq);
";

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn register_repository(
        &self,
        github_url: &str,
        branch: &str,
        notebook_path: &str,
    ) -> Result<RepositoryDescriptor> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO repositories (github_url, branch, notebook_path, created_at, is_active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![github_url, branch, notebook_path, Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        info!(repo_id = id, github_url, branch, "Repository registered");
        Ok(RepositoryDescriptor {
            id,
            github_url: github_url.to_string(),
            branch: branch.to_string(),
            notebook_path: notebook_path.to_string(),
            is_active: true,
        })
    }

    pub fn get_repository(&self, id: i64) -> Result<RepositoryDescriptor> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id, github_url, branch, notebook_path, is_active FROM repositories WHERE id = ?1",
            [id],
            repository_from_row,
        )
        .optional()?
        .ok_or(StoreError::RepositoryNotFound(id))
    }

    /// Active repositories registered under exactly this URL.
    pub fn find_repositories_by_url(&self, github_url: &str) -> Result<Vec<RepositoryDescriptor>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, github_url, branch, notebook_path, is_active FROM repositories
             WHERE github_url = ?1 AND is_active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([github_url], repository_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Every call yields a fresh id, even for a commit seen before.
    pub fn create_run(&self, repo_id: i64, commit_sha: &str) -> Result<PipelineRun> {
        let run = PipelineRun::queued(Uuid::new_v4().to_string(), repo_id, commit_sha);
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pipelines (id, repo_id, status, commit_sha, created_at, phases, metrics)
             VALUES (?1, ?2, ?3, ?4, ?5, '[]', '{}')",
            params![
                run.id,
                run.repo_id,
                run.status.as_str(),
                run.commit_sha,
                Utc::now().to_rfc3339()
            ],
        )?;
        debug!(pipeline_id = run.id.as_str(), repo_id, "Pipeline run created");
        Ok(run)
    }

    pub fn get_run(&self, id: &str) -> Result<PipelineRun> {
        let conn = self.lock_conn()?;
        let raw = conn
            .query_row(
                "SELECT id, repo_id, status, commit_sha, started_at, finished_at, phases, metrics,
                        failure_reason
                 FROM pipelines WHERE id = ?1",
                [id],
                RawRun::from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::PipelineNotFound(id.to_string()))?;
        raw.into_run()
    }

    /// Newest first; `page` starts at 1.
    pub fn list_runs(&self, page: u32, size: u32) -> Result<(Vec<PipelineRun>, u64)> {
        let conn = self.lock_conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM pipelines", [], |row| row.get(0))?;
        let offset = i64::from(page.max(1) - 1) * i64::from(size);
        let mut stmt = conn.prepare(
            "SELECT id, repo_id, status, commit_sha, started_at, finished_at, phases, metrics,
                    failure_reason
             FROM pipelines ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2",
        )?;
        let raws = stmt
            .query_map(params![i64::from(size), offset], RawRun::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let runs = raws
            .into_iter()
            .map(RawRun::into_run)
            .collect::<Result<Vec<_>>>()?;
        Ok((runs, total.max(0) as u64))
    }

    /// Writes the full record, phase list included. Refuses to touch a run
    /// that is already terminal.
    pub fn save_run(&self, run: &PipelineRun) -> Result<()> {
        let phases = serde_json::to_string(&run.phases)?;
        let metrics = serde_json::to_string(&run.metrics)?;
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE pipelines
             SET status = ?2, started_at = ?3, finished_at = ?4, phases = ?5, metrics = ?6,
                 failure_reason = ?7
             WHERE id = ?1 AND status IN ('queued', 'running')",
            params![
                run.id,
                run.status.as_str(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.finished_at.map(|t| t.to_rfc3339()),
                phases,
                metrics,
                run.failure_reason,
            ],
        )?;
        if changed == 0 {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM pipelines WHERE id = ?1)",
                [&run.id],
                |row| row.get(0),
            )?;
            return Err(if exists {
                StoreError::Terminal(run.id.clone())
            } else {
                StoreError::PipelineNotFound(run.id.clone())
            });
        }
        Ok(())
    }

    /// Deactivates every active deployment of the model and inserts the new
    /// active one in a single write transaction.
    pub fn promote(&self, record: &ModelDeploymentRecord) -> Result<ModelDeploymentRecord> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deactivated = tx.execute(
            "UPDATE model_deployments SET is_active = 0 WHERE model_name = ?1 AND is_active = 1",
            [&record.model_name],
        )?;
        tx.execute(
            "INSERT INTO model_deployments
                (model_name, version, accuracy, endpoint_url, deployed_at, is_active, pipeline_id)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![
                record.model_name,
                record.version,
                record.accuracy,
                record.endpoint_url,
                record.deployed_at.to_rfc3339(),
                record.pipeline_id,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        info!(
            model_name = record.model_name.as_str(),
            version = record.version.as_str(),
            deactivated,
            "Deployment promoted"
        );
        Ok(ModelDeploymentRecord {
            id: Some(id),
            is_active: true,
            ..record.clone()
        })
    }

    pub fn active_deployment(&self, model_name: &str) -> Result<Option<ModelDeploymentRecord>> {
        let conn = self.lock_conn()?;
        let raw = conn
            .query_row(
                "SELECT id, model_name, version, accuracy, endpoint_url, deployed_at, is_active,
                        pipeline_id
                 FROM model_deployments WHERE model_name = ?1 AND is_active = 1",
                [model_name],
                RawDeployment::from_row,
            )
            .optional()?;
        raw.map(RawDeployment::into_record).transpose()
    }

    /// All deployments of the model, oldest first.
    pub fn deployments(&self, model_name: &str) -> Result<Vec<ModelDeploymentRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, model_name, version, accuracy, endpoint_url, deployed_at, is_active,
                    pipeline_id
             FROM model_deployments WHERE model_name = ?1 ORDER BY id",
        )?;
        let raws = stmt
            .query_map([model_name], RawDeployment::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawDeployment::into_record).collect()
    }

    pub fn append_event(&self, event: &PhaseEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let expires_at = Utc::now().timestamp() + EVENT_RETENTION.as_secs() as i64;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO phase_events (pipeline_id, payload, expires_at) VALUES (?1, ?2, ?3)",
            params![event.pipeline_id, payload, expires_at],
        )?;
        Ok(())
    }

    /// Unexpired events for the pipeline in append order.
    pub fn events(&self, pipeline_id: &str) -> Result<Vec<PhaseEvent>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM phase_events
             WHERE pipeline_id = ?1 AND expires_at > ?2 ORDER BY seq",
        )?;
        let payloads = stmt
            .query_map(params![pipeline_id, Utc::now().timestamp()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(StoreError::from))
            .collect()
    }

    pub fn purge_expired_events(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM phase_events WHERE expires_at <= ?1",
            [Utc::now().timestamp()],
        )?;
        if removed > 0 {
            debug!(removed, "Expired phase events purged");
        }
        Ok(removed)
    }

    #[cfg(test)]
    fn expire_events_for(&self, pipeline_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE phase_events SET expires_at = 0 WHERE pipeline_id = ?1",
            [pipeline_id],
        )?;
        Ok(())
    }
}

fn repository_from_row(row: &Row<'_>) -> rusqlite::Result<RepositoryDescriptor> {
    Ok(RepositoryDescriptor {
        id: row.get(0)?,
        github_url: row.get(1)?,
        branch: row.get(2)?,
        notebook_path: row.get(3)?,
        is_active: row.get(4)?,
    })
}

fn parse_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(StoreError::from)
        })
        .transpose()
}

struct RawRun {
    id: String,
    repo_id: i64,
    status: String,
    commit_sha: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    phases: String,
    metrics: String,
    failure_reason: Option<String>,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo_id: row.get(1)?,
            status: row.get(2)?,
            commit_sha: row.get(3)?,
            started_at: row.get(4)?,
            finished_at: row.get(5)?,
            phases: row.get(6)?,
            metrics: row.get(7)?,
            failure_reason: row.get(8)?,
        })
    }

    fn into_run(self) -> Result<PipelineRun> {
        let phases: Vec<PhaseRecord> = serde_json::from_str(&self.phases)?;
        let metrics: Metrics = serde_json::from_str(&self.metrics)?;
        // Unknown status text only appears if the table was edited by hand.
        let status = RunStatus::parse(&self.status).unwrap_or(RunStatus::Failed);
        Ok(PipelineRun {
            id: self.id,
            repo_id: self.repo_id,
            status,
            commit_sha: self.commit_sha,
            started_at: parse_timestamp(self.started_at)?,
            finished_at: parse_timestamp(self.finished_at)?,
            phases,
            metrics,
            failure_reason: self.failure_reason,
        })
    }
}

struct RawDeployment {
    id: i64,
    model_name: String,
    version: String,
    accuracy: f64,
    endpoint_url: String,
    deployed_at: String,
    is_active: bool,
    pipeline_id: Option<String>,
}

impl RawDeployment {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            model_name: row.get(1)?,
            version: row.get(2)?,
            accuracy: row.get(3)?,
            endpoint_url: row.get(4)?,
            deployed_at: row.get(5)?,
            is_active: row.get(6)?,
            pipeline_id: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<ModelDeploymentRecord> {
        let deployed_at = DateTime::parse_from_rfc3339(&self.deployed_at)?.with_timezone(&Utc);
        Ok(ModelDeploymentRecord {
            id: Some(self.id),
            model_name: self.model_name,
            version: self.version,
            accuracy: self.accuracy,
            endpoint_url: self.endpoint_url,
            deployed_at,
            is_active: self.is_active,
            pipeline_id: self.pipeline_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::PhaseEvent;

    #[test]
    fn expired_events_are_hidden_and_purged() {
        let store = Store::open_in_memory().unwrap();
        let repo = store
            .register_repository("https://github.com/acme/models", "main", "train.ipynb")
            .unwrap();
        let run = store.create_run(repo.id, "abc").unwrap();
        store
            .append_event(&PhaseEvent::new(&run.id, "download", "running", ""))
            .unwrap();
        assert_eq!(store.events(&run.id).unwrap().len(), 1);

        store.expire_events_for(&run.id).unwrap();
        assert!(store.events(&run.id).unwrap().is_empty());
        assert_eq!(store.purge_expired_events().unwrap(), 1);
    }

    #[test]
    fn terminal_runs_reject_updates() {
        let store = Store::open_in_memory().unwrap();
        let repo = store
            .register_repository("https://github.com/acme/models", "main", "train.ipynb")
            .unwrap();
        let mut run = store.create_run(repo.id, "abc").unwrap();
        run.status = RunStatus::Failed;
        store.save_run(&run).unwrap();

        run.status = RunStatus::Success;
        assert!(matches!(
            store.save_run(&run),
            Err(StoreError::Terminal(_))
        ));
        assert_eq!(store.get_run(&run.id).unwrap().status, RunStatus::Failed);
    }
}
