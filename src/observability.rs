use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::run::{PhaseName, RunStatus};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub phases: BTreeMap<String, PhaseMetrics>,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_retried: u64,
    pub deployments: u64,
    pub deploys_skipped: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct PhaseMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Process-wide counters shared by workers. Cheap to clone.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_phase(&self, phase: PhaseName) -> PhaseTimer {
        PhaseTimer {
            phase,
            started_at: Instant::now(),
            collector: self.inner.clone(),
            failed: false,
            recorded: false,
        }
    }

    pub fn record_run(&self, status: RunStatus) {
        if let Ok(mut guard) = self.inner.lock() {
            match status {
                RunStatus::Success => guard.runs_succeeded += 1,
                RunStatus::Failed => guard.runs_failed += 1,
                RunStatus::Queued | RunStatus::Running => {}
            }
        }
    }

    pub fn record_retry(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.runs_retried += 1;
        }
    }

    pub fn record_deployment(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.deployments += 1;
        }
    }

    pub fn record_deploy_skipped(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.deploys_skipped += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct PhaseTimer {
    phase: PhaseName,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
    recorded: bool,
}

impl PhaseTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.phases.entry(self.phase.to_string()).or_default();
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            phase = self.phase.as_str(),
            duration_ms,
            failed = self.failed,
            "Phase duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        runs_succeeded = snapshot.runs_succeeded,
        runs_failed = snapshot.runs_failed,
        runs_retried = snapshot.runs_retried,
        deployments = snapshot.deployments,
        deploys_skipped = snapshot.deploys_skipped,
        "Pipeline metrics summary"
    );
    for (phase, metrics) in &snapshot.phases {
        info!(
            phase = phase.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Phase metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP mlops_runs_total Finished pipeline runs by status\n");
        output.push_str("# TYPE mlops_runs_total counter\n");
        output.push_str(&format!(
            "mlops_runs_total{{status=\"success\"}} {}\n",
            self.runs_succeeded
        ));
        output.push_str(&format!(
            "mlops_runs_total{{status=\"failed\"}} {}\n",
            self.runs_failed
        ));
        output.push_str("# HELP mlops_run_retries_total Whole-run retries scheduled\n");
        output.push_str("# TYPE mlops_run_retries_total counter\n");
        output.push_str(&format!("mlops_run_retries_total {}\n", self.runs_retried));
        output.push_str("# HELP mlops_deployments_total Models promoted to serving\n");
        output.push_str("# TYPE mlops_deployments_total counter\n");
        output.push_str(&format!("mlops_deployments_total {}\n", self.deployments));
        output.push_str("# HELP mlops_deploys_skipped_total Deploys skipped by policy\n");
        output.push_str("# TYPE mlops_deploys_skipped_total counter\n");
        output.push_str(&format!(
            "mlops_deploys_skipped_total {}\n",
            self.deploys_skipped
        ));
        output.push_str("# HELP mlops_phase_calls_total Phase invocation count\n");
        output.push_str("# TYPE mlops_phase_calls_total counter\n");
        output.push_str("# HELP mlops_phase_failures_total Phase failure count\n");
        output.push_str("# TYPE mlops_phase_failures_total counter\n");
        output.push_str(
            "# HELP mlops_phase_duration_seconds_total Accumulated phase duration in seconds\n",
        );
        output.push_str("# TYPE mlops_phase_duration_seconds_total counter\n");
        output.push_str("# HELP mlops_phase_duration_seconds_max Maximum phase duration in seconds\n");
        output.push_str("# TYPE mlops_phase_duration_seconds_max gauge\n");
        for (phase, metrics) in &self.phases {
            output.push_str(&format!(
                "mlops_phase_calls_total{{phase=\"{}\"}} {}\n",
                phase, metrics.calls
            ));
            output.push_str(&format!(
                "mlops_phase_failures_total{{phase=\"{}\"}} {}\n",
                phase, metrics.failures
            ));
            output.push_str(&format!(
                "mlops_phase_duration_seconds_total{{phase=\"{}\"}} {:.6}\n",
                phase,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "mlops_phase_duration_seconds_max{{phase=\"{}\"}} {:.6}\n",
                phase,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output
    }
}
