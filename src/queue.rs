//! FIFO job queue drained by a fixed pool of worker threads.
//!
//! A job whose pipeline id is already being processed is parked until that
//! worker finishes, so one id never runs on two workers at once.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{debug, error, info, warn};

use crate::error::{FailureClass, StoreError};
use crate::pipeline::{Attempt, PipelineEngine, RunOutcome, SHUTDOWN_REASON, ShutdownSignal};

/// Total attempts per run: the first plus one automatic retry.
pub const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub pipeline_id: String,
    pub repo_id: i64,
    pub commit_sha: String,
    pub attempt: u32,
}

impl Job {
    pub fn new(pipeline_id: impl Into<String>, repo_id: i64, commit_sha: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            repo_id,
            commit_sha: commit_sha.into(),
            attempt: 1,
        }
    }
}

/// Where the trigger gateway hands off new runs.
pub trait JobSink: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    in_flight: HashSet<String>,
    closed: bool,
}

impl QueueState {
    /// Promotes due retries, then takes the first job whose id is idle.
    fn take_next(&mut self, now: Instant) -> Option<Job> {
        let mut due = Vec::new();
        self.delayed.retain(|(at, job)| {
            if *at <= now {
                due.push(job.clone());
                false
            } else {
                true
            }
        });
        self.ready.extend(due);

        let position = self
            .ready
            .iter()
            .position(|job| !self.in_flight.contains(&job.pipeline_id))?;
        let job = self.ready.remove(position)?;
        self.in_flight.insert(job.pipeline_id.clone());
        Some(job)
    }

    fn next_wakeup(&self, now: Instant) -> Option<Duration> {
        self.delayed
            .iter()
            .map(|(at, _)| at.saturating_duration_since(now))
            .min()
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty() && self.in_flight.is_empty()
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    settled: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("Task queue lock poisoned"))
    }
}

pub struct TaskQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    shutdown: ShutdownSignal,
    engine: Arc<PipelineEngine>,
}

impl TaskQueue {
    /// Starts `worker_count` workers (at least one) sharing `engine`.
    pub fn start(engine: Arc<PipelineEngine>, worker_count: usize, retry_delay: Duration) -> Self {
        let shared = Arc::new(Shared::default());
        let shutdown = engine.shutdown_signal();
        let workers = (0..worker_count.max(1))
            .map(|index| {
                let shared = shared.clone();
                let engine = engine.clone();
                std::thread::Builder::new()
                    .name(format!("pipeline-worker-{index}"))
                    .spawn(move || worker_loop(index, &shared, &engine, retry_delay))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    error!(error = %err, "Failed to spawn pipeline worker");
                    None
                }
            })
            .collect::<Vec<_>>();
        info!(workers = workers.len(), "Task queue started");
        Self {
            shared,
            workers,
            shutdown,
            engine,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn pending(&self) -> usize {
        self.shared
            .lock()
            .map(|state| state.ready.len() + state.delayed.len())
            .unwrap_or(0)
    }

    /// Blocks until nothing is queued, delayed or running, or `timeout` passes.
    /// Returns whether the queue drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.shared.lock() else {
            return false;
        };
        while !state.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.settled.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
        true
    }

    /// Raises the cooperative stop flag and joins the workers. A run in the
    /// middle of a phase finishes that phase first; runs still waiting in the
    /// queue are failed as interrupted.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.trigger();
        if let Ok(mut state) = self.shared.lock() {
            state.closed = true;
        }
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Pipeline worker panicked");
            }
        }
        let leftover: Vec<Job> = match self.shared.lock() {
            Ok(mut state) => {
                let delayed = state.delayed.drain(..).map(|(_, job)| job).collect::<Vec<_>>();
                state.ready.drain(..).chain(delayed).collect()
            }
            Err(err) => {
                error!(error = %err, "Cannot drain task queue");
                Vec::new()
            }
        };
        for job in &leftover {
            fail_job(&self.engine, job, SHUTDOWN_REASON, FailureClass::Interrupted);
        }
        self.shared.settled.notify_all();
    }
}

impl JobSink for TaskQueue {
    fn enqueue(&self, job: Job) -> Result<()> {
        let mut state = self.shared.lock()?;
        if state.closed {
            return Err(anyhow!("Task queue is shut down"));
        }
        debug!(pipeline_id = job.pipeline_id.as_str(), attempt = job.attempt, "Job enqueued");
        state.ready.push_back(job);
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}

fn worker_loop(index: usize, shared: &Shared, engine: &PipelineEngine, retry_delay: Duration) {
    while let Some(job) = next_job(shared) {
        let retry = process(engine, &job);
        let Ok(mut state) = shared.lock() else {
            error!(worker = index, "Task queue lock poisoned; worker exiting");
            return;
        };
        state.in_flight.remove(&job.pipeline_id);
        let closed = state.closed;
        if retry && !closed {
            state.delayed.push((
                Instant::now() + retry_delay,
                Job {
                    attempt: job.attempt + 1,
                    ..job.clone()
                },
            ));
        }
        drop(state);
        if retry && closed {
            fail_job(engine, &job, SHUTDOWN_REASON, FailureClass::Interrupted);
        }
        shared.available.notify_all();
        shared.settled.notify_all();
    }
    debug!(worker = index, "Pipeline worker stopped");
}

fn next_job(shared: &Shared) -> Option<Job> {
    let mut state = shared.lock().ok()?;
    loop {
        if state.closed {
            return None;
        }
        let now = Instant::now();
        if let Some(job) = state.take_next(now) {
            return Some(job);
        }
        state = match state.next_wakeup(now) {
            Some(wait) => shared.available.wait_timeout(state, wait).ok()?.0,
            None => shared.available.wait(state).ok()?,
        };
    }
}

/// Runs one job; true when the engine asked for a retry.
fn process(engine: &PipelineEngine, job: &Job) -> bool {
    let repository = match engine.store().get_repository(job.repo_id) {
        Ok(repository) => repository,
        Err(err) => {
            error!(pipeline_id = job.pipeline_id.as_str(), error = %err, "Cannot resolve repository");
            let class = match &err {
                StoreError::RepositoryNotFound(_) => FailureClass::Contract,
                _ => FailureClass::Transient,
            };
            fail_job(engine, job, &err.to_string(), class);
            return false;
        }
    };
    let attempt = Attempt {
        number: job.attempt,
        max: MAX_ATTEMPTS,
    };
    match engine.execute(&job.pipeline_id, &repository, &job.commit_sha, attempt) {
        Ok(RunOutcome::RetryScheduled { .. }) => true,
        Ok(outcome) => {
            debug!(pipeline_id = job.pipeline_id.as_str(), status = %outcome.status(), "Job finished");
            false
        }
        Err(err) => {
            warn!(pipeline_id = job.pipeline_id.as_str(), error = %err, "Job could not start");
            fail_job(engine, job, &err.to_string(), FailureClass::Transient);
            false
        }
    }
}

/// Moves a job's run to `failed` so it never lingers as `queued`.
fn fail_job(engine: &PipelineEngine, job: &Job, reason: &str, class: FailureClass) {
    match engine.abandon(&job.pipeline_id, reason, class) {
        Ok(_) => {}
        Err(StoreError::Terminal(_)) => {
            debug!(pipeline_id = job.pipeline_id.as_str(), "Run already finished");
        }
        Err(err) => {
            error!(pipeline_id = job.pipeline_id.as_str(), error = %err, "Failed to mark run failed");
        }
    }
}
