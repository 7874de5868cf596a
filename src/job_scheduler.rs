//! Per-agent job scheduler.
//!
//! Jobs are admitted into a bounded pending queue and started on a fixed tick,
//! highest priority first and FIFO within a priority. Started jobs are never
//! preempted. The job table, the pending queue and the running set live behind
//! one mutex so submission, the tick and cancellation cannot interleave.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{FleetError, Result};
use crate::executor::{Executor, ProgressReporter};
use crate::models::{FailureKind, Job, JobCounts, JobResult, JobState, JobView, Priority, SchedulerStats, Workload};

#[derive(Debug, Clone)]
pub struct SchedulerLimits {
  pub max_concurrent_jobs: usize,
  pub max_queued_jobs: usize,
  pub tick_interval: Duration,
  pub job_retention: Option<Duration>,
}

impl Default for SchedulerLimits {
  fn default() -> Self {
    Self::from(&Config::default())
  }
}

impl From<&Config> for SchedulerLimits {
  fn from(config: &Config) -> Self {
    Self {
      max_concurrent_jobs: config.max_concurrent_jobs,
      max_queued_jobs: config.max_queued_jobs,
      tick_interval: config.scheduler_tick,
      job_retention: config.job_retention,
    }
  }
}

struct RunningJob {
  handle: AbortHandle,
  progress: watch::Receiver<f64>,
}

#[derive(Default)]
struct SchedulerState {
  jobs: HashMap<Uuid, Job>,
  pending: VecDeque<Uuid>,
  running: HashMap<Uuid, RunningJob>,
  cancelled_total: u64,
}

impl SchedulerState {
  /// Pending ids in the order the tick would start them.
  fn admission_order(&self) -> Vec<Uuid> {
    let mut order: Vec<(Priority, Uuid)> = self
      .pending
      .iter()
      .filter_map(|id| self.jobs.get(id).map(|job| (job.priority, *id)))
      .collect();
    // sort_by is stable, so arrival order survives within a priority
    order.sort_by(|a, b| b.0.cmp(&a.0));
    order.into_iter().map(|(_, id)| id).collect()
  }

  fn queue_position(&self, job_id: &Uuid) -> Option<usize> {
    self.admission_order().iter().position(|id| id == job_id).map(|i| i + 1)
  }

  fn refresh_progress(&mut self, job_id: &Uuid) {
    if let (Some(running), Some(job)) = (self.running.get(job_id), self.jobs.get_mut(job_id)) {
      job.set_progress(*running.progress.borrow());
    }
  }

  fn view(&self, job_id: &Uuid) -> Option<JobView> {
    let job = self.jobs.get(job_id)?;
    let position = match job.status {
      JobState::Queued => self.queue_position(job_id),
      _ => None,
    };
    Some(job.view(position))
  }

  fn purge_expired(&mut self, retention: Duration) -> usize {
    let ttl = TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
    let now = Utc::now();
    let before = self.jobs.len();
    self.jobs.retain(|_, job| match (job.status.is_terminal(), job.completed_at) {
      (true, Some(done)) => now - done < ttl,
      _ => true,
    });
    before - self.jobs.len()
  }
}

struct Inner {
  limits: SchedulerLimits,
  executor: Arc<dyn Executor>,
  state: Mutex<SchedulerState>,
}

/// Handle to one scheduler instance. Clones share the same job table.
#[derive(Clone)]
pub struct Scheduler {
  inner: Arc<Inner>,
}

impl Scheduler {
  pub fn new(limits: SchedulerLimits, executor: Arc<dyn Executor>) -> Self {
    Self {
      inner: Arc::new(Inner {
        limits,
        executor,
        state: Mutex::new(SchedulerState::default()),
      }),
    }
  }

  pub fn limits(&self) -> &SchedulerLimits {
    &self.inner.limits
  }

  pub fn executor(&self) -> Arc<dyn Executor> {
    Arc::clone(&self.inner.executor)
  }

  /// Admits a job or rejects it when running plus queued jobs already fill
  /// both budgets. The returned view carries the job id and queue position.
  pub async fn submit(&self, workload: Workload, timeout: Duration, priority: Priority) -> Result<JobView> {
    let limits = &self.inner.limits;
    let mut state = self.inner.state.lock().await;

    let outstanding = state.running.len() + state.pending.len();
    if outstanding >= limits.max_concurrent_jobs + limits.max_queued_jobs {
      warn!(
        running = state.running.len(),
        queued = state.pending.len(),
        "Rejecting job, queue full"
      );
      return Err(FleetError::Capacity(format!(
        "max {} queued + {} running",
        limits.max_queued_jobs, limits.max_concurrent_jobs
      )));
    }

    let job = Job::new(workload, timeout, priority);
    let job_id = job.id;
    state.jobs.insert(job_id, job);
    state.pending.push_back(job_id);

    let view = state.view(&job_id).ok_or_else(|| FleetError::JobNotFound(job_id.to_string()))?;
    info!(
      job_id = %job_id,
      priority = ?priority,
      position = ?view.queue_position,
      running = state.running.len(),
      max_concurrent = limits.max_concurrent_jobs,
      "Job queued"
    );
    Ok(view)
  }

  pub async fn status(&self, job_id: Uuid) -> Result<JobView> {
    let mut state = self.inner.state.lock().await;
    state.refresh_progress(&job_id);
    state.view(&job_id).ok_or_else(|| FleetError::JobNotFound(job_id.to_string()))
  }

  pub async fn result(&self, job_id: Uuid) -> Result<JobResult> {
    let state = self.inner.state.lock().await;
    let job = state
      .jobs
      .get(&job_id)
      .ok_or_else(|| FleetError::JobNotFound(job_id.to_string()))?;
    match job.status {
      JobState::Complete => Ok(JobResult {
        job_id,
        status: job.status,
        result: job.result.clone().unwrap_or(Value::Null),
        execution_time: job.execution_time,
        completed_at: job.completed_at,
      }),
      JobState::Failed => Err(FleetError::JobFailed(job.error.clone().unwrap_or_default())),
      JobState::Cancelled => Err(FleetError::JobCancelled),
      other => Err(FleetError::NotReady(other)),
    }
  }

  /// Drops a job. Queued jobs leave the queue at once; running jobs have their
  /// task aborted, which takes effect at the workload's next await point.
  /// Returns the state the job was in.
  pub async fn cancel(&self, job_id: Uuid) -> Result<JobState> {
    let mut state = self.inner.state.lock().await;
    let mut job = state
      .jobs
      .remove(&job_id)
      .ok_or_else(|| FleetError::JobNotFound(job_id.to_string()))?;
    let previous = job.status;

    state.pending.retain(|id| *id != job_id);
    if let Some(running) = state.running.remove(&job_id) {
      running.handle.abort();
    }
    if job.cancel() {
      state.cancelled_total += 1;
    }
    info!(job_id = %job_id, previous = %previous, "Job deleted");
    Ok(previous)
  }

  pub async fn list(&self) -> Vec<JobView> {
    let mut state = self.inner.state.lock().await;
    let running: Vec<Uuid> = state.running.keys().copied().collect();
    for job_id in &running {
      state.refresh_progress(job_id);
    }
    let mut jobs: Vec<JobView> = state.jobs.keys().filter_map(|id| state.view(id)).collect();
    jobs.sort_by_key(|view| view.created_at);
    jobs
  }

  pub async fn stats(&self) -> SchedulerStats {
    let limits = &self.inner.limits;
    let state = self.inner.state.lock().await;
    let mut counts = JobCounts::default();
    for job in state.jobs.values() {
      match job.status {
        JobState::Queued => counts.queued += 1,
        JobState::Running => counts.running += 1,
        JobState::Complete => counts.complete += 1,
        JobState::Failed => counts.failed += 1,
        JobState::Cancelled => {}
      }
    }
    SchedulerStats {
      queued: state.pending.len(),
      running: state.running.len(),
      max_concurrent: limits.max_concurrent_jobs,
      max_queued: limits.max_queued_jobs,
      available_slots: limits.max_concurrent_jobs.saturating_sub(state.running.len()),
      total_jobs: state.jobs.len(),
      jobs_by_status: counts,
      cancelled_total: state.cancelled_total,
    }
  }

  pub async fn running_count(&self) -> usize {
    self.inner.state.lock().await.running.len()
  }

  pub async fn queued_count(&self) -> usize {
    self.inner.state.lock().await.pending.len()
  }

  /// One scheduling pass: purge expired jobs, then start as many pending jobs
  /// as there are free slots. Returns the ids started, in start order.
  pub async fn tick(&self) -> Vec<Uuid> {
    let limits = &self.inner.limits;
    let mut state = self.inner.state.lock().await;

    if let Some(retention) = limits.job_retention {
      let purged = state.purge_expired(retention);
      if purged > 0 {
        info!(purged, "Purged expired jobs");
      }
    }

    let available = limits.max_concurrent_jobs.saturating_sub(state.running.len());
    if available == 0 || state.pending.is_empty() {
      return Vec::new();
    }

    let selected: Vec<Uuid> = state.admission_order().into_iter().take(available).collect();
    state.pending.retain(|id| !selected.contains(id));

    let mut started = Vec::with_capacity(selected.len());
    for job_id in selected {
      let Some(job) = state.jobs.get_mut(&job_id) else {
        continue;
      };
      if !job.start() {
        continue;
      }
      let workload = job.workload.clone();
      let timeout = job.timeout;

      let (reporter, progress) = ProgressReporter::channel();
      let task = tokio::spawn(run_job(Arc::clone(&self.inner), job_id, workload, timeout, reporter));
      state.running.insert(
        job_id,
        RunningJob {
          handle: task.abort_handle(),
          progress,
        },
      );
      info!(job_id = %job_id, "Starting job from queue");
      started.push(job_id);
    }
    started
  }

  /// Drives [`Scheduler::tick`] on the configured interval until the handle is aborted.
  pub fn spawn(&self) -> JoinHandle<()> {
    let scheduler = self.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(scheduler.inner.limits.tick_interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        scheduler.tick().await;
      }
    })
  }

  /// Aborts every running job task. Their records stay in RUNNING.
  pub async fn shutdown(&self) {
    let mut state = self.inner.state.lock().await;
    let count = state.running.len();
    for (_, running) in state.running.drain() {
      running.handle.abort();
    }
    if count > 0 {
      warn!(count, "Aborted running jobs on shutdown");
    }
  }
}

async fn run_job(inner: Arc<Inner>, job_id: Uuid, workload: Workload, timeout: Duration, reporter: ProgressReporter) {
  let executor = Arc::clone(&inner.executor);
  let execution = AssertUnwindSafe(async move { executor.execute(workload, reporter).await }).catch_unwind();

  let outcome = match tokio::time::timeout(timeout, execution).await {
    Ok(Ok(Ok(result))) => Ok(result),
    Ok(Ok(Err(e))) => Err((format!("{:#}", e), FailureKind::Error)),
    Ok(Err(_)) => Err(("workload panicked".to_string(), FailureKind::Error)),
    Err(_) => Err((
      format!("Timeout: job exceeded its execution limit of {:?}", timeout),
      FailureKind::Timeout,
    )),
  };

  let mut state = inner.state.lock().await;
  state.running.remove(&job_id);
  // the record is gone if the job was deleted while finishing
  let Some(job) = state.jobs.get_mut(&job_id) else {
    return;
  };
  match outcome {
    Ok(result) => {
      if job.complete(result) {
        info!(job_id = %job_id, execution_time = ?job.execution_time, "Job completed");
      }
    }
    Err((message, kind)) => {
      error!(job_id = %job_id, kind = ?kind, error = %message, "Job failed");
      job.fail(message, kind);
    }
  }
}
