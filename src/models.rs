use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Longest timeout the synchronous path accepts; longer work must be submitted as a job.
pub const SYNC_EXECUTION_CEILING: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
  Queued,
  Running,
  Complete,
  Failed,
  Cancelled,
}

impl JobState {
  pub fn is_terminal(self) -> bool {
    matches!(self, JobState::Complete | JobState::Failed | JobState::Cancelled)
  }

  /// Allowed edges of the job lifecycle.
  pub fn can_transition_to(self, next: JobState) -> bool {
    matches!(
      (self, next),
      (JobState::Queued, JobState::Running)
        | (JobState::Queued, JobState::Cancelled)
        | (JobState::Running, JobState::Complete)
        | (JobState::Running, JobState::Failed)
        | (JobState::Running, JobState::Cancelled)
    )
  }
}

impl fmt::Display for JobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      JobState::Queued => write!(f, "queued"),
      JobState::Running => write!(f, "running"),
      JobState::Complete => write!(f, "complete"),
      JobState::Failed => write!(f, "failed"),
      JobState::Cancelled => write!(f, "cancelled"),
    }
  }
}

/// Declaration order is the admission order: `Low < Normal < High < Urgent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  #[default]
  Normal,
  High,
  Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
  Error,
  Timeout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
  Emit,
  #[default]
  Serve,
}

impl FromStr for AgentMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "emit" => Ok(AgentMode::Emit),
      "serve" => Ok(AgentMode::Serve),
      other => Err(format!("unknown agent mode '{}'", other)),
    }
  }
}

/// Opaque unit of work handed to the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
  pub code: String,
  #[serde(default)]
  pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
  pub code: String,
  #[serde(default)]
  pub context: Map<String, Value>,
  /// Execution timeout in seconds; the agent default applies when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout: Option<u64>,
  #[serde(default)]
  pub priority: Priority,
}

impl ExecuteRequest {
  pub fn new(code: impl Into<String>) -> Self {
    Self {
      code: code.into(),
      context: Map::new(),
      timeout: None,
      priority: Priority::Normal,
    }
  }

  pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.context.insert(key.into(), value.into());
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout.as_secs().max(1));
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn timeout_or(&self, default: Duration) -> Duration {
    self.timeout.map(Duration::from_secs).unwrap_or(default)
  }

  pub fn workload(&self) -> Workload {
    Workload {
      code: self.code.clone(),
      context: self.context.clone(),
    }
  }
}

/// One unit of remote work and its lifecycle, owned by a scheduler.
#[derive(Debug, Clone)]
pub struct Job {
  pub id: Uuid,
  pub workload: Workload,
  pub timeout: Duration,
  pub priority: Priority,
  pub status: JobState,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub progress: f64,
  pub result: Option<Value>,
  pub error: Option<String>,
  pub failure: Option<FailureKind>,
  pub execution_time: Option<f64>,
}

impl Job {
  pub fn new(workload: Workload, timeout: Duration, priority: Priority) -> Self {
    Self {
      id: Uuid::new_v4(),
      workload,
      timeout,
      priority,
      status: JobState::Queued,
      created_at: Utc::now(),
      started_at: None,
      completed_at: None,
      progress: 0.0,
      result: None,
      error: None,
      failure: None,
      execution_time: None,
    }
  }

  /// Moves along a lifecycle edge. Returns false and leaves the job untouched
  /// for any edge the state machine does not allow.
  fn transition(&mut self, next: JobState) -> bool {
    if !self.status.can_transition_to(next) {
      return false;
    }
    let now = Utc::now();
    match next {
      JobState::Running => {
        self.started_at = Some(now);
        self.progress = 0.0;
      }
      _ => {
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
          self.execution_time = Some((now - started).num_milliseconds() as f64 / 1000.0);
        }
      }
    }
    self.status = next;
    true
  }

  pub fn start(&mut self) -> bool {
    self.transition(JobState::Running)
  }

  pub fn complete(&mut self, result: Value) -> bool {
    if !self.transition(JobState::Complete) {
      return false;
    }
    self.result = Some(result);
    self.progress = 100.0;
    true
  }

  pub fn fail(&mut self, error: String, kind: FailureKind) -> bool {
    if !self.transition(JobState::Failed) {
      return false;
    }
    self.error = Some(error);
    self.failure = Some(kind);
    true
  }

  pub fn cancel(&mut self) -> bool {
    self.transition(JobState::Cancelled)
  }

  pub fn set_progress(&mut self, progress: f64) {
    if self.status == JobState::Running && progress.is_finite() {
      self.progress = progress.clamp(0.0, 100.0);
    }
  }

  pub fn view(&self, queue_position: Option<usize>) -> JobView {
    JobView {
      job_id: self.id,
      status: self.status,
      priority: self.priority,
      created_at: self.created_at,
      started_at: self.started_at,
      completed_at: self.completed_at,
      progress: Some(self.progress),
      queue_position,
      error: self.error.clone(),
      failure: self.failure,
      message: self.message(queue_position),
    }
  }

  fn message(&self, queue_position: Option<usize>) -> String {
    match self.status {
      JobState::Queued => match queue_position {
        Some(position) => format!("Job queued (position: {})", position),
        None => "Job queued, waiting to start".to_string(),
      },
      JobState::Running => format!("Job running ({:.1}% complete)", self.progress),
      JobState::Complete => "Job completed successfully".to_string(),
      JobState::Failed => format!("Job failed: {}", self.error.as_deref().unwrap_or("Unknown error")),
      JobState::Cancelled => "Job cancelled".to_string(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
  pub job_id: Uuid,
  pub status: JobState,
  pub priority: Priority,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub progress: Option<f64>,
  pub queue_position: Option<usize>,
  pub error: Option<String>,
  pub failure: Option<FailureKind>,
  pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
  pub job_id: Uuid,
  pub status: JobState,
  pub result: Value,
  pub execution_time: Option<f64>,
  pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
  pub queued: usize,
  pub running: usize,
  pub complete: usize,
  pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
  pub queued: usize,
  pub running: usize,
  pub max_concurrent: usize,
  pub max_queued: usize,
  pub available_slots: usize,
  pub total_jobs: usize,
  pub jobs_by_status: JobCounts,
  pub cancelled_total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
  pub agent_id: String,
  #[serde(flatten)]
  pub stats: SchedulerStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobList {
  pub jobs: Vec<JobView>,
  pub stats: SchedulerStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncExecution {
  pub agent_id: String,
  pub result: Value,
  pub execution_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
  pub status: String,
  pub agent_id: String,
  pub mode: AgentMode,
  pub uptime_seconds: f64,
  pub active_jobs: usize,
  pub queued_jobs: usize,
  pub total_jobs: usize,
  pub max_concurrent: usize,
  pub available_slots: usize,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
  pub message: String,
  pub existed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
  pub error: String,
  pub message: String,
}
