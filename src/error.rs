use std::time::Duration;
use thiserror::Error;

use crate::models::JobState;

#[derive(Error, Debug)]
pub enum FleetError {
  #[error("Job queue full: {0}")]
  Capacity(String),

  #[error("Job not found: {0}")]
  JobNotFound(String),

  #[error("Agent '{0}' not registered")]
  AgentNotRegistered(String),

  #[error("Job still {0}")]
  NotReady(JobState),

  #[error("Job failed: {0}")]
  JobFailed(String),

  #[error("Job was cancelled")]
  JobCancelled,

  #[error("Request timed out")]
  RequestTimeout,

  #[error("Job did not finish within {}s", .0.as_secs())]
  PollTimeout(Duration),

  #[error("Timeout {}s exceeds the synchronous ceiling of {}s, use async execution", .requested.as_secs(), .ceiling.as_secs())]
  SyncCeilingExceeded { requested: Duration, ceiling: Duration },

  #[error("Invalid authentication token")]
  Unauthorized,

  #[error("Agent responded {status}: {message}")]
  Remote { status: u16, message: String },

  #[error("HTTP error: {0}")]
  Http(reqwest::Error),

  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),

  #[error("Client for agent '{0}' is closed")]
  ClientClosed(String),
}

impl FleetError {
  /// Errors a polling caller may ride out by simply asking again.
  pub fn is_transient(&self) -> bool {
    match self {
      FleetError::RequestTimeout => true,
      FleetError::Http(e) => e.is_connect() || e.is_request() || e.is_body(),
      FleetError::Remote { status, .. } => *status >= 500,
      _ => false,
    }
  }

  /// True when the request never reached the agent.
  pub fn is_connect(&self) -> bool {
    matches!(self, FleetError::Http(e) if e.is_connect())
  }
}

impl From<reqwest::Error> for FleetError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      FleetError::RequestTimeout
    } else {
      FleetError::Http(e)
    }
  }
}

pub type Result<T> = std::result::Result<T, FleetError>;
