//! Controller-side client for one agent.
//!
//! Long workloads go through [`AgentClient::execute_async`]: submit, then poll
//! status, then fetch the result. Every HTTP call carries its own short
//! timeout, so no connection stays open for the length of the workload.

use std::sync::RwLock;
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{FleetError, Result};
use crate::models::{
  DeleteResponse, ErrorBody, ExecuteRequest, HealthReport, JobList, JobResult, JobState, JobView,
  SYNC_EXECUTION_CEILING, StatsReport, SyncExecution,
};

static MAX_RETRIES: usize = 3;
static RETRY_FACTOR_MS: u64 = 100;

/// Per-call timeouts, independent of how long the workload itself runs.
#[derive(Debug, Clone)]
pub struct CallTimeouts {
  pub health: Duration,
  pub submit: Duration,
  pub status: Duration,
  pub result: Duration,
  pub delete: Duration,
}

impl Default for CallTimeouts {
  fn default() -> Self {
    Self {
      health: Duration::from_secs(5),
      submit: Duration::from_secs(30),
      status: Duration::from_secs(10),
      result: Duration::from_secs(60),
      delete: Duration::from_secs(10),
    }
  }
}

#[derive(Debug, Clone)]
pub struct PollOptions {
  pub poll_interval: Duration,
  /// Overall budget for the job, measured from the first status poll.
  pub max_wait: Duration,
  pub delete_on_completion: bool,
}

impl Default for PollOptions {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(30),
      max_wait: Duration::from_secs(1800),
      delete_on_completion: false,
    }
  }
}

impl PollOptions {
  pub fn new(poll_interval: Duration, max_wait: Duration) -> Self {
    Self {
      poll_interval,
      max_wait,
      delete_on_completion: false,
    }
  }

  pub fn delete_on_completion(mut self) -> Self {
    self.delete_on_completion = true;
    self
  }
}

fn backoff() -> impl Iterator<Item = Duration> {
  ExponentialBackoff::from_millis(2)
    .factor(RETRY_FACTOR_MS)
    .max_delay(Duration::from_secs(5))
    .take(MAX_RETRIES)
}

#[derive(Debug)]
pub struct AgentClient {
  config: AgentConfig,
  timeouts: CallTimeouts,
  http: RwLock<Option<reqwest::Client>>,
}

impl AgentClient {
  pub fn new(config: AgentConfig) -> Result<Self> {
    let http = reqwest::Client::builder()
      .pool_idle_timeout(Duration::from_secs(90))
      .build()?;
    Ok(Self {
      config,
      timeouts: CallTimeouts::default(),
      http: RwLock::new(Some(http)),
    })
  }

  pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
    self.timeouts = timeouts;
    self
  }

  pub fn config(&self) -> &AgentConfig {
    &self.config
  }

  pub fn agent_id(&self) -> &str {
    &self.config.agent_id
  }

  /// Drops the connection pool. Returns false when it was already closed.
  pub fn close(&self) -> bool {
    let mut http = self.http.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    let was_open = http.take().is_some();
    if was_open {
      debug!(agent_id = %self.config.agent_id, "Closed agent client");
    }
    was_open
  }

  pub fn is_closed(&self) -> bool {
    self.http.read().unwrap_or_else(|poisoned| poisoned.into_inner()).is_none()
  }

  fn request(&self, method: Method, path: &str, timeout: Duration) -> Result<RequestBuilder> {
    let http = self
      .http
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
      .ok_or_else(|| FleetError::ClientClosed(self.config.agent_id.clone()))?;
    let url = format!("{}{}", self.config.endpoint.trim_end_matches('/'), path);
    let mut builder = http.request(method, url).timeout(timeout);
    if let Some(token) = &self.config.auth_token {
      builder = builder.bearer_auth(token);
    }
    Ok(builder)
  }

  async fn call<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
    let response = builder.send().await?;
    decode(response).await
  }

  /// True when the agent answers its health endpoint and reports itself healthy.
  /// Transport failures are returned as errors so callers can record them.
  pub async fn health_check(&self) -> Result<bool> {
    let response = self
      .request(Method::GET, "/health", self.timeouts.health)?
      .send()
      .await?;
    if !response.status().is_success() {
      warn!(agent_id = %self.config.agent_id, status = %response.status(), "Unexpected health check response");
      return Ok(false);
    }
    let report: HealthReport = response.json().await?;
    Ok(report.status == "healthy")
  }

  pub async fn health(&self) -> Result<HealthReport> {
    self.call(self.request(Method::GET, "/health", self.timeouts.health)?).await
  }

  /// Submits a job. Retried only when the agent could not be reached at all,
  /// so a submission is never accepted twice.
  pub async fn submit(&self, request: &ExecuteRequest) -> Result<JobView> {
    let mut body = request.clone();
    if body.timeout.is_none() {
      body.timeout = Some(self.config.timeout);
    }
    let body = &body;
    RetryIf::spawn(
      backoff(),
      || async move {
        self
          .call::<JobView>(self.request(Method::POST, "/execute/async", self.timeouts.submit)?.json(body))
          .await
      },
      |e: &FleetError| e.is_connect(),
    )
    .await
  }

  pub async fn status(&self, job_id: Uuid) -> Result<JobView> {
    let path = format!("/jobs/{}", job_id);
    self.call(self.request(Method::GET, &path, self.timeouts.status)?).await
  }

  pub async fn result(&self, job_id: Uuid) -> Result<JobResult> {
    let path = format!("/jobs/{}/results", job_id);
    self.call(self.request(Method::GET, &path, self.timeouts.result)?).await
  }

  pub async fn delete(&self, job_id: Uuid) -> Result<DeleteResponse> {
    let path = format!("/jobs/{}", job_id);
    self.call(self.request(Method::DELETE, &path, self.timeouts.delete)?).await
  }

  pub async fn list_jobs(&self) -> Result<JobList> {
    self.call(self.request(Method::GET, "/jobs", self.timeouts.status)?).await
  }

  pub async fn stats(&self) -> Result<StatsReport> {
    self.call(self.request(Method::GET, "/stats", self.timeouts.status)?).await
  }

  /// Single round trip for short workloads. Anything allowed to run longer
  /// than the synchronous ceiling is refused before a request is made.
  pub async fn execute_sync(&self, request: &ExecuteRequest) -> Result<SyncExecution> {
    let timeout = request.timeout_or(self.config.job_timeout());
    if timeout > SYNC_EXECUTION_CEILING {
      return Err(FleetError::SyncCeilingExceeded {
        requested: timeout,
        ceiling: SYNC_EXECUTION_CEILING,
      });
    }
    let mut body = request.clone();
    body.timeout = Some(timeout.as_secs().max(1));
    let builder = self
      .request(Method::POST, "/execute", timeout + Duration::from_secs(10))?
      .json(&body);
    self.call(builder).await
  }

  /// Status updates for a job, one per poll, ending after the first terminal
  /// status. Calls that time out or hit a transient failure are logged and
  /// polled again; anything else, or running past `max_wait`, ends the stream
  /// with an error.
  pub fn watch(&self, job_id: Uuid, options: &PollOptions) -> impl Stream<Item = Result<JobView>> + '_ {
    let poll_interval = options.poll_interval;
    let max_wait = options.max_wait;
    let started = Instant::now();

    stream::unfold(Some(true), move |state| async move {
      let mut first = state?;
      loop {
        if !first {
          tokio::time::sleep(poll_interval).await;
        }
        first = false;

        if started.elapsed() > max_wait {
          return Some((Err(FleetError::PollTimeout(max_wait)), None));
        }
        match self.status(job_id).await {
          Ok(view) => {
            let next = if view.status.is_terminal() { None } else { Some(false) };
            return Some((Ok(view), next));
          }
          Err(e) if e.is_transient() => {
            warn!(agent_id = %self.config.agent_id, job_id = %job_id, error = %e, "Status poll failed, retrying");
          }
          Err(e) => return Some((Err(e), None)),
        }
      }
    })
  }

  /// Submits the workload and polls until it finishes. `on_update` sees every
  /// status observed along the way.
  pub async fn execute_async<F>(&self, request: &ExecuteRequest, options: &PollOptions, mut on_update: F) -> Result<JobResult>
  where
    F: FnMut(&JobView),
  {
    let submitted = self.submit(request).await?;
    let job_id = submitted.job_id;
    info!(
      agent_id = %self.config.agent_id,
      job_id = %job_id,
      position = ?submitted.queue_position,
      "Job submitted, polling every {:?}",
      options.poll_interval
    );

    let updates = self.watch(job_id, options);
    futures::pin_mut!(updates);
    while let Some(update) = updates.next().await {
      let view = update?;
      debug!(job_id = %job_id, status = %view.status, progress = ?view.progress, "Job status");
      on_update(&view);

      match view.status {
        JobState::Complete => {
          let result = self.fetch_result(job_id).await?;
          info!(agent_id = %self.config.agent_id, job_id = %job_id, "Job complete");
          if options.delete_on_completion {
            if let Err(e) = self.delete(job_id).await {
              warn!(job_id = %job_id, error = %e, "Failed to delete finished job");
            }
          }
          return Ok(result);
        }
        JobState::Failed => return Err(FleetError::JobFailed(view.error.unwrap_or(view.message))),
        JobState::Cancelled => return Err(FleetError::JobCancelled),
        JobState::Queued | JobState::Running => {}
      }
    }
    Err(FleetError::JobNotFound(job_id.to_string()))
  }

  async fn fetch_result(&self, job_id: Uuid) -> Result<JobResult> {
    RetryIf::spawn(backoff(), || self.result(job_id), |e: &FleetError| e.is_transient()).await
  }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
  let status = response.status();
  if status.is_success() {
    return Ok(response.json().await?);
  }

  let text = response.text().await.unwrap_or_default();
  let body: Option<ErrorBody> = serde_json::from_str(&text).ok();
  let code = body.as_ref().map(|b| b.error.clone()).unwrap_or_default();
  let message = body.map(|b| b.message).unwrap_or(text);

  Err(match (status.as_u16(), code.as_str()) {
    (401, _) => FleetError::Unauthorized,
    (404, _) => FleetError::JobNotFound(message),
    (410, _) => FleetError::JobCancelled,
    (425, "not_ready_queued") => FleetError::NotReady(JobState::Queued),
    (425, _) => FleetError::NotReady(JobState::Running),
    (429, _) => FleetError::Capacity(message),
    (_, "job_failed") => FleetError::JobFailed(message),
    (status, _) => FleetError::Remote { status, message },
  })
}
