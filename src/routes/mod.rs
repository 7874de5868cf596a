use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::config::Config;
use crate::error::FleetError;
use crate::job_scheduler::Scheduler;
use crate::models::{ErrorBody, JobState};

pub mod jobs;
pub mod sse;

/// Everything a request handler needs on the agent side.
#[derive(Clone)]
pub struct AgentContext {
  pub config: Arc<Config>,
  pub scheduler: Scheduler,
  pub started_at: Instant,
}

impl AgentContext {
  pub fn new(config: Config, scheduler: Scheduler) -> Self {
    Self {
      config: Arc::new(config),
      scheduler,
      started_at: Instant::now(),
    }
  }
}

#[derive(Debug)]
pub struct ApiError {
  pub status: u16,
  pub code: &'static str,
  pub message: String,
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
  pub fn new(status: u16, code: &'static str, message: impl Into<String>) -> Self {
    Self {
      status,
      code,
      message: message.into(),
    }
  }
}

impl From<FleetError> for ApiError {
  fn from(e: FleetError) -> Self {
    let (status, code) = match &e {
      FleetError::Capacity(_) => (429, "capacity"),
      FleetError::JobNotFound(_) | FleetError::AgentNotRegistered(_) => (404, "not_found"),
      FleetError::NotReady(JobState::Queued) => (425, "not_ready_queued"),
      FleetError::NotReady(_) => (425, "not_ready_running"),
      FleetError::JobFailed(_) => (500, "job_failed"),
      FleetError::JobCancelled => (410, "cancelled"),
      FleetError::Unauthorized => (401, "unauthorized"),
      FleetError::SyncCeilingExceeded { .. } | FleetError::InvalidConfig(_) => (400, "bad_request"),
      FleetError::RequestTimeout => (408, "timeout"),
      _ => (500, "internal"),
    };
    // bare detail for the variants the client rebuilds from the body
    let message = match e {
      FleetError::JobFailed(detail) | FleetError::Capacity(detail) | FleetError::JobNotFound(detail) => detail,
      other => other.to_string(),
    };
    Self::new(status, code, message)
  }
}

pub fn reject(e: impl Into<ApiError>) -> Rejection {
  warp::reject::custom(e.into())
}

pub fn with_context(ctx: AgentContext) -> impl Filter<Extract = (AgentContext,), Error = Infallible> + Clone {
  warp::any().map(move || ctx.clone())
}

/// Requires `Authorization: Bearer <token>` when the agent has a token configured.
pub fn with_auth(token: Option<String>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
  let expected: Option<Arc<str>> = token.map(|t| Arc::from(format!("Bearer {}", t)));
  warp::header::optional::<String>("authorization")
    .and_then(move |header: Option<String>| {
      let expected = expected.clone();
      async move {
        match expected {
          Some(expected) if header.as_deref() != Some(&*expected) => Err(reject(FleetError::Unauthorized)),
          _ => Ok(()),
        }
      }
    })
    .untuple_one()
}

pub fn routes(ctx: AgentContext) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  let api = jobs::execute_route(ctx.clone())
    .or(jobs::submit_route(ctx.clone()))
    .or(sse::events_route(ctx.clone()))
    .or(jobs::results_route(ctx.clone()))
    .or(jobs::status_route(ctx.clone()))
    .or(jobs::delete_route(ctx.clone()))
    .or(jobs::list_route(ctx.clone()))
    .or(jobs::stats_route(ctx.clone()))
    .or(jobs::health_route(ctx.clone()));

  with_auth(ctx.config.auth_token.clone())
    .and(api)
    .recover(handle_rejection)
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, code, message) = if let Some(api) = err.find::<ApiError>() {
    (api.status, api.code, api.message.clone())
  } else if err.is_not_found() {
    (404, "not_found", "Not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (400, "bad_request", e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (405, "method_not_allowed", "Method not allowed".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (500, "internal", "Internal server error".to_string())
  };

  let body = warp::reply::json(&ErrorBody {
    error: code.to_string(),
    message,
  });
  let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  Ok(warp::reply::with_status(body, status))
}
