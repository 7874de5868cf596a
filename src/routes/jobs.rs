use std::panic::AssertUnwindSafe;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tracing::{error, info};
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use super::{AgentContext, ApiError, reject, with_context};
use crate::error::FleetError;
use crate::executor::ProgressReporter;
use crate::models::{
  DeleteResponse, ExecuteRequest, HealthReport, JobList, SYNC_EXECUTION_CEILING, StatsReport, SyncExecution,
};

pub fn execute_route(ctx: AgentContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("execute")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_context(ctx))
    .and_then(handle_execute)
}

pub fn submit_route(ctx: AgentContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("execute" / "async")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_context(ctx))
    .and_then(handle_submit)
}

pub fn status_route(ctx: AgentContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("jobs" / Uuid)
    .and(warp::get())
    .and(with_context(ctx))
    .and_then(handle_status)
}

pub fn results_route(ctx: AgentContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("jobs" / Uuid / "results")
    .and(warp::get())
    .and(with_context(ctx))
    .and_then(handle_results)
}

pub fn delete_route(ctx: AgentContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("jobs" / Uuid)
    .and(warp::delete())
    .and(with_context(ctx))
    .and_then(handle_delete)
}

pub fn list_route(ctx: AgentContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("jobs")
    .and(warp::get())
    .and(with_context(ctx))
    .and_then(handle_list)
}

pub fn stats_route(ctx: AgentContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("stats")
    .and(warp::get())
    .and(with_context(ctx))
    .and_then(handle_stats)
}

pub fn health_route(ctx: AgentContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("health")
    .and(warp::get())
    .and(with_context(ctx))
    .and_then(handle_health)
}

/// Short path: runs the workload inline, outside the scheduler's budget.
async fn handle_execute(request: ExecuteRequest, ctx: AgentContext) -> Result<impl Reply, Rejection> {
  let timeout = request.timeout_or(SYNC_EXECUTION_CEILING);
  if timeout > SYNC_EXECUTION_CEILING {
    return Err(reject(FleetError::SyncCeilingExceeded {
      requested: timeout,
      ceiling: SYNC_EXECUTION_CEILING,
    }));
  }

  let executor = ctx.scheduler.executor();
  let started = Instant::now();
  let execution = AssertUnwindSafe(executor.execute(request.workload(), ProgressReporter::detached())).catch_unwind();
  let outcome = tokio::time::timeout(timeout, execution).await;
  let execution_time = started.elapsed().as_secs_f64();

  match outcome {
    Ok(Ok(Ok(result))) => {
      info!(execution_time, "Synchronous execution finished");
      Ok(warp::reply::json(&SyncExecution {
        agent_id: ctx.config.agent_id.clone(),
        result,
        execution_time,
      }))
    }
    Ok(Ok(Err(e))) => {
      error!("Synchronous execution failed: {:#}", e);
      Err(reject(ApiError::new(500, "execution_error", format!("Execution error: {:#}", e))))
    }
    Ok(Err(_)) => {
      error!("Synchronous workload panicked");
      Err(reject(ApiError::new(500, "execution_error", "Execution error: workload panicked")))
    }
    Err(_) => Err(reject(ApiError::new(
      408,
      "timeout",
      format!("Execution timeout after {}s", timeout.as_secs()),
    ))),
  }
}

async fn handle_submit(request: ExecuteRequest, ctx: AgentContext) -> Result<impl Reply, Rejection> {
  let timeout = request.timeout_or(ctx.config.job_timeout);
  let view = ctx
    .scheduler
    .submit(request.workload(), timeout, request.priority)
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&view))
}

async fn handle_status(job_id: Uuid, ctx: AgentContext) -> Result<impl Reply, Rejection> {
  let view = ctx.scheduler.status(job_id).await.map_err(reject)?;
  Ok(warp::reply::json(&view))
}

async fn handle_results(job_id: Uuid, ctx: AgentContext) -> Result<impl Reply, Rejection> {
  let result = ctx.scheduler.result(job_id).await.map_err(reject)?;
  Ok(warp::reply::json(&result))
}

async fn handle_delete(job_id: Uuid, ctx: AgentContext) -> Result<impl Reply, Rejection> {
  let existed = match ctx.scheduler.cancel(job_id).await {
    Ok(_) => true,
    Err(FleetError::JobNotFound(_)) => false,
    Err(e) => return Err(reject(e)),
  };
  let message = if existed { "Job deleted" } else { "Job not found" };
  Ok(warp::reply::json(&DeleteResponse {
    message: message.to_string(),
    existed,
  }))
}

async fn handle_list(ctx: AgentContext) -> Result<impl Reply, Rejection> {
  let jobs = ctx.scheduler.list().await;
  let stats = ctx.scheduler.stats().await;
  Ok(warp::reply::json(&JobList { jobs, stats }))
}

async fn handle_stats(ctx: AgentContext) -> Result<impl Reply, Rejection> {
  let stats = ctx.scheduler.stats().await;
  Ok(warp::reply::json(&StatsReport {
    agent_id: ctx.config.agent_id.clone(),
    stats,
  }))
}

async fn handle_health(ctx: AgentContext) -> Result<impl Reply, Rejection> {
  let stats = ctx.scheduler.stats().await;
  Ok(warp::reply::json(&HealthReport {
    status: "healthy".into(),
    agent_id: ctx.config.agent_id.clone(),
    mode: ctx.config.mode,
    uptime_seconds: ctx.started_at.elapsed().as_secs_f64(),
    active_jobs: stats.running,
    queued_jobs: stats.queued,
    total_jobs: stats.total_jobs,
    max_concurrent: stats.max_concurrent,
    available_slots: stats.available_slots,
    timestamp: Utc::now(),
  }))
}
