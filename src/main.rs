use std::sync::Arc;

use aptfleet::{
  config::Config,
  executor::ShellExecutor,
  job_scheduler::{Scheduler, SchedulerLimits},
  routes::{AgentContext, routes},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;

  let scheduler = Scheduler::new(SchedulerLimits::from(&config), Arc::new(ShellExecutor::default()));
  let ticker = scheduler.spawn();
  info!(
    agent_id = %config.agent_id,
    mode = ?config.mode,
    max_concurrent_jobs = config.max_concurrent_jobs,
    max_queued_jobs = config.max_queued_jobs,
    "Agent started"
  );

  let port = config.server_port;
  let api = routes(AgentContext::new(config, scheduler.clone()));
  let (addr, server) = warp::serve(api).try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), async {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested");
  })?;
  info!(%addr, "Agent listening");
  server.await;

  ticker.abort();
  scheduler.shutdown().await;
  Ok(())
}
