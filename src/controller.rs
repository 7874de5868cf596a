use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use aptfleet::{
  client::PollOptions,
  config::load_agent_configs,
  health_monitor::HealthMonitor,
  models::ExecuteRequest,
  registry::AgentRegistry,
};
use tracing::{info, warn};

const USAGE: &str = "usage: aptfleet_controller [monitor | health | run <agent_id> <code> [timeout_secs]]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt::init();

  let fleet_file = std::env::var("FLEET_AGENTS_FILE").unwrap_or_else(|_| "agents.json".to_string());
  let configs = load_agent_configs(&fleet_file).with_context(|| format!("loading fleet from {}", fleet_file))?;
  let registry = Arc::new(AgentRegistry::from_configs(configs).await?);
  info!(agents = ?registry.list_agents().await, "Fleet loaded");

  let args: Vec<String> = std::env::args().skip(1).collect();
  let outcome = match args.first().map(String::as_str).unwrap_or("monitor") {
    "monitor" => monitor(Arc::clone(&registry)).await,
    "health" => health(&registry).await,
    "run" => run(&registry, &args[1..]).await,
    other => Err(anyhow::anyhow!("unknown command '{}'\n{}", other, USAGE)),
  };

  registry.cleanup().await;
  outcome
}

async fn monitor(registry: Arc<AgentRegistry>) -> anyhow::Result<()> {
  let monitor = HealthMonitor::new(registry);
  monitor.start().await;

  let mut summary = tokio::time::interval(Duration::from_secs(60));
  loop {
    tokio::select! {
      _ = summary.tick() => {
        let healthy = monitor.healthy_agents().await;
        let failed = monitor.failed_agents().await;
        info!(healthy = ?healthy, failed = ?failed, "Fleet health");
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  monitor.stop().await;
  Ok(())
}

async fn health(registry: &AgentRegistry) -> anyhow::Result<()> {
  let results = registry.health_check_all().await;
  println!("{}", serde_json::to_string_pretty(&results)?);
  Ok(())
}

async fn run(registry: &AgentRegistry, args: &[String]) -> anyhow::Result<()> {
  let (agent_id, code) = match args {
    [agent_id, code, ..] => (agent_id, code),
    _ => bail!(USAGE),
  };
  let mut request = ExecuteRequest::new(code.as_str());
  if let Some(secs) = args.get(2) {
    let secs: u64 = secs.parse().with_context(|| format!("invalid timeout '{}'", secs))?;
    request = request.with_timeout(Duration::from_secs(secs));
  }

  let client = registry.get_client(agent_id).await?;
  let options = PollOptions::new(Duration::from_secs(5), Duration::from_secs(1800)).delete_on_completion();

  let mut last_progress = None;
  let result = client
    .execute_async(&request, &options, |view| {
      if view.progress != last_progress {
        last_progress = view.progress;
        info!(job_id = %view.job_id, status = %view.status, progress = ?view.progress, "Progress");
      }
    })
    .await;

  match result {
    Ok(result) => {
      println!("{}", serde_json::to_string_pretty(&result)?);
      Ok(())
    }
    Err(e) => {
      warn!(agent_id = %agent_id, error = %e, "Job did not complete");
      Err(e.into())
    }
  }
}
