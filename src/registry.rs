use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::client::AgentClient;
use crate::config::AgentConfig;
use crate::error::{FleetError, Result};
use crate::health_monitor::HealthProbe;

/// Known agents and one lazily opened client per agent.
#[derive(Debug, Default)]
pub struct AgentRegistry {
  configs: RwLock<HashMap<String, AgentConfig>>,
  clients: Mutex<HashMap<String, Arc<AgentClient>>>,
}

impl AgentRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn from_configs(configs: Vec<AgentConfig>) -> Result<Self> {
    let registry = Self::new();
    for config in configs {
      registry.register(config).await?;
    }
    Ok(registry)
  }

  /// Inserts or replaces an agent. Replacing a config with a different one
  /// closes the client opened under the old config.
  pub async fn register(&self, config: AgentConfig) -> Result<()> {
    config.validate()?;
    let agent_id = config.agent_id.clone();
    // clients before configs, same order as get_client
    let mut clients = self.clients.lock().await;
    let replaced = self.configs.write().await.insert(agent_id.clone(), config.clone());

    if let Some(previous) = replaced {
      if previous != config {
        if let Some(stale) = clients.remove(&agent_id) {
          stale.close();
        }
      }
    }
    drop(clients);
    info!(agent_id = %agent_id, endpoint = %config.endpoint, mode = ?config.mode, "Registered agent");
    Ok(())
  }

  pub async fn list_agents(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.configs.read().await.keys().cloned().collect();
    ids.sort();
    ids
  }

  pub async fn config(&self, agent_id: &str) -> Option<AgentConfig> {
    self.configs.read().await.get(agent_id).cloned()
  }

  /// Returns the agent's shared client, opening it on first use. Concurrent
  /// callers always get the same instance, built from the current config.
  pub async fn get_client(&self, agent_id: &str) -> Result<Arc<AgentClient>> {
    let mut clients = self.clients.lock().await;
    if let Some(client) = clients.get(agent_id) {
      return Ok(Arc::clone(client));
    }
    let config = self
      .config(agent_id)
      .await
      .ok_or_else(|| FleetError::AgentNotRegistered(agent_id.to_string()))?;
    let client = Arc::new(AgentClient::new(config)?);
    clients.insert(agent_id.to_string(), Arc::clone(&client));
    debug!(agent_id = %agent_id, "Opened agent client");
    Ok(client)
  }

  /// Probes every agent concurrently. A failing agent shows up as `false`
  /// and never affects the others.
  pub async fn health_check_all(&self) -> HashMap<String, bool> {
    let checks = self.list_agents().await.into_iter().map(|agent_id| async move {
      let healthy = match self.get_client(&agent_id).await {
        Ok(client) => client.health_check().await,
        Err(e) => Err(e),
      };
      let healthy = healthy.unwrap_or_else(|e| {
        error!(agent_id = %agent_id, error = %e, "Health check failed");
        false
      });
      (agent_id, healthy)
    });
    join_all(checks).await.into_iter().collect()
  }

  /// Closes every open client. Safe to call more than once; returns how many
  /// clients this call closed.
  pub async fn cleanup(&self) -> usize {
    let clients: Vec<Arc<AgentClient>> = self.clients.lock().await.drain().map(|(_, client)| client).collect();
    let closed = clients.iter().filter(|client| client.close()).count();
    if closed > 0 {
      info!(closed, "Closed agent connections");
    }
    closed
  }
}

impl HealthProbe for AgentRegistry {
  fn targets(&self) -> BoxFuture<'_, Vec<(String, Duration)>> {
    async move {
      let configs = self.configs.read().await;
      let mut targets: Vec<(String, Duration)> = configs
        .values()
        .map(|config| (config.agent_id.clone(), config.health_check_interval()))
        .collect();
      targets.sort();
      targets
    }
    .boxed()
  }

  fn probe<'a>(&'a self, agent_id: &'a str) -> BoxFuture<'a, Result<bool>> {
    async move { self.get_client(agent_id).await?.health_check().await }.boxed()
  }
}
