//! Continuous liveness classification of registered agents.
//!
//! Every agent gets its own loop sampling at the agent's interval. Three
//! consecutive failed probes mark the agent FAILED and raise one alert; the
//! next successful probe returns it to HEALTHY.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;

pub const ALERT_THRESHOLD: u32 = 3;

/// Source of monitoring targets and their liveness probes.
pub trait HealthProbe: Send + Sync + 'static {
  /// Agents to monitor when the monitor starts, with their sampling intervals.
  fn targets(&self) -> BoxFuture<'_, Vec<(String, Duration)>>;

  fn probe<'a>(&'a self, agent_id: &'a str) -> BoxFuture<'a, Result<bool>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentAlert {
  pub agent_id: String,
  pub consecutive_failures: u32,
  pub last_error: Option<String>,
  pub uptime_percentage: f64,
  pub raised_at: DateTime<Utc>,
}

pub trait AlertSink: Send + Sync + 'static {
  fn alert(&self, alert: &AgentAlert);
}

/// Default sink: alerts end up in the log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
  fn alert(&self, alert: &AgentAlert) {
    error!(
      agent_id = %alert.agent_id,
      consecutive_failures = alert.consecutive_failures,
      last_error = alert.last_error.as_deref().unwrap_or("Unknown"),
      uptime = format!("{:.2}%", alert.uptime_percentage),
      "ALERT: agent failed consecutive health checks"
    );
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
  #[default]
  Unknown,
  Healthy,
  Degraded,
  Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentHealthState {
  pub status: AgentStatus,
  pub last_check: Option<DateTime<Utc>>,
  pub last_success: Option<DateTime<Utc>>,
  pub consecutive_failures: u32,
  pub total_checks: u64,
  pub total_failures: u64,
  pub uptime_percentage: f64,
  pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
  pub previous: AgentStatus,
  pub current: AgentStatus,
  /// Set only on the check that reaches the alert threshold.
  pub alert: bool,
}

impl CheckOutcome {
  /// True when a healthy probe follows any other status, including the first check.
  pub fn recovered(&self) -> bool {
    self.current == AgentStatus::Healthy && self.previous != AgentStatus::Healthy
  }
}

impl AgentHealthState {
  /// Folds one probe result into the state. `Err` carries the probe error text.
  pub fn record(&mut self, probe: std::result::Result<bool, String>, now: DateTime<Utc>) -> CheckOutcome {
    let previous = self.status;
    self.last_check = Some(now);
    self.total_checks += 1;

    let mut alert = false;
    match probe {
      Ok(true) => {
        self.status = AgentStatus::Healthy;
        self.last_success = Some(now);
        self.consecutive_failures = 0;
        self.last_error = None;
      }
      failed => {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.last_error = Some(match failed {
          Err(e) => e,
          _ => "agent reported unhealthy".to_string(),
        });
        if self.consecutive_failures >= ALERT_THRESHOLD {
          self.status = AgentStatus::Failed;
          alert = self.consecutive_failures == ALERT_THRESHOLD;
        } else {
          self.status = AgentStatus::Degraded;
        }
      }
    }

    let successful = self.total_checks - self.total_failures;
    self.uptime_percentage = successful as f64 / self.total_checks as f64 * 100.0;

    CheckOutcome {
      previous,
      current: self.status,
      alert,
    }
  }
}

struct Shared {
  probe: Arc<dyn HealthProbe>,
  sink: Arc<dyn AlertSink>,
  states: RwLock<HashMap<String, AgentHealthState>>,
}

impl Shared {
  async fn check(&self, agent_id: &str) {
    let probe = self.probe.probe(agent_id).await.map_err(|e| e.to_string());
    if let Err(e) = &probe {
      error!(agent_id = %agent_id, error = %e, "Health check error");
    }

    let mut states = self.states.write().await;
    let Some(state) = states.get_mut(agent_id) else {
      return;
    };
    let outcome = state.record(probe, Utc::now());

    if outcome.recovered() {
      info!(agent_id = %agent_id, previous = ?outcome.previous, "Agent recovered");
    } else if outcome.current == AgentStatus::Degraded && outcome.previous != AgentStatus::Degraded {
      warn!(agent_id = %agent_id, "Agent degraded");
    }

    if outcome.alert {
      let alert = AgentAlert {
        agent_id: agent_id.to_string(),
        consecutive_failures: state.consecutive_failures,
        last_error: state.last_error.clone(),
        uptime_percentage: state.uptime_percentage,
        raised_at: Utc::now(),
      };
      drop(states);
      self.sink.alert(&alert);
    }
  }
}

pub struct HealthMonitor {
  shared: Arc<Shared>,
  tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HealthMonitor {
  pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
    Self::with_alert_sink(probe, Arc::new(LogAlertSink))
  }

  pub fn with_alert_sink(probe: Arc<dyn HealthProbe>, sink: Arc<dyn AlertSink>) -> Self {
    Self {
      shared: Arc::new(Shared {
        probe,
        sink,
        states: RwLock::new(HashMap::new()),
      }),
      tasks: Mutex::new(HashMap::new()),
    }
  }

  /// Starts a loop for every target the probe source knows about.
  pub async fn start(&self) -> usize {
    for (agent_id, interval) in self.shared.probe.targets().await {
      self.start_monitoring(&agent_id, interval).await;
    }
    let count = self.tasks.lock().await.len();
    info!(count, "Health monitoring started");
    count
  }

  /// Returns false when the agent is already being monitored.
  pub async fn start_monitoring(&self, agent_id: &str, interval: Duration) -> bool {
    let mut tasks = self.tasks.lock().await;
    if tasks.contains_key(agent_id) {
      warn!(agent_id = %agent_id, "Already monitoring agent");
      return false;
    }
    self
      .shared
      .states
      .write()
      .await
      .insert(agent_id.to_string(), AgentHealthState::default());

    let shared = Arc::clone(&self.shared);
    let id = agent_id.to_string();
    let handle = tokio::spawn(async move {
      loop {
        shared.check(&id).await;
        tokio::time::sleep(interval).await;
      }
    });
    tasks.insert(agent_id.to_string(), handle);
    info!(agent_id = %agent_id, interval = ?interval, "Started monitoring agent");
    true
  }

  /// Cancels every loop and waits for all of them before dropping their state.
  pub async fn stop(&self) {
    let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain().map(|(_, handle)| handle).collect();
    for handle in &handles {
      handle.abort();
    }
    join_all(handles).await;
    self.shared.states.write().await.clear();
    info!("Health monitoring stopped");
  }

  pub async fn is_monitoring(&self, agent_id: &str) -> bool {
    self.tasks.lock().await.contains_key(agent_id)
  }

  pub async fn status(&self, agent_id: &str) -> Option<AgentHealthState> {
    self.shared.states.read().await.get(agent_id).cloned()
  }

  pub async fn statuses(&self) -> HashMap<String, AgentHealthState> {
    self.shared.states.read().await.clone()
  }

  pub async fn healthy_agents(&self) -> Vec<String> {
    self.agents_with(AgentStatus::Healthy).await
  }

  pub async fn failed_agents(&self) -> Vec<String> {
    self.agents_with(AgentStatus::Failed).await
  }

  async fn agents_with(&self, status: AgentStatus) -> Vec<String> {
    let mut ids: Vec<String> = self
      .shared
      .states
      .read()
      .await
      .iter()
      .filter(|(_, state)| state.status == status)
      .map(|(agent_id, _)| agent_id.clone())
      .collect();
    ids.sort();
    ids
  }
}
