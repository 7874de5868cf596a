use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aptfleet::error::{FleetError, Result};
use aptfleet::health_monitor::{AgentAlert, AgentStatus, AlertSink, HealthMonitor, HealthProbe};
use futures::FutureExt;
use futures::future::BoxFuture;

/// Probe that answers from a per-agent script and reports healthy once the
/// script runs out.
#[derive(Default)]
struct ScriptedProbe {
  scripts: Mutex<HashMap<String, VecDeque<Option<bool>>>>,
  intervals: Vec<(String, Duration)>,
}

impl ScriptedProbe {
  fn new(agent_id: &str, interval: Duration, script: Vec<Option<bool>>) -> Self {
    Self {
      scripts: Mutex::new(HashMap::from([(agent_id.to_string(), script.into())])),
      intervals: vec![(agent_id.to_string(), interval)],
    }
  }
}

impl HealthProbe for ScriptedProbe {
  fn targets(&self) -> BoxFuture<'_, Vec<(String, Duration)>> {
    let targets = self.intervals.clone();
    async move { targets }.boxed()
  }

  fn probe<'a>(&'a self, agent_id: &'a str) -> BoxFuture<'a, Result<bool>> {
    let next = self
      .scripts
      .lock()
      .unwrap()
      .get_mut(agent_id)
      .and_then(|script| script.pop_front())
      .unwrap_or(Some(true));
    async move {
      match next {
        Some(healthy) => Ok(healthy),
        None => Err(FleetError::RequestTimeout),
      }
    }
    .boxed()
  }
}

#[derive(Default)]
struct RecordingSink {
  alerts: Mutex<Vec<AgentAlert>>,
}

impl AlertSink for RecordingSink {
  fn alert(&self, alert: &AgentAlert) {
    self.alerts.lock().unwrap().push(alert.clone());
  }
}

const INTERVAL: Duration = Duration::from_secs(10);

/// Lets the loop run its check for the current instant.
async fn settle() {
  for _ in 0..10 {
    tokio::task::yield_now().await;
  }
}

#[tokio::test(start_paused = true)]
async fn test_status_transitions_and_single_alert() {
  let probe = Arc::new(ScriptedProbe::new(
    "vm1",
    INTERVAL,
    vec![Some(true), Some(false), None, Some(false), Some(false), Some(true)],
  ));
  let sink = Arc::new(RecordingSink::default());
  let monitor = HealthMonitor::with_alert_sink(probe, sink.clone());
  assert_eq!(monitor.start().await, 1);

  let mut observed = Vec::new();
  for _ in 0..6 {
    settle().await;
    observed.push(monitor.status("vm1").await.unwrap().status);
    tokio::time::advance(INTERVAL).await;
  }

  assert_eq!(
    observed,
    vec![
      AgentStatus::Healthy,
      AgentStatus::Degraded,
      AgentStatus::Degraded,
      AgentStatus::Failed,
      AgentStatus::Failed,
      AgentStatus::Healthy,
    ]
  );

  let alerts = sink.alerts.lock().unwrap().clone();
  assert_eq!(alerts.len(), 1);
  assert_eq!(alerts[0].agent_id, "vm1");
  assert_eq!(alerts[0].consecutive_failures, 3);

  let state = monitor.status("vm1").await.unwrap();
  assert_eq!(state.total_checks, 6);
  assert_eq!(state.total_failures, 4);
  assert_eq!(state.consecutive_failures, 0);
  assert!(state.last_error.is_none());

  monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_healthy_and_failed_listings() {
  let probe = Arc::new(ScriptedProbe::new("flaky", INTERVAL, vec![None, None, None, None]));
  let monitor = HealthMonitor::new(probe);
  monitor.start_monitoring("steady", INTERVAL).await;
  monitor.start_monitoring("flaky", INTERVAL).await;

  for _ in 0..3 {
    settle().await;
    tokio::time::advance(INTERVAL).await;
  }
  settle().await;

  assert_eq!(monitor.healthy_agents().await, vec!["steady".to_string()]);
  assert_eq!(monitor.failed_agents().await, vec!["flaky".to_string()]);
  let flaky = monitor.status("flaky").await.unwrap();
  assert!(flaky.last_error.unwrap().contains("timed out"));
  assert_eq!(flaky.uptime_percentage, 0.0);

  monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_monitoring_is_refused() {
  let monitor = HealthMonitor::new(Arc::new(ScriptedProbe::default()));
  assert!(monitor.start_monitoring("vm1", INTERVAL).await);
  assert!(!monitor.start_monitoring("vm1", INTERVAL).await);
  assert!(monitor.is_monitoring("vm1").await);
  monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_every_loop() {
  let monitor = HealthMonitor::new(Arc::new(ScriptedProbe::default()));
  monitor.start_monitoring("a", INTERVAL).await;
  monitor.start_monitoring("b", INTERVAL).await;
  settle().await;
  assert_eq!(monitor.statuses().await.len(), 2);

  monitor.stop().await;
  assert!(!monitor.is_monitoring("a").await);
  assert!(monitor.statuses().await.is_empty());

  // nothing left running to repopulate state
  tokio::time::advance(INTERVAL * 3).await;
  settle().await;
  assert!(monitor.status("a").await.is_none());

  monitor.stop().await;
}
