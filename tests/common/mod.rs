#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use aptfleet::config::Config;
use aptfleet::executor::{Executor, ProgressReporter};
use aptfleet::job_scheduler::{Scheduler, SchedulerLimits};
use aptfleet::models::{JobState, JobView, Priority, Workload};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use uuid::Uuid;

/// Executor driven by the workload code:
///
/// - `sleep:<ms>` sleeps, then returns `{"slept_ms": ms}`
/// - `ok:<json>` returns the JSON at once
/// - `fail:<message>` fails with the message
/// - `panic` panics
/// - `progress:<pct>` reports progress, then never finishes
/// - `wait` never finishes
#[derive(Default)]
pub struct ScriptedExecutor {
  pub active: Arc<AtomicUsize>,
  pub peak: Arc<AtomicUsize>,
  pub dropped: Arc<AtomicUsize>,
}

struct ActiveGuard {
  active: Arc<AtomicUsize>,
  dropped: Arc<AtomicUsize>,
  finished: bool,
}

impl Drop for ActiveGuard {
  fn drop(&mut self) {
    self.active.fetch_sub(1, Ordering::SeqCst);
    if !self.finished {
      self.dropped.fetch_add(1, Ordering::SeqCst);
    }
  }
}

impl Executor for ScriptedExecutor {
  fn execute(&self, workload: Workload, progress: ProgressReporter) -> BoxFuture<'static, anyhow::Result<Value>> {
    let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now_active, Ordering::SeqCst);
    let guard = ActiveGuard {
      active: Arc::clone(&self.active),
      dropped: Arc::clone(&self.dropped),
      finished: false,
    };

    async move {
      // move the whole guard into the future, not just the `finished` field
      let mut guard = guard;
      let code = workload.code;
      let (verb, arg) = code.split_once(':').unwrap_or((code.as_str(), ""));
      let outcome = match verb {
        "sleep" => {
          let ms: u64 = arg.parse()?;
          tokio::time::sleep(Duration::from_millis(ms)).await;
          Ok(json!({"slept_ms": ms}))
        }
        "ok" => Ok(serde_json::from_str(arg)?),
        "fail" => Err(anyhow!("{}", arg)),
        "panic" => panic!("scripted panic"),
        "progress" => {
          progress.report(arg.parse()?);
          futures::future::pending::<()>().await;
          unreachable!()
        }
        "wait" => {
          futures::future::pending::<()>().await;
          unreachable!()
        }
        other => Err(anyhow!("unknown script '{}'", other)),
      };
      guard.finished = true;
      outcome
    }
    .boxed()
  }
}

pub fn limits(max_concurrent_jobs: usize, max_queued_jobs: usize) -> SchedulerLimits {
  SchedulerLimits {
    max_concurrent_jobs,
    max_queued_jobs,
    tick_interval: Duration::from_millis(20),
    job_retention: None,
  }
}

pub fn scheduler(limits: SchedulerLimits) -> (Scheduler, Arc<ScriptedExecutor>) {
  let executor = Arc::new(ScriptedExecutor::default());
  (Scheduler::new(limits, executor.clone()), executor)
}

pub fn workload(code: &str) -> Workload {
  Workload {
    code: code.to_string(),
    context: Default::default(),
  }
}

pub async fn submit(scheduler: &Scheduler, code: &str, priority: Priority) -> Uuid {
  scheduler
    .submit(workload(code), Duration::from_secs(60), priority)
    .await
    .expect("job admitted")
    .job_id
}

/// Polls until the job reaches a terminal state.
pub async fn wait_terminal(scheduler: &Scheduler, job_id: Uuid) -> JobView {
  for _ in 0..500 {
    let view = scheduler.status(job_id).await.expect("job exists");
    if view.status.is_terminal() {
      return view;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("job {} never finished", job_id);
}

pub async fn wait_state(scheduler: &Scheduler, job_id: Uuid, state: JobState) {
  for _ in 0..500 {
    if matches!(scheduler.status(job_id).await, Ok(view) if view.status == state) {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("job {} never reached {}", job_id, state);
}

pub fn agent_config(token: Option<&str>, max_concurrent_jobs: usize, max_queued_jobs: usize) -> Config {
  Config {
    agent_id: "test-agent".into(),
    auth_token: token.map(str::to_string),
    max_concurrent_jobs,
    max_queued_jobs,
    scheduler_tick: Duration::from_millis(20),
    job_retention: None,
    ..Config::default()
  }
}
