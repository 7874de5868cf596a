mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use aptfleet::error::FleetError;
use aptfleet::models::{FailureKind, JobState, Priority};
use common::{limits, scheduler, submit, wait_state, wait_terminal, workload};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_priority_order_with_single_slot() {
  let (scheduler, _) = scheduler(limits(1, 10));
  let low = submit(&scheduler, "sleep:50", Priority::Low).await;
  let urgent = submit(&scheduler, "sleep:50", Priority::Urgent).await;
  let normal = submit(&scheduler, "sleep:50", Priority::Normal).await;

  assert_eq!(scheduler.status(urgent).await.unwrap().queue_position, Some(1));
  assert_eq!(scheduler.status(normal).await.unwrap().queue_position, Some(2));
  assert_eq!(scheduler.status(low).await.unwrap().queue_position, Some(3));

  let mut order = Vec::new();
  for _ in 0..3 {
    let started = scheduler.tick().await;
    assert_eq!(started.len(), 1);
    // the slot stays taken until the job finishes
    assert!(scheduler.tick().await.is_empty());
    wait_terminal(&scheduler, started[0]).await;
    order.push(started[0]);
  }
  assert_eq!(order, vec![urgent, normal, low]);
}

#[tokio::test(start_paused = true)]
async fn test_fifo_within_priority() {
  let (scheduler, _) = scheduler(limits(1, 10));
  let first = submit(&scheduler, "sleep:10", Priority::High).await;
  let second = submit(&scheduler, "sleep:10", Priority::High).await;
  let third = submit(&scheduler, "sleep:10", Priority::High).await;

  let mut order = Vec::new();
  for _ in 0..3 {
    let started = scheduler.tick().await;
    wait_terminal(&scheduler, started[0]).await;
    order.push(started[0]);
  }
  assert_eq!(order, vec![first, second, third]);
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_rejection() {
  let (scheduler, _) = scheduler(limits(1, 1));
  let running = submit(&scheduler, "wait", Priority::Normal).await;
  submit(&scheduler, "wait", Priority::Normal).await;

  let rejected = scheduler
    .submit(workload("wait"), Duration::from_secs(60), Priority::Urgent)
    .await;
  assert!(matches!(rejected, Err(FleetError::Capacity(_))));

  assert_eq!(scheduler.tick().await, vec![running]);
  assert_eq!(scheduler.running_count().await, 1);
  assert_eq!(scheduler.queued_count().await, 1);

  // one running plus one queued still fills both budgets
  let rejected = scheduler
    .submit(workload("wait"), Duration::from_secs(60), Priority::Normal)
    .await;
  assert!(matches!(rejected, Err(FleetError::Capacity(_))));
  assert_eq!(scheduler.stats().await.total_jobs, 2);
}

#[tokio::test(start_paused = true)]
async fn test_running_never_exceeds_limit() {
  let (scheduler, executor) = scheduler(limits(2, 10));
  let mut ids = Vec::new();
  for ms in [30, 10, 50, 20, 40, 10] {
    ids.push(submit(&scheduler, &format!("sleep:{}", ms), Priority::Normal).await);
  }

  let mut done = 0;
  while done < ids.len() {
    scheduler.tick().await;
    assert!(scheduler.running_count().await <= 2);
    tokio::time::sleep(Duration::from_millis(5)).await;
    done = 0;
    for id in &ids {
      if scheduler.status(*id).await.unwrap().status.is_terminal() {
        done += 1;
      }
    }
  }

  assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
  assert_eq!(scheduler.stats().await.jobs_by_status.complete, 6);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_distinguished_from_error() {
  let (scheduler, _) = scheduler(limits(3, 10));
  let slow = scheduler
    .submit(workload("wait"), Duration::from_millis(100), Priority::Normal)
    .await
    .unwrap()
    .job_id;
  let broken = submit(&scheduler, "fail:disk full", Priority::Normal).await;
  let panicked = submit(&scheduler, "panic", Priority::Normal).await;
  assert_eq!(scheduler.tick().await.len(), 3);

  let slow = wait_terminal(&scheduler, slow).await;
  assert_eq!(slow.status, JobState::Failed);
  assert_eq!(slow.failure, Some(FailureKind::Timeout));
  assert!(slow.error.as_deref().unwrap().starts_with("Timeout"));

  let broken = wait_terminal(&scheduler, broken).await;
  assert_eq!(broken.failure, Some(FailureKind::Error));
  assert_eq!(broken.error.as_deref(), Some("disk full"));

  let panicked = wait_terminal(&scheduler, panicked).await;
  assert_eq!(panicked.failure, Some(FailureKind::Error));
  assert_eq!(panicked.error.as_deref(), Some("workload panicked"));

  assert_eq!(scheduler.running_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_result_follows_job_state() {
  let (scheduler, _) = scheduler(limits(1, 10));
  let done = submit(&scheduler, r#"ok:{"p95_ms": 250}"#, Priority::Normal).await;
  let failed = submit(&scheduler, "fail:bad input", Priority::Normal).await;

  assert!(matches!(scheduler.result(done).await, Err(FleetError::NotReady(JobState::Queued))));

  scheduler.tick().await;
  wait_terminal(&scheduler, done).await;
  let result = scheduler.result(done).await.unwrap();
  assert_eq!(result.status, JobState::Complete);
  assert_eq!(result.result, json!({"p95_ms": 250}));
  assert!(result.execution_time.is_some());

  scheduler.tick().await;
  wait_terminal(&scheduler, failed).await;
  match scheduler.result(failed).await {
    Err(FleetError::JobFailed(message)) => assert_eq!(message, "bad input"),
    other => panic!("unexpected result {:?}", other.map(|r| r.status)),
  }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_and_running_jobs() {
  let (scheduler, executor) = scheduler(limits(1, 10));
  let running = submit(&scheduler, "wait", Priority::Normal).await;
  let queued = submit(&scheduler, "wait", Priority::Normal).await;
  scheduler.tick().await;
  wait_state(&scheduler, running, JobState::Running).await;
  tokio::time::sleep(Duration::from_millis(10)).await;
  assert_eq!(executor.active.load(Ordering::SeqCst), 1);

  assert_eq!(scheduler.cancel(queued).await.unwrap(), JobState::Queued);
  assert_eq!(scheduler.queued_count().await, 0);
  assert!(matches!(scheduler.status(queued).await, Err(FleetError::JobNotFound(_))));

  assert_eq!(scheduler.cancel(running).await.unwrap(), JobState::Running);
  assert_eq!(scheduler.running_count().await, 0);
  tokio::time::sleep(Duration::from_millis(10)).await;
  assert_eq!(executor.dropped.load(Ordering::SeqCst), 1);
  assert_eq!(executor.active.load(Ordering::SeqCst), 0);

  assert!(matches!(scheduler.cancel(running).await, Err(FleetError::JobNotFound(_))));
  assert_eq!(scheduler.stats().await.cancelled_total, 2);
}

#[tokio::test(start_paused = true)]
async fn test_progress_visible_while_running() {
  let (scheduler, _) = scheduler(limits(1, 10));
  let job = submit(&scheduler, "progress:40", Priority::Normal).await;
  scheduler.tick().await;
  wait_state(&scheduler, job, JobState::Running).await;
  tokio::time::sleep(Duration::from_millis(10)).await;

  let view = scheduler.status(job).await.unwrap();
  assert_eq!(view.progress, Some(40.0));
  assert!(view.message.contains("40.0%"));
  assert!(matches!(scheduler.result(job).await, Err(FleetError::NotReady(JobState::Running))));
}

#[tokio::test(start_paused = true)]
async fn test_finished_jobs_purged_after_retention() {
  let mut short = limits(1, 10);
  short.job_retention = Some(Duration::ZERO);
  let (scheduler, _) = scheduler(short);
  let job = submit(&scheduler, "ok:{}", Priority::Normal).await;
  let waiting = submit(&scheduler, "ok:{}", Priority::Low).await;

  scheduler.tick().await;
  wait_terminal(&scheduler, job).await;
  scheduler.tick().await;

  assert!(matches!(scheduler.status(job).await, Err(FleetError::JobNotFound(_))));
  // unfinished jobs are never purged
  assert!(scheduler.status(waiting).await.is_ok());

  let (keeper, _) = common::scheduler(limits(1, 10));
  let kept = submit(&keeper, "ok:{}", Priority::Normal).await;
  keeper.tick().await;
  wait_terminal(&keeper, kept).await;
  keeper.tick().await;
  assert_eq!(keeper.status(kept).await.unwrap().status, JobState::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_stats_and_listing() {
  let (scheduler, _) = scheduler(limits(2, 5));
  let a = submit(&scheduler, "ok:1", Priority::Normal).await;
  let b = submit(&scheduler, "fail:nope", Priority::Normal).await;
  submit(&scheduler, "wait", Priority::Normal).await;

  scheduler.tick().await;
  wait_terminal(&scheduler, a).await;
  wait_terminal(&scheduler, b).await;

  let stats = scheduler.stats().await;
  assert_eq!(stats.running, 0);
  assert_eq!(stats.queued, 1);
  assert_eq!(stats.available_slots, 2);
  assert_eq!(stats.total_jobs, 3);
  assert_eq!(stats.jobs_by_status.complete, 1);
  assert_eq!(stats.jobs_by_status.failed, 1);
  assert_eq!(stats.jobs_by_status.queued, 1);

  let listed = scheduler.list().await;
  assert_eq!(listed.len(), 3);
  assert!(listed.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[tokio::test(start_paused = true)]
async fn test_spawned_ticker_drives_jobs() {
  let (scheduler, _) = scheduler(limits(1, 10));
  let ticker = scheduler.spawn();
  let job = submit(&scheduler, "sleep:30", Priority::Normal).await;

  let view = wait_terminal(&scheduler, job).await;
  assert_eq!(view.status, JobState::Complete);
  ticker.abort();
}
