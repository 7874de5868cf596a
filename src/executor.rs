//! Workload execution.
//!
//! The scheduler treats workloads as opaque and hands them to an [`Executor`].
//! The agent binary uses [`ShellExecutor`], which runs the workload code with
//! `sh -c`. Lines printed as `##progress <pct>` update the job's progress and
//! the remaining stdout becomes the result (parsed as JSON when possible).

use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

use crate::models::Workload;

static PROGRESS_LINE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^##progress\s+(\d+(?:\.\d+)?)\s*$").unwrap());
static ENV_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

pub trait Executor: Send + Sync + 'static {
  /// Runs one workload to completion. Dropping the returned future must stop
  /// the workload; that is how cancellation and timeouts reach it.
  fn execute(&self, workload: Workload, progress: ProgressReporter) -> BoxFuture<'static, Result<Value>>;
}

/// Write side of a job's progress indicator.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
  tx: watch::Sender<f64>,
}

impl ProgressReporter {
  pub fn channel() -> (Self, watch::Receiver<f64>) {
    let (tx, rx) = watch::channel(0.0);
    (Self { tx }, rx)
  }

  /// A reporter nobody listens to, for the synchronous path.
  pub fn detached() -> Self {
    Self::channel().0
  }

  pub fn report(&self, percent: f64) {
    if percent.is_finite() {
      self.tx.send_replace(percent.clamp(0.0, 100.0));
    }
  }
}

#[derive(Debug, Clone)]
pub struct ShellExecutor {
  shell: String,
}

impl Default for ShellExecutor {
  fn default() -> Self {
    Self { shell: "sh".into() }
  }
}

impl ShellExecutor {
  pub fn new(shell: impl Into<String>) -> Self {
    Self { shell: shell.into() }
  }
}

impl Executor for ShellExecutor {
  fn execute(&self, workload: Workload, progress: ProgressReporter) -> BoxFuture<'static, Result<Value>> {
    let shell = self.shell.clone();
    async move { run_shell(&shell, workload, progress).await }.boxed()
  }
}

async fn run_shell(shell: &str, workload: Workload, progress: ProgressReporter) -> Result<Value> {
  let mut child = Command::new(shell)
    .arg("-c")
    .arg(&workload.code)
    .env("APT_CONTEXT", serde_json::to_string(&workload.context)?)
    .envs(context_env(&workload.context))
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .context("failed to spawn workload")?;

  let stdout = child.stdout.take().context("workload stdout unavailable")?;
  let stderr = child.stderr.take().context("workload stderr unavailable")?;

  let read_stdout = async {
    let mut lines = BufReader::new(stdout).lines();
    let mut output = Vec::new();
    while let Some(line) = lines.next_line().await? {
      match parse_progress(&line) {
        Some(percent) => {
          debug!(percent, "workload progress");
          progress.report(percent);
        }
        None => output.push(line),
      }
    }
    Ok::<_, std::io::Error>(output)
  };
  let read_stderr = async {
    let mut buf = String::new();
    BufReader::new(stderr).read_to_string(&mut buf).await?;
    Ok::<_, std::io::Error>(buf)
  };

  let (output, errors) = tokio::try_join!(read_stdout, read_stderr)?;
  let status = child.wait().await?;
  if !status.success() {
    let errors = errors.trim();
    if errors.is_empty() {
      bail!("workload exited with code {:?}", status.code());
    }
    bail!("{}", errors);
  }
  Ok(parse_output(&output.join("\n")))
}

fn parse_progress(line: &str) -> Option<f64> {
  PROGRESS_LINE.captures(line.trim()).and_then(|c| c[1].parse().ok())
}

fn parse_output(stdout: &str) -> Value {
  let trimmed = stdout.trim();
  if trimmed.is_empty() {
    return json!({"status": "success"});
  }
  serde_json::from_str(trimmed).unwrap_or_else(|_| json!({"stdout": trimmed}))
}

/// Context entries exposed as `APT_CTX_<KEY>` variables. Keys that are not
/// valid variable names are only reachable through `APT_CONTEXT`.
fn context_env(context: &Map<String, Value>) -> Vec<(String, String)> {
  context
    .iter()
    .filter(|(key, _)| ENV_KEY.is_match(key))
    .map(|(key, value)| {
      let value = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      (format!("APT_CTX_{}", key.to_ascii_uppercase()), value)
    })
    .collect()
}
