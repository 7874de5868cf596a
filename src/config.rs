use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::models::AgentMode;

static AGENT_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w.\-]+$").unwrap());

fn validate_agent_id(agent_id: &str) -> Result<()> {
  if AGENT_ID.is_match(agent_id) {
    Ok(())
  } else {
    Err(FleetError::InvalidConfig(format!("invalid agent id '{}'", agent_id)))
  }
}

fn var_or<T: FromStr>(vars: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
  match vars(key) {
    Some(raw) => raw
      .trim()
      .parse()
      .map_err(|_| FleetError::InvalidConfig(format!("{}={} is not valid", key, raw))),
    None => Ok(default),
  }
}

/// Settings of one agent process.
#[derive(Debug, Clone)]
pub struct Config {
  pub agent_id: String,
  pub mode: AgentMode,
  pub server_port: u16,
  pub auth_token: Option<String>,
  pub max_concurrent_jobs: usize,
  pub max_queued_jobs: usize,
  pub job_timeout: Duration,
  /// How long finished jobs stay queryable. `None` keeps them forever.
  pub job_retention: Option<Duration>,
  pub scheduler_tick: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      agent_id: "default-agent".into(),
      mode: AgentMode::Serve,
      server_port: 9090,
      auth_token: None,
      max_concurrent_jobs: 3,
      max_queued_jobs: 10,
      job_timeout: Duration::from_secs(3600),
      job_retention: Some(Duration::from_secs(3600)),
      scheduler_tick: Duration::from_secs(1),
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_vars(|key| env::var(key).ok())
  }

  /// Builds the config from any variable source; `from_env` passes the process environment.
  pub fn from_vars(vars: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let defaults = Self::default();
    let agent_id = vars("AGENT_ID").unwrap_or(defaults.agent_id);
    validate_agent_id(&agent_id)?;

    let mode = match vars("AGENT_MODE") {
      Some(raw) => raw.parse().map_err(FleetError::InvalidConfig)?,
      None => defaults.mode,
    };

    let max_concurrent_jobs = var_or(&vars, "MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?;
    if max_concurrent_jobs == 0 {
      return Err(FleetError::InvalidConfig("MAX_CONCURRENT_JOBS must be at least 1".into()));
    }

    let tick_ms: u64 = var_or(&vars, "SCHEDULER_TICK_MS", 1000)?;
    if tick_ms == 0 {
      return Err(FleetError::InvalidConfig("SCHEDULER_TICK_MS must be at least 1".into()));
    }

    let retention_secs: u64 = var_or(&vars, "JOB_RETENTION_SECS", 3600)?;

    Ok(Self {
      agent_id,
      mode,
      server_port: var_or(&vars, "AGENT_PORT", defaults.server_port)?,
      auth_token: vars("AGENT_AUTH_TOKEN").filter(|t| !t.is_empty()),
      max_concurrent_jobs,
      max_queued_jobs: var_or(&vars, "MAX_QUEUED_JOBS", defaults.max_queued_jobs)?,
      job_timeout: Duration::from_secs(var_or(&vars, "JOB_TIMEOUT_SECS", 3600)?),
      job_retention: (retention_secs > 0).then(|| Duration::from_secs(retention_secs)),
      scheduler_tick: Duration::from_millis(tick_ms),
    })
  }
}

fn default_timeout() -> u64 {
  300
}

fn default_health_check_interval() -> u64 {
  60
}

/// Identity and connection policy of one remote agent, as the controller sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
  pub agent_id: String,
  pub endpoint: String,
  #[serde(default)]
  pub mode: AgentMode,
  #[serde(default)]
  pub auth_token: Option<String>,
  /// Default per-job timeout in seconds.
  #[serde(default = "default_timeout")]
  pub timeout: u64,
  /// Seconds between health probes.
  #[serde(default = "default_health_check_interval")]
  pub health_check_interval: u64,
}

impl AgentConfig {
  pub fn new(agent_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
    Self {
      agent_id: agent_id.into(),
      endpoint: endpoint.into(),
      mode: AgentMode::Serve,
      auth_token: None,
      timeout: default_timeout(),
      health_check_interval: default_health_check_interval(),
    }
  }

  pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
    self.auth_token = Some(token.into());
    self
  }

  pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
    self.health_check_interval = interval.as_secs().max(1);
    self
  }

  pub fn job_timeout(&self) -> Duration {
    Duration::from_secs(self.timeout)
  }

  pub fn health_check_interval(&self) -> Duration {
    Duration::from_secs(self.health_check_interval)
  }

  pub fn validate(&self) -> Result<()> {
    validate_agent_id(&self.agent_id)?;
    if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
      return Err(FleetError::InvalidConfig(format!(
        "agent '{}' endpoint must be an http(s) URL",
        self.agent_id
      )));
    }
    if self.health_check_interval == 0 {
      return Err(FleetError::InvalidConfig(format!(
        "agent '{}' health_check_interval must be positive",
        self.agent_id
      )));
    }
    Ok(())
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FleetFile {
  Wrapped { agents: Vec<AgentConfig> },
  List(Vec<AgentConfig>),
}

/// Reads agent definitions from a JSON file, either a bare list or `{"agents": [...]}`.
pub fn load_agent_configs(path: impl AsRef<Path>) -> Result<Vec<AgentConfig>> {
  let path = path.as_ref();
  let raw = fs::read_to_string(path)
    .map_err(|e| FleetError::InvalidConfig(format!("cannot read {}: {}", path.display(), e)))?;
  parse_agent_configs(&raw)
}

pub fn parse_agent_configs(raw: &str) -> Result<Vec<AgentConfig>> {
  let agents = match serde_json::from_str(raw)
    .map_err(|e| FleetError::InvalidConfig(format!("malformed fleet file: {}", e)))?
  {
    FleetFile::Wrapped { agents } => agents,
    FleetFile::List(agents) => agents,
  };
  for agent in &agents {
    agent.validate()?;
  }
  Ok(agents)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
    let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Config::from_vars(|key| vars.get(key).cloned())
  }

  #[test]
  fn agent_config_defaults_and_overrides() {
    let config = config_from(&[]).unwrap();
    assert_eq!(config.scheduler_tick, Duration::from_secs(1));
    assert_eq!(config.job_retention, Some(Duration::from_secs(3600)));

    let config = config_from(&[("SCHEDULER_TICK_MS", "250"), ("JOB_RETENTION_SECS", "0"), ("AGENT_AUTH_TOKEN", "")]).unwrap();
    assert_eq!(config.scheduler_tick, Duration::from_millis(250));
    assert_eq!(config.job_retention, None);
    assert_eq!(config.auth_token, None);
  }

  #[test]
  fn zero_tick_and_zero_concurrency_are_rejected() {
    assert!(matches!(config_from(&[("SCHEDULER_TICK_MS", "0")]), Err(FleetError::InvalidConfig(_))));
    assert!(matches!(config_from(&[("MAX_CONCURRENT_JOBS", "0")]), Err(FleetError::InvalidConfig(_))));
    assert!(matches!(config_from(&[("AGENT_PORT", "http")]), Err(FleetError::InvalidConfig(_))));
  }

  #[test]
  fn parses_wrapped_and_bare_fleet_files() {
    let wrapped = r#"{"agents": [{"agent_id": "vm1", "endpoint": "http://vm1:9090", "auth_token": "t"}]}"#;
    let agents = parse_agent_configs(wrapped).unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].timeout, 300);
    assert_eq!(agents[0].health_check_interval(), Duration::from_secs(60));
    assert_eq!(agents[0].auth_token.as_deref(), Some("t"));

    let bare = r#"[{"agent_id": "vm2", "endpoint": "https://vm2", "mode": "emit", "health_check_interval": 5}]"#;
    let agents = parse_agent_configs(bare).unwrap();
    assert_eq!(agents[0].mode, AgentMode::Emit);
    assert_eq!(agents[0].health_check_interval, 5);
  }

  #[test]
  fn rejects_bad_ids_and_endpoints() {
    let bad_id = r#"[{"agent_id": "vm 1; rm", "endpoint": "http://vm1"}]"#;
    assert!(matches!(parse_agent_configs(bad_id), Err(FleetError::InvalidConfig(_))));

    let bad_endpoint = r#"[{"agent_id": "vm1", "endpoint": "vm1:9090"}]"#;
    assert!(matches!(parse_agent_configs(bad_endpoint), Err(FleetError::InvalidConfig(_))));
  }
}
