use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

/// TTLs and bounds for everything kept in the shared store.
#[derive(Debug, Clone)]
pub struct StateSettings {
  pub worker_ttl: Duration,
  pub history_ttl: Duration,
  pub assignment_ttl: Duration,
  pub history_cap: usize,
}

impl Default for StateSettings {
  fn default() -> Self {
    Self {
      worker_ttl: Duration::from_secs(300),
      history_ttl: Duration::from_secs(3600),
      assignment_ttl: Duration::from_secs(600),
      history_cap: 100,
    }
  }
}

#[derive(Debug, Clone, Args)]
pub struct StateArgs {
  #[arg(long, env = "FLOW_WORKER_TTL_SECS", default_value_t = 300)]
  pub worker_ttl_secs: u64,

  #[arg(long, env = "FLOW_HISTORY_TTL_SECS", default_value_t = 3600)]
  pub history_ttl_secs: u64,

  #[arg(long, env = "FLOW_ASSIGNMENT_TTL_SECS", default_value_t = 600)]
  pub assignment_ttl_secs: u64,

  /// Entries kept per worker history
  #[arg(long, env = "FLOW_HISTORY_CAP", default_value_t = 100)]
  pub history_cap: usize,
}

impl StateArgs {
  /// The same settings as environment variables, for child processes.
  pub fn env_vars(&self) -> Vec<(&'static str, String)> {
    vec![
      ("FLOW_WORKER_TTL_SECS", self.worker_ttl_secs.to_string()),
      ("FLOW_HISTORY_TTL_SECS", self.history_ttl_secs.to_string()),
      ("FLOW_ASSIGNMENT_TTL_SECS", self.assignment_ttl_secs.to_string()),
      ("FLOW_HISTORY_CAP", self.history_cap.to_string()),
    ]
  }
}

impl From<&StateArgs> for StateSettings {
  fn from(args: &StateArgs) -> Self {
    Self {
      worker_ttl: Duration::from_secs(args.worker_ttl_secs),
      history_ttl: Duration::from_secs(args.history_ttl_secs),
      assignment_ttl: Duration::from_secs(args.assignment_ttl_secs),
      history_cap: args.history_cap.max(1),
    }
  }
}

/// Start Flow, a queue supervisor with real-time visibility
#[derive(Debug, Clone, Parser)]
#[command(name = "flow")]
pub struct SupervisorArgs {
  #[arg(long, env = "DATABASE_URL")]
  pub database_url: String,

  /// Number of workers to spawn
  #[arg(long, default_value_t = 3)]
  pub workers: usize,

  /// Comma-separated list of queues
  #[arg(long, default_value = "default", value_delimiter = ',')]
  pub queues: Vec<String>,

  /// Dashboard port
  #[arg(long, env = "SERVER_PORT", default_value_t = 8080)]
  pub dashboard: u16,

  #[arg(long, default_value_t = 2000)]
  pub poll_interval_ms: u64,

  /// Wait between the graceful and the forced stop of a worker
  #[arg(long, default_value_t = 5000)]
  pub grace_ms: u64,

  /// Worker executable; defaults to `flow_worker` next to this binary
  #[arg(long, env = "FLOW_WORKER_BIN")]
  pub worker_bin: Option<PathBuf>,

  #[command(flatten)]
  pub state: StateArgs,
}

impl SupervisorArgs {
  pub fn supervisor_config(&self) -> SupervisorConfig {
    SupervisorConfig {
      poll_interval: Duration::from_millis(self.poll_interval_ms),
      grace_window: Duration::from_millis(self.grace_ms),
      state: StateSettings::from(&self.state),
    }
  }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
  pub poll_interval: Duration,
  pub grace_window: Duration,
  pub state: StateSettings,
}

impl Default for SupervisorConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(2),
      grace_window: Duration::from_secs(5),
      state: StateSettings::default(),
    }
  }
}

/// Flow worker process that tracks its own job processing
#[derive(Debug, Clone, Parser)]
#[command(name = "flow_worker")]
pub struct WorkerArgs {
  pub worker_id: String,

  #[arg(long, default_value = "default")]
  pub queue: String,

  #[arg(long, env = "DATABASE_URL")]
  pub database_url: String,

  /// Attempts before a job is moved to failed_jobs
  #[arg(long, default_value_t = 3)]
  pub tries: u32,

  #[arg(long, default_value_t = 60)]
  pub timeout_secs: u64,

  /// Pause when the queue is empty
  #[arg(long, default_value_t = 3)]
  pub sleep_secs: u64,

  /// Reservations older than this are handed out again
  #[arg(long, default_value_t = 90)]
  pub retry_after_secs: u64,

  #[command(flatten)]
  pub state: StateArgs,
}

impl WorkerArgs {
  pub fn policy(&self) -> JobPolicy {
    JobPolicy {
      tries: self.tries.max(1),
      timeout: Duration::from_secs(self.timeout_secs),
      retry_after: Duration::from_secs(self.retry_after_secs),
    }
  }
}

/// Retry and timeout rules owned by the job source.
#[derive(Debug, Clone, Copy)]
pub struct JobPolicy {
  pub tries: u32,
  pub timeout: Duration,
  pub retry_after: Duration,
}

impl Default for JobPolicy {
  fn default() -> Self {
    Self {
      tries: 3,
      timeout: Duration::from_secs(60),
      retry_after: Duration::from_secs(90),
    }
  }
}

/// Push test jobs onto a queue
#[derive(Debug, Clone, Parser)]
#[command(name = "flow_dispatch")]
pub struct DispatchArgs {
  #[arg(long, env = "DATABASE_URL")]
  pub database_url: String,

  #[arg(long, default_value = "default")]
  pub queue: String,

  #[arg(long, default_value_t = 1)]
  pub count: usize,

  #[arg(long, default_value_t = 3)]
  pub sleep_secs: u64,

  /// Defaults to cycling through a few canned messages
  #[arg(long)]
  pub message: Option<String>,
}
