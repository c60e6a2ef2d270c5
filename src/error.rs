use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
  #[error("Database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("Migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Failed to spawn worker {worker_id}: {source}")]
  Spawn {
    worker_id: String,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to signal pid {pid}: {message}")]
  Signal { pid: u32, message: String },

  #[error("Arbiter is not running")]
  ArbiterClosed,

  #[error("Job not found: {0}")]
  JobNotFound(uuid::Uuid),
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Why a job did not complete. The variant name is what lands in a history
/// entry's `error_class`.
#[derive(Error, Debug)]
pub enum JobError {
  #[error("{0}")]
  Handler(#[from] anyhow::Error),

  #[error("job exceeded timeout of {}s", .0.as_secs())]
  Timeout(Duration),

  #[error("Unknown job class: {0}")]
  UnknownClass(String),

  #[error("Invalid payload: {0}")]
  InvalidPayload(String),
}

impl JobError {
  pub fn class(&self) -> &'static str {
    match self {
      JobError::Handler(_) => "HandlerError",
      JobError::Timeout(_) => "Timeout",
      JobError::UnknownClass(_) => "UnknownJobClass",
      JobError::InvalidPayload(_) => "InvalidPayload",
    }
  }
}
