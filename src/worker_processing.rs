use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::info;

use crate::error::JobError;
use crate::job_source::ReservedJob;

#[async_trait]
pub trait JobHandler: Send + Sync {
  async fn handle(&self, job: &ReservedJob, worker_id: &str) -> Result<(), JobError>;
}

/// Job class name to handler.
#[derive(Clone, Default)]
pub struct Handlers {
  by_class: HashMap<String, Arc<dyn JobHandler>>,
}

impl Handlers {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the built-in job classes.
  pub fn with_defaults() -> Self {
    let mut handlers = Self::new();
    handlers.register(TestJob::CLASS, TestJob);
    handlers
  }

  pub fn register(&mut self, class: &str, handler: impl JobHandler + 'static) -> &mut Self {
    self.by_class.insert(class.to_string(), Arc::new(handler));
    self
  }

  pub fn get(&self, class: &str) -> Option<Arc<dyn JobHandler>> {
    self.by_class.get(class).cloned()
  }
}

#[derive(Debug, Deserialize)]
struct TestJobPayload {
  #[serde(default = "default_message")]
  message: String,
  #[serde(default = "default_sleep")]
  sleep_seconds: u64,
}

fn default_message() -> String {
  "Hello from Flow!".into()
}

fn default_sleep() -> u64 {
  3
}

/// Sleeps for `sleep_seconds` to simulate work.
pub struct TestJob;

impl TestJob {
  pub const CLASS: &'static str = "TestJob";
}

#[async_trait]
impl JobHandler for TestJob {
  async fn handle(&self, job: &ReservedJob, worker_id: &str) -> Result<(), JobError> {
    let payload: TestJobPayload =
      serde_json::from_value(job.payload.clone()).map_err(|e| JobError::InvalidPayload(e.to_string()))?;
    info!("Worker {}: TestJob started: {}", worker_id, payload.message);
    sleep(Duration::from_secs(payload.sleep_seconds)).await;
    info!("Worker {}: TestJob completed: {}", worker_id, payload.message);
    Ok(())
  }
}
