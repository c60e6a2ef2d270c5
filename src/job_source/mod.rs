//! The queue workers pull from. It owns reservation, retry and timeout
//! policy; the rest of the crate only observes what it hands out.
//!
//! Each reservation carries a fresh job id, so a retried or redelivered job
//! never shares an id with an earlier attempt.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::JobPolicy;
use crate::error::{FlowError, Result};
use crate::models::PendingJob;

pub mod postgres;

pub use postgres::PgJobSource;

#[derive(Debug, Clone, PartialEq)]
pub struct ReservedJob {
  pub id: Uuid,
  pub queue: String,
  pub class: String,
  pub payload: Value,
  pub attempts: u32,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
  /// Back on the queue for another attempt.
  Released,
  /// Out of attempts; moved to the failed jobs.
  Buried,
}

#[async_trait]
pub trait JobSource: Send + Sync {
  fn policy(&self) -> JobPolicy;

  async fn reserve(&self, queue: &str) -> Result<Option<ReservedJob>>;

  async fn complete(&self, job: &ReservedJob) -> Result<()>;

  async fn fail(&self, job: &ReservedJob, error: &str) -> Result<FailureOutcome>;

  /// Jobs that are available and not reserved, newest first.
  async fn pending(&self) -> Result<Vec<PendingJob>>;

  async fn push(&self, queue: &str, class: &str, payload: Value) -> Result<Uuid>;
}

#[derive(Debug, Clone)]
struct StoredJob {
  id: Uuid,
  queue: String,
  class: String,
  payload: Value,
  attempts: u32,
  reserved_at: Option<Instant>,
  created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedJob {
  pub id: Uuid,
  pub queue: String,
  pub class: String,
  pub attempts: u32,
  pub error: String,
}

#[derive(Default)]
struct MemoryQueue {
  jobs: Vec<StoredJob>,
  failed: Vec<FailedJob>,
}

/// In-process job source with the same reservation rules as the Postgres one.
pub struct MemoryJobSource {
  policy: JobPolicy,
  inner: Mutex<MemoryQueue>,
}

impl MemoryJobSource {
  pub fn new(policy: JobPolicy) -> Self {
    Self {
      policy,
      inner: Mutex::new(MemoryQueue::default()),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, MemoryQueue> {
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn failed_jobs(&self) -> Vec<FailedJob> {
    self.lock().failed.clone()
  }

  pub fn len(&self) -> usize {
    self.lock().jobs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl JobSource for MemoryJobSource {
  fn policy(&self) -> JobPolicy {
    self.policy
  }

  async fn reserve(&self, queue: &str) -> Result<Option<ReservedJob>> {
    let now = Instant::now();
    let retry_after = self.policy.retry_after;
    let mut inner = self.lock();
    let Some(job) = inner.jobs.iter_mut().find(|job| {
      job.queue == queue && job.reserved_at.is_none_or(|reserved| reserved + retry_after <= now)
    }) else {
      return Ok(None);
    };

    job.id = Uuid::new_v4();
    job.attempts += 1;
    job.reserved_at = Some(now);
    Ok(Some(ReservedJob {
      id: job.id,
      queue: job.queue.clone(),
      class: job.class.clone(),
      payload: job.payload.clone(),
      attempts: job.attempts,
      created_at: job.created_at,
    }))
  }

  async fn complete(&self, job: &ReservedJob) -> Result<()> {
    let mut inner = self.lock();
    let before = inner.jobs.len();
    inner.jobs.retain(|stored| stored.id != job.id);
    if inner.jobs.len() == before {
      return Err(FlowError::JobNotFound(job.id));
    }
    Ok(())
  }

  async fn fail(&self, job: &ReservedJob, error: &str) -> Result<FailureOutcome> {
    let tries = self.policy.tries;
    let mut inner = self.lock();
    let index = inner
      .jobs
      .iter()
      .position(|stored| stored.id == job.id)
      .ok_or(FlowError::JobNotFound(job.id))?;

    if inner.jobs[index].attempts < tries {
      inner.jobs[index].reserved_at = None;
      return Ok(FailureOutcome::Released);
    }

    let stored = inner.jobs.remove(index);
    inner.failed.push(FailedJob {
      id: stored.id,
      queue: stored.queue,
      class: stored.class,
      attempts: stored.attempts,
      error: error.to_string(),
    });
    Ok(FailureOutcome::Buried)
  }

  async fn pending(&self) -> Result<Vec<PendingJob>> {
    let inner = self.lock();
    let mut pending: Vec<PendingJob> = inner
      .jobs
      .iter()
      .filter(|job| job.reserved_at.is_none())
      .map(|job| PendingJob {
        id: job.id,
        queue: job.queue.clone(),
        class: job.class.clone(),
        data: job.payload.clone(),
        created_at: job.created_at,
        status: "pending".into(),
      })
      .collect();
    pending.reverse();
    Ok(pending)
  }

  async fn push(&self, queue: &str, class: &str, payload: Value) -> Result<Uuid> {
    let id = Uuid::new_v4();
    self.lock().jobs.push(StoredJob {
      id,
      queue: queue.to_string(),
      class: class.to_string(),
      payload,
      attempts: 0,
      reserved_at: None,
      created_at: Utc::now(),
    });
    Ok(id)
  }
}
