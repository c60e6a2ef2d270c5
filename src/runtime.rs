//! The job loop a worker process runs for its queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::arbiter::{JobDescriptor, LifecycleEvent, Notifier};
use crate::error::{FlowError, JobError, Result};
use crate::job_source::{FailureOutcome, JobSource, ReservedJob};
use crate::models::WorkerRecord;
use crate::state::WorkerState;
use crate::worker_processing::Handlers;

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
  Completed { id: Uuid },
  Failed { id: Uuid, error: String },
}

pub struct WorkerRuntime {
  worker_id: String,
  queue: String,
  source: Arc<dyn JobSource>,
  handlers: Arc<Handlers>,
  notifier: Notifier,
  state: WorkerState,
  idle_sleep: Duration,
}

impl WorkerRuntime {
  pub fn new(
    worker_id: impl Into<String>,
    queue: impl Into<String>,
    source: Arc<dyn JobSource>,
    handlers: Arc<Handlers>,
    notifier: Notifier,
    state: WorkerState,
  ) -> Self {
    Self {
      worker_id: worker_id.into(),
      queue: queue.into(),
      source,
      handlers,
      notifier,
      state,
      idle_sleep: Duration::from_secs(3),
    }
  }

  pub fn idle_sleep(mut self, idle_sleep: Duration) -> Self {
    self.idle_sleep = idle_sleep;
    self
  }

  pub fn worker_id(&self) -> &str {
    &self.worker_id
  }

  /// Marks this worker idle, keeping what the supervisor already recorded.
  pub async fn start(&self) -> Result<()> {
    let pid = std::process::id();
    let queue = self.queue.clone();
    let updated = self
      .state
      .update_record(&self.worker_id, |record| {
        record.queue = queue.clone();
        record.pid = Some(pid);
        record.release();
      })
      .await?;
    if updated.is_none() {
      let record = WorkerRecord::idle(&self.worker_id, &self.queue, Some(pid), Utc::now());
      self.state.put_record(&record).await?;
    }
    info!("[{}] Worker started, processing queue: {}", self.worker_id, self.queue);
    Ok(())
  }

  /// Reserves and runs at most one job.
  pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
    let Some(job) = self.source.reserve(&self.queue).await? else {
      return Ok(None);
    };
    let descriptor = JobDescriptor::from(&job);

    self
      .notifier
      .notify(LifecycleEvent::Processing {
        job: descriptor.clone(),
        worker_id: self.worker_id.clone(),
      })
      .await?;

    let outcome = match self.execute(&job).await {
      Ok(()) => {
        tolerate_missing(self.source.complete(&job).await)?;
        self.notifier.notify(LifecycleEvent::Completed { job: descriptor }).await?;
        JobOutcome::Completed { id: job.id }
      }
      Err(e) => {
        let message = e.to_string();
        error!("[{}] Failed: {} - {}", self.worker_id, job.class, message);
        match tolerate_missing(self.source.fail(&job, &message).await)? {
          Some(FailureOutcome::Released) => info!("Job {} released for attempt {}", job.id, job.attempts + 1),
          Some(FailureOutcome::Buried) => warn!("Max attempts reached for job {}", job.id),
          None => {}
        }
        self
          .notifier
          .notify(LifecycleEvent::Failed {
            job: descriptor,
            error: message.clone(),
            error_class: e.class().to_string(),
          })
          .await?;
        JobOutcome::Failed { id: job.id, error: message }
      }
    };
    Ok(Some(outcome))
  }

  async fn execute(&self, job: &ReservedJob) -> std::result::Result<(), JobError> {
    let handler = self
      .handlers
      .get(&job.class)
      .ok_or_else(|| JobError::UnknownClass(job.class.clone()))?;
    let timeout = self.source.policy().timeout;
    match tokio::time::timeout(timeout, handler.handle(job, &self.worker_id)).await {
      Ok(result) => result,
      Err(_) => Err(JobError::Timeout(timeout)),
    }
  }

  /// Processes jobs until `shutdown` turns true. A job in hand is always
  /// finished first.
  pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    loop {
      if *shutdown.borrow() {
        break;
      }
      if self.run_once().await?.is_some() {
        continue;
      }
      tokio::select! {
        _ = tokio::time::sleep(self.idle_sleep) => {}
        changed = shutdown.changed() => {
          if changed.is_err() {
            break;
          }
        }
      }
    }
    info!("[{}] Worker stopping", self.worker_id);
    Ok(())
  }
}

/// A reservation that expired and was handed to someone else is not ours to
/// settle any more.
fn tolerate_missing<T>(result: Result<T>) -> Result<Option<T>> {
  match result {
    Ok(value) => Ok(Some(value)),
    Err(FlowError::JobNotFound(id)) => {
      warn!("Job {} is no longer reserved by this worker", id);
      Ok(None)
    }
    Err(e) => Err(e),
  }
}
