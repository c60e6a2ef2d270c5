//! Routes job lifecycle notifications to the worker record that owns the job.
//!
//! Runtimes talk to the arbiter over a channel and wait for each reply, so a
//! notification has been applied to the store before the runtime moves on.
//! Claiming an idle worker is a conditional write on its record: two jobs
//! that both see the same idle worker cannot both win it.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::history::HistoryLog;
use crate::job_source::ReservedJob;
use crate::models::{processing_time_ms, JobAssignment, JobRecord, JobStatus, WorkerStatus};
use crate::state::WorkerState;

#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
  pub id: Uuid,
  pub class: String,
  pub queue: String,
  pub attempts: u32,
}

impl From<&ReservedJob> for JobDescriptor {
  fn from(job: &ReservedJob) -> Self {
    Self {
      id: job.id,
      class: job.class.clone(),
      queue: job.queue.clone(),
      attempts: job.attempts,
    }
  }
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
  /// `worker_id` is the runtime that dequeued the job. It is only logged;
  /// the record is chosen by registry order.
  Processing { job: JobDescriptor, worker_id: String },
  Completed { job: JobDescriptor },
  Failed { job: JobDescriptor, error: String, error_class: String },
}

impl LifecycleEvent {
  pub fn job(&self) -> &JobDescriptor {
    match self {
      LifecycleEvent::Processing { job, .. }
      | LifecycleEvent::Completed { job }
      | LifecycleEvent::Failed { job, .. } => job,
    }
  }
}

struct Failure<'a> {
  error: &'a str,
  error_class: &'a str,
}

#[derive(Clone)]
pub struct Arbiter {
  state: WorkerState,
  history: HistoryLog,
}

impl Arbiter {
  pub fn new(state: WorkerState, history: HistoryLog) -> Self {
    Self { state, history }
  }

  /// Applies one notification. Returns the worker it was attributed to.
  pub async fn handle(&self, event: &LifecycleEvent) -> Result<Option<String>> {
    match event {
      LifecycleEvent::Processing { job, worker_id } => self.on_processing(job, worker_id).await,
      LifecycleEvent::Completed { job } => self.on_terminal(job, None).await,
      LifecycleEvent::Failed { job, error, error_class } => {
        self.on_terminal(job, Some(Failure { error, error_class })).await
      }
    }
  }

  /// Claims the first idle record in registry order. With none idle, the
  /// first registered record is overwritten.
  async fn on_processing(&self, job: &JobDescriptor, emitted_by: &str) -> Result<Option<String>> {
    let started_at = Utc::now();
    let current = JobRecord {
      id: job.id,
      class: job.class.clone(),
      queue: job.queue.clone(),
      status: JobStatus::Processing,
      started_at: Some(started_at),
      completed_at: None,
      failed_at: None,
      processing_time: None,
      attempts: job.attempts,
      error: None,
      error_class: None,
    };

    let mut fallback = None;
    let mut chosen = None;
    for id in self.state.registry().await? {
      let Some((raw, Some(mut record))) = self.state.record_raw(&id).await? else {
        continue;
      };
      if fallback.is_none() {
        fallback = Some(id.clone());
      }
      if record.status != WorkerStatus::Idle {
        continue;
      }
      record.activate(current.clone());
      if self.state.replace_record(&raw, &record).await? {
        chosen = Some(id);
        break;
      }
      debug!(worker_id = %id, job_id = %job.id, "Idle worker was claimed concurrently, trying the next one");
    }

    let worker_id = match (chosen, fallback) {
      (Some(id), _) => id,
      (None, Some(id)) => {
        warn!(worker_id = %id, job_id = %job.id, "No idle worker, assigning job to a busy one");
        let updated = self.state.update_record(&id, |record| record.activate(current.clone())).await?;
        if updated.is_none() {
          warn!(worker_id = %id, job_id = %job.id, "Worker record vanished, job goes untracked");
          return Ok(None);
        }
        id
      }
      (None, None) => {
        warn!(job_id = %job.id, "No worker records available, job goes untracked");
        return Ok(None);
      }
    };

    self
      .state
      .put_assignment(job.id, &JobAssignment { worker_id: worker_id.clone(), started_at })
      .await?;
    info!(worker_id = %worker_id, emitted_by, job_id = %job.id, class = %job.class, "Processing");
    Ok(Some(worker_id))
  }

  async fn on_terminal(&self, job: &JobDescriptor, failure: Option<Failure<'_>>) -> Result<Option<String>> {
    let Some(assignment) = self.state.assignment(job.id).await? else {
      debug!(job_id = %job.id, "No assignment for finished job, ignoring");
      return Ok(None);
    };
    let worker_id = assignment.worker_id.clone();
    let now = Utc::now();

    let started_at = self.recover_start(&worker_id, job.id, &assignment).await?;
    let processing_time = processing_time_ms(started_at, now);
    let completed = failure.is_none();
    let entry = JobRecord {
      id: job.id,
      class: job.class.clone(),
      queue: job.queue.clone(),
      status: if completed { JobStatus::Completed } else { JobStatus::Failed },
      started_at,
      completed_at: completed.then_some(now),
      failed_at: (!completed).then_some(now),
      processing_time: Some(processing_time),
      attempts: job.attempts,
      error: failure.as_ref().map(|f| f.error.to_string()),
      error_class: failure.as_ref().map(|f| f.error_class.to_string()),
    };

    let cap = self.state.settings().history_cap;
    self.history.append(&worker_id, entry, cap).await?;

    self
      .state
      .update_record(&worker_id, |record| {
        let owns_job = record.current_job.as_ref().is_none_or(|current| current.id == job.id);
        if owns_job {
          record.release();
        } else {
          record.touch();
        }
        if completed {
          record.jobs_processed += 1;
        }
      })
      .await?;
    self.state.forget_assignment(job.id).await?;

    match failure {
      None => info!(worker_id = %worker_id, job_id = %job.id, class = %job.class, processing_time, "Completed"),
      Some(f) => warn!(
        worker_id = %worker_id,
        job_id = %job.id,
        class = %job.class,
        error = f.error,
        "Failed"
      ),
    }
    Ok(Some(worker_id))
  }

  /// Start time from the worker's current job when it is this job, otherwise
  /// from the assignment.
  async fn recover_start(
    &self,
    worker_id: &str,
    job_id: Uuid,
    assignment: &JobAssignment,
  ) -> Result<Option<DateTime<Utc>>> {
    let current = self
      .state
      .record(worker_id)
      .await?
      .and_then(|record| record.current_job)
      .filter(|current| current.id == job_id);
    Ok(match current {
      Some(current) => current.started_at,
      None => Some(assignment.started_at),
    })
  }

  /// Moves the arbiter onto its own task and returns the sending side.
  pub fn spawn(self, buffer: usize) -> (Notifier, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Envelope>(buffer.max(1));
    let handle = tokio::spawn(async move {
      while let Some((event, reply)) = rx.recv().await {
        let result = self.handle(&event).await;
        let _ = reply.send(result);
      }
      debug!("Arbiter channel closed");
    });
    (Notifier { tx }, handle)
  }
}

type Envelope = (LifecycleEvent, oneshot::Sender<Result<Option<String>>>);

#[derive(Clone)]
pub struct Notifier {
  tx: mpsc::Sender<Envelope>,
}

impl Notifier {
  /// Sends `event` and waits until the arbiter has applied it.
  pub async fn notify(&self, event: LifecycleEvent) -> Result<Option<String>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self.tx.send((event, reply_tx)).await.map_err(|_| FlowError::ArbiterClosed)?;
    reply_rx.await.map_err(|_| FlowError::ArbiterClosed)?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StateSettings;
  use crate::models::WorkerRecord;
  use crate::store::{MemoryStore, StateStore};
  use std::sync::Arc;

  struct Fixture {
    state: WorkerState,
    history: HistoryLog,
    arbiter: Arbiter,
  }

  async fn fixture(workers: usize) -> Fixture {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let settings = StateSettings::default();
    let state = WorkerState::new(store.clone(), settings.clone());
    let history = HistoryLog::new(store, settings.history_ttl);
    let ids: Vec<String> = (1..=workers).map(|i| format!("flow_worker_{i}")).collect();
    for id in &ids {
      state.put_record(&WorkerRecord::idle(id, "default", None, Utc::now())).await.unwrap();
    }
    state.publish_registry(&ids).await.unwrap();
    let arbiter = Arbiter::new(state.clone(), history.clone());
    Fixture { state, history, arbiter }
  }

  fn descriptor() -> JobDescriptor {
    JobDescriptor {
      id: Uuid::new_v4(),
      class: "TestJob".into(),
      queue: "default".into(),
      attempts: 1,
    }
  }

  fn processing(job: &JobDescriptor, worker_id: &str) -> LifecycleEvent {
    LifecycleEvent::Processing { job: job.clone(), worker_id: worker_id.into() }
  }

  #[tokio::test]
  async fn processing_claims_the_first_idle_worker_in_registry_order() {
    let f = fixture(3).await;
    let job = descriptor();
    let assigned = f.arbiter.handle(&processing(&job, "flow_worker_3")).await.unwrap();
    assert_eq!(assigned.as_deref(), Some("flow_worker_1"));

    let record = f.state.record("flow_worker_1").await.unwrap().unwrap();
    assert_eq!(record.status, WorkerStatus::Active);
    assert_eq!(record.current_job.as_ref().unwrap().id, job.id);
    assert!(record.is_consistent());
    assert_eq!(f.state.assignment(job.id).await.unwrap().unwrap().worker_id, "flow_worker_1");
    assert_eq!(f.state.record("flow_worker_3").await.unwrap().unwrap().status, WorkerStatus::Idle);
  }

  #[tokio::test]
  async fn busy_workers_are_skipped_for_the_next_idle_one() {
    let f = fixture(3).await;
    f.arbiter.handle(&processing(&descriptor(), "flow_worker_3")).await.unwrap();
    let assigned = f.arbiter.handle(&processing(&descriptor(), "flow_worker_3")).await.unwrap();
    assert_eq!(assigned.as_deref(), Some("flow_worker_2"));
  }

  #[tokio::test]
  async fn registry_order_decides_not_worker_numbering() {
    let f = fixture(3).await;
    f.state
      .publish_registry(&["flow_worker_2".into(), "flow_worker_1".into(), "flow_worker_3".into()])
      .await
      .unwrap();
    let assigned = f.arbiter.handle(&processing(&descriptor(), "flow_worker_1")).await.unwrap();
    assert_eq!(assigned.as_deref(), Some("flow_worker_2"));
  }

  #[tokio::test]
  async fn all_busy_falls_back_to_first_record() {
    let f = fixture(3).await;
    for _ in 0..3 {
      f.arbiter.handle(&processing(&descriptor(), "flow_worker_3")).await.unwrap();
    }
    let fourth = descriptor();
    let assigned = f.arbiter.handle(&processing(&fourth, "flow_worker_3")).await.unwrap();
    assert_eq!(assigned.as_deref(), Some("flow_worker_1"));
    let record = f.state.record("flow_worker_1").await.unwrap().unwrap();
    assert_eq!(record.current_job.unwrap().id, fourth.id);
    let untouched = f.state.record("flow_worker_3").await.unwrap().unwrap();
    assert_ne!(untouched.current_job.unwrap().id, fourth.id);
  }

  #[tokio::test]
  async fn fallback_skips_ids_without_a_record() {
    let f = fixture(2).await;
    f.state.forget_record("flow_worker_1").await.unwrap();
    f.arbiter.handle(&processing(&descriptor(), "flow_worker_1")).await.unwrap();
    let assigned = f.arbiter.handle(&processing(&descriptor(), "flow_worker_1")).await.unwrap();
    assert_eq!(assigned.as_deref(), Some("flow_worker_2"));
  }

  #[tokio::test]
  async fn no_records_means_untracked() {
    let f = fixture(0).await;
    let job = descriptor();
    assert!(f.arbiter.handle(&processing(&job, "flow_worker_1")).await.unwrap().is_none());
    assert!(f.state.assignment(job.id).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn completion_records_history_and_returns_worker_to_idle() {
    let f = fixture(3).await;
    let job = descriptor();
    f.arbiter.handle(&processing(&job, "flow_worker_1")).await.unwrap();
    let done = f.arbiter.handle(&LifecycleEvent::Completed { job: job.clone() }).await.unwrap();
    assert_eq!(done.as_deref(), Some("flow_worker_1"));

    let record = f.state.record("flow_worker_1").await.unwrap().unwrap();
    assert_eq!(record.status, WorkerStatus::Idle);
    assert!(record.current_job.is_none());
    assert_eq!(record.jobs_processed, 1);

    let history = f.history.list("flow_worker_1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, JobStatus::Completed);
    assert!(history[0].completed_at.is_some());
    assert!(history[0].processing_time.is_some());
    assert!(f.state.assignment(job.id).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn failure_records_error_without_counting_the_job() {
    let f = fixture(1).await;
    let job = descriptor();
    f.arbiter.handle(&processing(&job, "flow_worker_1")).await.unwrap();
    f.arbiter
      .handle(&LifecycleEvent::Failed {
        job: job.clone(),
        error: "boom".into(),
        error_class: "HandlerError".into(),
      })
      .await
      .unwrap();

    let record = f.state.record("flow_worker_1").await.unwrap().unwrap();
    assert_eq!(record.status, WorkerStatus::Idle);
    assert_eq!(record.jobs_processed, 0);
    let history = f.history.list("flow_worker_1").await.unwrap();
    assert_eq!(history[0].status, JobStatus::Failed);
    assert_eq!(history[0].error.as_deref(), Some("boom"));
    assert_eq!(history[0].error_class.as_deref(), Some("HandlerError"));
    assert!(history[0].failed_at.is_some());
  }

  #[tokio::test]
  async fn terminal_without_assignment_is_a_no_op() {
    let f = fixture(1).await;
    let job = descriptor();
    let out = f.arbiter.handle(&LifecycleEvent::Completed { job }).await.unwrap();
    assert!(out.is_none());
    assert!(f.history.list("flow_worker_1").await.unwrap().is_empty());
    assert_eq!(f.state.record("flow_worker_1").await.unwrap().unwrap().jobs_processed, 0);
  }

  #[tokio::test]
  async fn finishing_an_overwritten_job_keeps_the_newer_one_current() {
    let f = fixture(1).await;
    let first = descriptor();
    let second = descriptor();
    f.arbiter.handle(&processing(&first, "flow_worker_1")).await.unwrap();
    f.arbiter.handle(&processing(&second, "flow_worker_1")).await.unwrap();
    f.arbiter.handle(&LifecycleEvent::Completed { job: first.clone() }).await.unwrap();

    let record = f.state.record("flow_worker_1").await.unwrap().unwrap();
    assert_eq!(record.status, WorkerStatus::Active);
    assert_eq!(record.current_job.as_ref().unwrap().id, second.id);
    assert_eq!(record.jobs_processed, 1);
    assert!(record.is_consistent());
  }

  #[tokio::test]
  async fn notifier_waits_for_the_arbiter() {
    let f = fixture(1).await;
    let (notifier, handle) = f.arbiter.clone().spawn(8);
    let job = descriptor();
    let assigned = notifier.notify(processing(&job, "flow_worker_1")).await.unwrap();
    assert_eq!(assigned.as_deref(), Some("flow_worker_1"));
    assert_eq!(f.state.record("flow_worker_1").await.unwrap().unwrap().status, WorkerStatus::Active);
    drop(notifier);
    handle.await.unwrap();
  }
}
