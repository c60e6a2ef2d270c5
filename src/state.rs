//! Typed access to the worker-facing keys of the shared store.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::config::StateSettings;
use crate::error::Result;
use crate::models::{JobAssignment, WorkerRecord};
use crate::store::{self, StateStore};

pub const REGISTRY_KEY: &str = "flow:workers";

pub fn worker_key(worker_id: &str) -> String {
  format!("flow:worker:{worker_id}")
}

pub fn history_key(worker_id: &str) -> String {
  format!("flow:worker:{worker_id}:history")
}

pub fn assignment_key(job_id: Uuid) -> String {
  format!("flow:job:{job_id}:worker")
}

#[derive(Clone)]
pub struct WorkerState {
  store: Arc<dyn StateStore>,
  settings: StateSettings,
}

impl WorkerState {
  pub fn new(store: Arc<dyn StateStore>, settings: StateSettings) -> Self {
    Self { store, settings }
  }

  pub fn settings(&self) -> &StateSettings {
    &self.settings
  }

  pub fn store(&self) -> &Arc<dyn StateStore> {
    &self.store
  }

  pub async fn record(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
    store::get_json(self.store.as_ref(), &worker_key(worker_id)).await
  }

  /// The stored value alongside its decoding, for conditional writes.
  pub async fn record_raw(&self, worker_id: &str) -> Result<Option<(Value, Option<WorkerRecord>)>> {
    let key = worker_key(worker_id);
    Ok(
      self
        .store
        .get(&key)
        .await?
        .map(|value| {
          let record = store::decode(&key, &value);
          (value, record)
        }),
    )
  }

  pub async fn put_record(&self, record: &WorkerRecord) -> Result<()> {
    store::put_json(self.store.as_ref(), &worker_key(&record.id), record, self.settings.worker_ttl).await
  }

  /// Replaces the record only if it still equals `expected`.
  pub async fn replace_record(&self, expected: &Value, record: &WorkerRecord) -> Result<bool> {
    let value = serde_json::to_value(record)?;
    self
      .store
      .put_if(&worker_key(&record.id), Some(expected), value, self.settings.worker_ttl)
      .await
  }

  /// Read-modify-write of an existing record; absent records stay absent.
  pub async fn update_record<F>(&self, worker_id: &str, mut f: F) -> Result<Option<WorkerRecord>>
  where
    F: FnMut(&mut WorkerRecord) + Send,
  {
    store::update_json(self.store.as_ref(), &worker_key(worker_id), self.settings.worker_ttl, |current: Option<WorkerRecord>| {
      current.map(|mut record| {
        f(&mut record);
        record
      })
    })
    .await
  }

  pub async fn forget_record(&self, worker_id: &str) -> Result<()> {
    self.store.forget(&worker_key(worker_id)).await
  }

  pub async fn registry(&self) -> Result<Vec<String>> {
    Ok(
      store::get_json(self.store.as_ref(), REGISTRY_KEY)
        .await?
        .unwrap_or_default(),
    )
  }

  pub async fn publish_registry(&self, worker_ids: &[String]) -> Result<()> {
    store::put_json(self.store.as_ref(), REGISTRY_KEY, &worker_ids, self.settings.worker_ttl).await
  }

  pub async fn forget_registry(&self) -> Result<()> {
    self.store.forget(REGISTRY_KEY).await
  }

  /// Live records of every registered worker, in registry order.
  pub async fn records(&self) -> Result<Vec<WorkerRecord>> {
    let mut records = Vec::new();
    for worker_id in self.registry().await? {
      if let Some(record) = self.record(&worker_id).await? {
        records.push(record);
      }
    }
    Ok(records)
  }

  pub async fn assignment(&self, job_id: Uuid) -> Result<Option<JobAssignment>> {
    store::get_json(self.store.as_ref(), &assignment_key(job_id)).await
  }

  pub async fn put_assignment(&self, job_id: Uuid, assignment: &JobAssignment) -> Result<()> {
    store::put_json(
      self.store.as_ref(),
      &assignment_key(job_id),
      assignment,
      self.settings.assignment_ttl,
    )
    .await
  }

  pub async fn forget_assignment(&self, job_id: Uuid) -> Result<()> {
    self.store.forget(&assignment_key(job_id)).await
  }
}
