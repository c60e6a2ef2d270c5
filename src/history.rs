//! Bounded, newest-first log of a worker's finished jobs.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::models::JobRecord;
use crate::state::history_key;
use crate::store::{self, StateStore};

#[derive(Clone)]
pub struct HistoryLog {
  store: Arc<dyn StateStore>,
  ttl: Duration,
}

impl HistoryLog {
  pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
    Self { store, ttl }
  }

  /// Pushes `job` to the front and truncates to `cap`. The whole sequence is
  /// rewritten and its TTL reset.
  pub async fn append(&self, worker_id: &str, job: JobRecord, cap: usize) -> Result<()> {
    let key = history_key(worker_id);
    store::update_json(self.store.as_ref(), &key, self.ttl, |current: Option<Vec<JobRecord>>| {
      let mut history = current.unwrap_or_default();
      history.insert(0, job.clone());
      history.truncate(cap);
      Some(history)
    })
    .await?;
    Ok(())
  }

  pub async fn list(&self, worker_id: &str) -> Result<Vec<JobRecord>> {
    Ok(
      store::get_json(self.store.as_ref(), &history_key(worker_id))
        .await?
        .unwrap_or_default(),
    )
  }

  pub async fn reset(&self, worker_id: &str) -> Result<()> {
    store::put_json(self.store.as_ref(), &history_key(worker_id), &Vec::<JobRecord>::new(), self.ttl).await
  }
}
