//! Shared state store: the only surface worker processes and the supervisor
//! coordinate through. Every value is JSON and every key carries a TTL; reads
//! of an expired key behave exactly like reads of a missing one.
//!
//! There are no cross-key transactions. Multi-key updates are sequences of
//! single-key writes, so readers can observe them half done.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;

pub mod postgres;

pub use postgres::PgStore;

const CAS_ATTEMPTS: usize = 5;

#[async_trait]
pub trait StateStore: Send + Sync {
  /// Overwrites `key` and resets its TTL.
  async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

  async fn get(&self, key: &str) -> Result<Option<Value>>;

  async fn forget(&self, key: &str) -> Result<()>;

  /// Writes only if the live value equals `expected` (`None` = key absent or
  /// expired). Returns whether the write happened.
  async fn put_if(&self, key: &str, expected: Option<&Value>, value: Value, ttl: Duration) -> Result<bool>;

  /// Drops expired keys. Stores that expire lazily may do nothing.
  async fn purge_expired(&self) -> Result<u64> {
    Ok(0)
  }
}

struct Entry {
  value: Value,
  expires_at: Instant,
}

impl Entry {
  fn live(&self, now: Instant) -> bool {
    self.expires_at > now
  }
}

/// In-process store. Backs the tests and single-process setups.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
    self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

#[async_trait]
impl StateStore for MemoryStore {
  async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
    let expires_at = Instant::now() + ttl;
    self.lock().insert(key.to_string(), Entry { value, expires_at });
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<Value>> {
    let now = Instant::now();
    let mut entries = self.lock();
    match entries.get(key) {
      Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
      Some(_) => {
        entries.remove(key);
        Ok(None)
      }
      None => Ok(None),
    }
  }

  async fn forget(&self, key: &str) -> Result<()> {
    self.lock().remove(key);
    Ok(())
  }

  async fn put_if(&self, key: &str, expected: Option<&Value>, value: Value, ttl: Duration) -> Result<bool> {
    let now = Instant::now();
    let mut entries = self.lock();
    let current = entries.get(key).filter(|entry| entry.live(now)).map(|entry| &entry.value);
    if current != expected {
      return Ok(false);
    }
    entries.insert(key.to_string(), Entry { value, expires_at: now + ttl });
    Ok(true)
  }

  async fn purge_expired(&self) -> Result<u64> {
    let now = Instant::now();
    let mut entries = self.lock();
    let before = entries.len();
    entries.retain(|_, entry| entry.live(now));
    Ok((before - entries.len()) as u64)
  }
}

/// Decodes a stored value, treating anything malformed as absent.
pub fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Option<T> {
  match serde_json::from_value(value.clone()) {
    Ok(decoded) => Some(decoded),
    Err(e) => {
      warn!(key, error = %e, "Ignoring malformed state value");
      None
    }
  }
}

pub async fn get_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
  Ok(store.get(key).await?.and_then(|value| decode(key, &value)))
}

pub async fn put_json<T: Serialize + Sync>(store: &dyn StateStore, key: &str, value: &T, ttl: Duration) -> Result<()> {
  store.put(key, serde_json::to_value(value)?, ttl).await
}

/// Read-modify-write of one key, guarded by `put_if`: a lost race re-reads
/// and re-applies `f`. `f` returns `None` to leave the key alone.
///
/// After `CAS_ATTEMPTS` lost races the last computed value is written with a
/// plain `put`, so under sustained contention this degrades to last write
/// wins and a concurrent writer's update can be overwritten.
pub async fn update_json<T, F>(store: &dyn StateStore, key: &str, ttl: Duration, mut f: F) -> Result<Option<T>>
where
  T: Serialize + DeserializeOwned + Send + Sync,
  F: FnMut(Option<T>) -> Option<T> + Send,
{
  let mut last = None;
  for attempt in 0..CAS_ATTEMPTS {
    let current = store.get(key).await?;
    let decoded = current.as_ref().and_then(|value| decode(key, value));
    let Some(next) = f(decoded) else {
      return Ok(None);
    };
    let value = serde_json::to_value(&next)?;
    if store.put_if(key, current.as_ref(), value.clone(), ttl).await? {
      return Ok(Some(next));
    }
    debug!(key, attempt, "Conditional write lost a race, retrying");
    last = Some((next, value));
  }

  match last {
    Some((next, value)) => {
      warn!(key, "Conditional write kept losing, falling back to last write wins");
      store.put(key, value, ttl).await?;
      Ok(Some(next))
    }
    None => Ok(None),
  }
}
