use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use super::StateStore;
use crate::error::Result;

/// Store backed by the `flow_state` table. Expiry is a timestamp column;
/// expired rows are invisible to reads and removed by `purge_expired`.
#[derive(Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl StateStore for PgStore {
  async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
    sqlx::query(
      "INSERT INTO flow_state (key, value, expires_at)
       VALUES ($1, $2, NOW() + make_interval(secs => $3))
       ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
    )
      .bind(key)
      .bind(value)
      .bind(ttl.as_secs_f64())
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<Value>> {
    let value = sqlx::query_scalar::<_, Value>(
      "SELECT value FROM flow_state WHERE key = $1 AND expires_at > NOW()",
    )
      .bind(key)
      .fetch_optional(&self.pool)
      .await?;
    Ok(value)
  }

  async fn forget(&self, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM flow_state WHERE key = $1")
      .bind(key)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn put_if(&self, key: &str, expected: Option<&Value>, value: Value, ttl: Duration) -> Result<bool> {
    let result = match expected {
      None => {
        sqlx::query(
          "INSERT INTO flow_state (key, value, expires_at)
           VALUES ($1, $2, NOW() + make_interval(secs => $3))
           ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
           WHERE flow_state.expires_at <= NOW()",
        )
          .bind(key)
          .bind(value)
          .bind(ttl.as_secs_f64())
          .execute(&self.pool)
          .await?
      }
      Some(expected) => {
        sqlx::query(
          "UPDATE flow_state SET value = $2, expires_at = NOW() + make_interval(secs => $3)
           WHERE key = $1 AND value = $4 AND expires_at > NOW()",
        )
          .bind(key)
          .bind(value)
          .bind(ttl.as_secs_f64())
          .bind(expected)
          .execute(&self.pool)
          .await?
      }
    };
    Ok(result.rows_affected() == 1)
  }

  async fn purge_expired(&self) -> Result<u64> {
    let result = sqlx::query("DELETE FROM flow_state WHERE expires_at <= NOW()")
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected())
  }
}
