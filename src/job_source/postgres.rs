use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use super::{FailureOutcome, JobSource, ReservedJob};
use crate::config::JobPolicy;
use crate::error::{FlowError, Result};
use crate::models::PendingJob;

#[derive(FromRow)]
struct JobRow {
  id: Uuid,
  queue: String,
  class: String,
  payload: Value,
  attempts: i32,
  created_at: DateTime<Utc>,
}

impl From<JobRow> for ReservedJob {
  fn from(row: JobRow) -> Self {
    Self {
      id: row.id,
      queue: row.queue,
      class: row.class,
      payload: row.payload,
      attempts: row.attempts.max(0) as u32,
      created_at: row.created_at,
    }
  }
}

/// Job source over the `jobs` / `failed_jobs` tables.
#[derive(Clone)]
pub struct PgJobSource {
  pool: PgPool,
  policy: JobPolicy,
}

impl PgJobSource {
  pub fn new(pool: PgPool, policy: JobPolicy) -> Self {
    Self { pool, policy }
  }
}

#[async_trait]
impl JobSource for PgJobSource {
  fn policy(&self) -> JobPolicy {
    self.policy
  }

  async fn reserve(&self, queue: &str) -> Result<Option<ReservedJob>> {
    let row = sqlx::query_as::<_, JobRow>(
      "UPDATE jobs SET id = gen_random_uuid(), reserved_at = NOW(), attempts = attempts + 1
       WHERE id = (
         SELECT id FROM jobs
         WHERE queue = $1 AND available_at <= NOW()
           AND (reserved_at IS NULL OR reserved_at <= NOW() - make_interval(secs => $2))
         ORDER BY created_at
         LIMIT 1
         FOR UPDATE SKIP LOCKED
       )
       RETURNING id, queue, class, payload, attempts, created_at",
    )
      .bind(queue)
      .bind(self.policy.retry_after.as_secs_f64())
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(ReservedJob::from))
  }

  async fn complete(&self, job: &ReservedJob) -> Result<()> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
      .bind(job.id)
      .execute(&self.pool)
      .await?;
    if result.rows_affected() == 0 {
      return Err(FlowError::JobNotFound(job.id));
    }
    Ok(())
  }

  async fn fail(&self, job: &ReservedJob, error: &str) -> Result<FailureOutcome> {
    if job.attempts < self.policy.tries {
      let result = sqlx::query("UPDATE jobs SET reserved_at = NULL, available_at = NOW() WHERE id = $1")
        .bind(job.id)
        .execute(&self.pool)
        .await?;
      if result.rows_affected() == 0 {
        return Err(FlowError::JobNotFound(job.id));
      }
      return Ok(FailureOutcome::Released);
    }

    let mut tx = self.pool.begin().await?;
    let result = sqlx::query(
      "INSERT INTO failed_jobs (id, queue, class, payload, attempts, error)
       SELECT id, queue, class, payload, attempts, $2 FROM jobs WHERE id = $1",
    )
      .bind(job.id)
      .bind(error)
      .execute(&mut *tx)
      .await?;
    if result.rows_affected() == 0 {
      return Err(FlowError::JobNotFound(job.id));
    }
    sqlx::query("DELETE FROM jobs WHERE id = $1")
      .bind(job.id)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;
    info!(job_id = %job.id, attempts = job.attempts, "Job moved to failed_jobs");
    Ok(FailureOutcome::Buried)
  }

  async fn pending(&self) -> Result<Vec<PendingJob>> {
    let rows = sqlx::query_as::<_, JobRow>(
      "SELECT id, queue, class, payload, attempts, created_at FROM jobs
       WHERE reserved_at IS NULL AND available_at <= NOW()
       ORDER BY created_at DESC",
    )
      .fetch_all(&self.pool)
      .await?;
    Ok(
      rows
        .into_iter()
        .map(|row| PendingJob {
          id: row.id,
          queue: row.queue,
          class: row.class,
          data: row.payload,
          created_at: row.created_at,
          status: "pending".into(),
        })
        .collect(),
    )
  }

  async fn push(&self, queue: &str, class: &str, payload: Value) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO jobs (id, queue, class, payload) VALUES ($1, $2, $3, $4)")
      .bind(id)
      .bind(queue)
      .bind(class)
      .bind(payload)
      .execute(&self.pool)
      .await?;
    Ok(id)
  }
}
