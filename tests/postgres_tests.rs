//! Runs the Postgres store and job source against a real database.
//!
//! `DATABASE_URL=postgres://… cargo test --test postgres_tests -- --ignored`

use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use flow::config::JobPolicy;
use flow::database::setup_database;
use flow::error::FlowError;
use flow::job_source::{FailureOutcome, JobSource, PgJobSource};
use flow::store::{PgStore, StateStore};

const TTL: Duration = Duration::from_secs(60);

async fn database() -> PgPool {
  let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a Postgres database");
  setup_database(&url).await.expect("database setup failed")
}

fn key(name: &str) -> String {
  format!("test:{}:{}", Uuid::new_v4(), name)
}

fn queue() -> String {
  format!("test-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Integration test - requires Postgres at DATABASE_URL
async fn pg_store_put_get_forget_and_expiry() {
  let store = PgStore::new(database().await);
  let live = key("live");
  store.put(&live, json!({"n": 1}), TTL).await.unwrap();
  assert_eq!(store.get(&live).await.unwrap(), Some(json!({"n": 1})));
  store.put(&live, json!({"n": 2}), TTL).await.unwrap();
  assert_eq!(store.get(&live).await.unwrap(), Some(json!({"n": 2})));
  store.forget(&live).await.unwrap();
  assert_eq!(store.get(&live).await.unwrap(), None);

  let short = key("short");
  store.put(&short, json!(1), Duration::from_millis(500)).await.unwrap();
  assert!(store.get(&short).await.unwrap().is_some());
  tokio::time::sleep(Duration::from_millis(800)).await;
  assert_eq!(store.get(&short).await.unwrap(), None);
}

#[tokio::test]
#[ignore] // Integration test - requires Postgres at DATABASE_URL
async fn pg_store_conditional_writes() {
  let store = PgStore::new(database().await);
  let k = key("record");

  assert!(store.put_if(&k, None, json!({"status": "idle"}), TTL).await.unwrap());
  assert!(
    !store.put_if(&k, None, json!({"status": "other"}), TTL).await.unwrap(),
    "absent-only write must not replace a live value"
  );

  let current = json!({"status": "idle"});
  assert!(store.put_if(&k, Some(&current), json!({"status": "active"}), TTL).await.unwrap());
  assert!(
    !store.put_if(&k, Some(&current), json!({"status": "stolen"}), TTL).await.unwrap(),
    "a stale expected value loses"
  );
  assert_eq!(store.get(&k).await.unwrap(), Some(json!({"status": "active"})));

  let expired = key("expired");
  store.put(&expired, json!("old"), Duration::ZERO).await.unwrap();
  assert!(!store.put_if(&expired, Some(&json!("old")), json!("new"), TTL).await.unwrap());
  assert!(store.put_if(&expired, None, json!("new"), TTL).await.unwrap());
  assert_eq!(store.get(&expired).await.unwrap(), Some(json!("new")));
}

#[tokio::test]
#[ignore] // Integration test - requires Postgres at DATABASE_URL
async fn pg_store_purges_expired_rows() {
  let pool = database().await;
  let store = PgStore::new(pool.clone());
  let gone = key("gone");
  let kept = key("kept");
  store.put(&gone, json!(1), Duration::ZERO).await.unwrap();
  store.put(&kept, json!(1), TTL).await.unwrap();

  assert!(store.purge_expired().await.unwrap() >= 1);
  let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flow_state WHERE key = ANY($1)")
    .bind(vec![gone, kept.clone()])
    .fetch_one(&pool)
    .await
    .unwrap();
  assert_eq!(rows, 1);
  store.forget(&kept).await.unwrap();
}

#[tokio::test]
#[ignore] // Integration test - requires Postgres at DATABASE_URL
async fn pg_job_source_retries_then_buries() {
  let pool = database().await;
  let policy = JobPolicy {
    tries: 2,
    ..JobPolicy::default()
  };
  let source = PgJobSource::new(pool.clone(), policy);
  let q = queue();
  let pushed = source.push(&q, "TestJob", json!({"sleep_seconds": 0})).await.unwrap();
  assert!(source.pending().await.unwrap().iter().any(|job| job.queue == q));

  let first = source.reserve(&q).await.unwrap().unwrap();
  assert_ne!(first.id, pushed);
  assert_eq!(first.attempts, 1);
  assert!(source.reserve(&q).await.unwrap().is_none(), "reserved jobs are invisible");
  assert!(!source.pending().await.unwrap().iter().any(|job| job.queue == q));
  assert_eq!(source.fail(&first, "boom").await.unwrap(), FailureOutcome::Released);

  let second = source.reserve(&q).await.unwrap().unwrap();
  assert_ne!(second.id, first.id);
  assert_eq!(second.attempts, 2);
  assert_eq!(source.fail(&second, "boom again").await.unwrap(), FailureOutcome::Buried);
  assert!(source.reserve(&q).await.unwrap().is_none());

  let error: String = sqlx::query_scalar("SELECT error FROM failed_jobs WHERE id = $1")
    .bind(second.id)
    .fetch_one(&pool)
    .await
    .unwrap();
  assert_eq!(error, "boom again");
}

#[tokio::test]
#[ignore] // Integration test - requires Postgres at DATABASE_URL
async fn pg_job_source_redelivers_after_the_visibility_window() {
  let policy = JobPolicy {
    retry_after: Duration::ZERO,
    ..JobPolicy::default()
  };
  let source = PgJobSource::new(database().await, policy);
  let q = queue();
  source.push(&q, "TestJob", json!({})).await.unwrap();

  let first = source.reserve(&q).await.unwrap().unwrap();
  let again = source.reserve(&q).await.unwrap().unwrap();
  assert_ne!(again.id, first.id);
  assert_eq!(again.attempts, 2);

  assert!(matches!(source.complete(&first).await, Err(FlowError::JobNotFound(_))));
  source.complete(&again).await.unwrap();
  assert!(source.reserve(&q).await.unwrap().is_none());
}
