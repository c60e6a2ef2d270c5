use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use flow::config::{JobPolicy, StateSettings};
use flow::history::HistoryLog;
use flow::job_source::{JobSource, MemoryJobSource};
use flow::models::{JobRecord, JobStatus, WorkerRecord, WorkerStatus};
use flow::routes::{routes, Dashboard};
use flow::state::WorkerState;
use flow::store::{MemoryStore, StateStore};

async fn serve(dashboard: Dashboard) -> SocketAddr {
  let (addr, server) = warp::serve(routes(dashboard)).bind_ephemeral(([127, 0, 0, 1], 0));
  tokio::spawn(server);
  addr
}

async fn seeded() -> Dashboard {
  let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
  let settings = StateSettings::default();
  let state = WorkerState::new(store.clone(), settings.clone());
  let history = HistoryLog::new(store, settings.history_ttl);
  let now = Utc::now();

  let idle = WorkerRecord::idle("flow_worker_1", "default", Some(101), now);
  let mut active = WorkerRecord::idle("flow_worker_2", "default", Some(102), now);
  active.activate(JobRecord {
    id: Uuid::new_v4(),
    class: "TestJob".into(),
    queue: "default".into(),
    status: JobStatus::Processing,
    started_at: Some(now),
    completed_at: None,
    failed_at: None,
    processing_time: None,
    attempts: 1,
    error: None,
    error_class: None,
  });
  let mut failed = WorkerRecord::idle("flow_worker_3", "emails", None, now);
  failed.status = WorkerStatus::Failed;
  for record in [&idle, &active, &failed] {
    state.put_record(record).await.unwrap();
  }
  state
    .publish_registry(&["flow_worker_1".into(), "flow_worker_2".into(), "flow_worker_3".into()])
    .await
    .unwrap();

  history.reset("flow_worker_1").await.unwrap();
  for n in 0..2 {
    let entry = JobRecord {
      id: Uuid::new_v4(),
      class: "TestJob".into(),
      queue: "default".into(),
      status: JobStatus::Completed,
      started_at: Some(now),
      completed_at: Some(now),
      failed_at: None,
      processing_time: Some(10 * n),
      attempts: 1,
      error: None,
      error_class: None,
    };
    history.append("flow_worker_1", entry, settings.history_cap).await.unwrap();
  }

  let source = Arc::new(MemoryJobSource::new(JobPolicy::default()));
  source.push("default", "TestJob", json!({"message": "a"})).await.unwrap();
  source.push("default", "TestJob", json!({"message": "b"})).await.unwrap();
  source.push("emails", "TestJob", json!({"message": "c"})).await.unwrap();

  Dashboard { state, history, source }
}

async fn get_json(addr: SocketAddr, path: &str) -> (u16, Value) {
  let response = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
  let status = response.status().as_u16();
  (status, response.json().await.unwrap())
}

#[tokio::test]
async fn workers_endpoint_lists_records_with_stats() {
  let addr = serve(seeded().await).await;
  let (status, body) = get_json(addr, "/flow/api/workers").await;

  assert_eq!(status, 200);
  assert_eq!(body["stats"], json!({"total": 3, "active": 1, "idle": 1, "failed": 1}));
  let ids: Vec<&str> = body["workers"]
    .as_array()
    .unwrap()
    .iter()
    .map(|w| w["id"].as_str().unwrap())
    .collect();
  assert_eq!(ids, vec!["flow_worker_1", "flow_worker_2", "flow_worker_3"]);
  assert_eq!(body["workers"][1]["status"], "active");
  assert_eq!(body["workers"][1]["current_job"]["class"], "TestJob");
  assert!(body["workers"][0]["current_job"].is_null());
}

#[tokio::test]
async fn history_endpoint_returns_newest_first() {
  let addr = serve(seeded().await).await;
  let (status, body) = get_json(addr, "/flow/api/workers/flow_worker_1/history").await;

  assert_eq!(status, 200);
  assert_eq!(body["worker_id"], "flow_worker_1");
  assert_eq!(body["total_jobs"], 2);
  assert_eq!(body["history"][0]["processing_time"], 10);
  assert_eq!(body["history"][1]["processing_time"], 0);
}

#[tokio::test]
async fn history_of_an_unknown_worker_is_empty() {
  let addr = serve(seeded().await).await;
  let (status, body) = get_json(addr, "/flow/api/workers/flow_worker_9/history").await;
  assert_eq!(status, 200);
  assert_eq!(body["total_jobs"], 0);
  assert_eq!(body["history"], json!([]));
}

#[tokio::test]
async fn malformed_worker_ids_are_rejected() {
  let addr = serve(seeded().await).await;
  let (status, body) = get_json(addr, "/flow/api/workers/bad.id/history").await;
  assert_eq!(status, 400);
  assert_eq!(body["error"], "Invalid worker id");
}

#[tokio::test]
async fn jobs_endpoint_counts_pending_by_queue() {
  let addr = serve(seeded().await).await;
  let (status, body) = get_json(addr, "/flow/api/jobs").await;

  assert_eq!(status, 200);
  assert_eq!(body["stats"]["total_pending"], 3);
  assert_eq!(body["stats"]["by_queue"], json!({"default": 2, "emails": 1}));
  assert_eq!(body["pending_jobs"][0]["data"]["message"], "c");
  assert_eq!(body["pending_jobs"][0]["status"], "pending");
}

#[tokio::test]
async fn unknown_paths_are_json_404s() {
  let addr = serve(seeded().await).await;
  let (status, body) = get_json(addr, "/flow/api/nope").await;
  assert_eq!(status, 404);
  assert_eq!(body["error"], "Not found");
}

#[tokio::test]
async fn worker_stream_speaks_server_sent_events() {
  let addr = serve(seeded().await).await;
  let response = tokio::time::timeout(
    Duration::from_secs(5),
    reqwest::get(format!("http://{addr}/flow/api/workers/stream")),
  )
  .await
  .unwrap()
  .unwrap();

  assert_eq!(response.status().as_u16(), 200);
  let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
  assert!(content_type.starts_with("text/event-stream"));
}
