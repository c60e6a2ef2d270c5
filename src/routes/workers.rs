use regex::Regex;
use serde::Serialize;
use warp::Filter;

use super::{unavailable, with_dashboard, Dashboard, InvalidWorkerId};
use crate::error::Result;
use crate::models::{JobRecord, WorkerRecord, WorkerStatus};
use crate::state::WorkerState;

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
  pub total: usize,
  pub active: usize,
  pub idle: usize,
  pub failed: usize,
}

#[derive(Serialize)]
pub struct WorkersResponse {
  pub workers: Vec<WorkerRecord>,
  pub stats: WorkerStats,
}

#[derive(Serialize)]
pub struct HistoryResponse {
  pub worker_id: String,
  pub history: Vec<JobRecord>,
  pub total_jobs: usize,
}

pub fn stats(workers: &[WorkerRecord]) -> WorkerStats {
  let count = |status| workers.iter().filter(|w| w.status == status).count();
  WorkerStats {
    total: workers.len(),
    active: count(WorkerStatus::Active),
    idle: count(WorkerStatus::Idle),
    failed: count(WorkerStatus::Failed),
  }
}

pub async fn workers_snapshot(state: &WorkerState) -> Result<WorkersResponse> {
  let workers = state.records().await?;
  let stats = stats(&workers);
  Ok(WorkersResponse { workers, stats })
}

fn valid_worker_id(id: &str) -> bool {
  Regex::new(r"^[A-Za-z0-9_\-]+$")
    .map(|re| re.is_match(id))
    .unwrap_or(false)
}

pub fn workers_route(dashboard: Dashboard) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("flow" / "api" / "workers")
    .and(warp::get())
    .and(with_dashboard(dashboard))
    .and_then(handle_workers)
}

pub fn history_route(dashboard: Dashboard) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("flow" / "api" / "workers" / String / "history")
    .and(warp::get())
    .and(with_dashboard(dashboard))
    .and_then(handle_history)
}

async fn handle_workers(dashboard: Dashboard) -> std::result::Result<impl warp::Reply, warp::Rejection> {
  let snapshot = workers_snapshot(&dashboard.state).await.map_err(unavailable)?;
  Ok(warp::reply::json(&snapshot))
}

async fn handle_history(worker_id: String, dashboard: Dashboard) -> std::result::Result<impl warp::Reply, warp::Rejection> {
  if !valid_worker_id(&worker_id) {
    return Err(warp::reject::custom(InvalidWorkerId));
  }
  let history = dashboard.history.list(&worker_id).await.map_err(unavailable)?;
  Ok(warp::reply::json(&HistoryResponse {
    total_jobs: history.len(),
    worker_id,
    history,
  }))
}
