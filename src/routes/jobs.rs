use std::collections::BTreeMap;

use serde::Serialize;
use warp::Filter;

use super::{unavailable, with_dashboard, Dashboard};
use crate::models::PendingJob;

#[derive(Serialize)]
pub struct JobStats {
  pub total_pending: usize,
  pub by_queue: BTreeMap<String, usize>,
}

#[derive(Serialize)]
pub struct JobsResponse {
  pub pending_jobs: Vec<PendingJob>,
  pub stats: JobStats,
}

pub fn jobs_route(dashboard: Dashboard) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("flow" / "api" / "jobs")
    .and(warp::get())
    .and(with_dashboard(dashboard))
    .and_then(handle_jobs)
}

async fn handle_jobs(dashboard: Dashboard) -> Result<impl warp::Reply, warp::Rejection> {
  let pending_jobs = dashboard.source.pending().await.map_err(unavailable)?;
  let mut by_queue = BTreeMap::new();
  for job in &pending_jobs {
    *by_queue.entry(job.queue.clone()).or_insert(0) += 1;
  }
  let response = JobsResponse {
    stats: JobStats {
      total_pending: pending_jobs.len(),
      by_queue,
    },
    pending_jobs,
  };
  Ok(warp::reply::json(&response))
}
