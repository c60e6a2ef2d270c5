use std::convert::Infallible;
use std::sync::Arc;

use serde_json::json;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::history::HistoryLog;
use crate::job_source::JobSource;
use crate::state::WorkerState;

pub mod jobs;
pub mod sse;
pub mod workers;

/// Everything the read-only dashboard API looks at.
#[derive(Clone)]
pub struct Dashboard {
  pub state: WorkerState,
  pub history: HistoryLog,
  pub source: Arc<dyn JobSource>,
}

#[derive(Debug)]
pub(crate) struct StoreUnavailable {
  pub message: String,
}
impl warp::reject::Reject for StoreUnavailable {}

#[derive(Debug)]
pub(crate) struct InvalidWorkerId;
impl warp::reject::Reject for InvalidWorkerId {}

pub(crate) fn unavailable(e: impl std::fmt::Display) -> Rejection {
  error!("Dashboard read failed: {}", e);
  warp::reject::custom(StoreUnavailable { message: e.to_string() })
}

fn with_dashboard(dashboard: Dashboard) -> impl Filter<Extract = (Dashboard,), Error = Infallible> + Clone {
  warp::any().map(move || dashboard.clone())
}

pub fn routes(dashboard: Dashboard) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  jobs::jobs_route(dashboard.clone())
    .or(sse::workers_stream_route(dashboard.clone()))
    .or(workers::workers_route(dashboard.clone()))
    .or(workers::history_route(dashboard))
    .recover(handle_rejection)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message) = if err.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found".to_string())
  } else if err.find::<InvalidWorkerId>().is_some() {
    (StatusCode::BAD_REQUEST, "Invalid worker id".to_string())
  } else if let Some(e) = err.find::<StoreUnavailable>() {
    (StatusCode::SERVICE_UNAVAILABLE, e.message.clone())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
  } else {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status))
}
