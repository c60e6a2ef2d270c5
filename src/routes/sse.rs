use std::convert::Infallible;
use std::time::Duration;

use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::warn;
use warp::Filter;

use super::workers::workers_snapshot;
use super::{with_dashboard, Dashboard};

const PUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Pushes the `/flow/api/workers` payload every couple of seconds.
pub fn workers_stream_route(dashboard: Dashboard) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("flow" / "api" / "workers" / "stream")
    .and(warp::get())
    .and(with_dashboard(dashboard))
    .map(handle_stream)
}

fn handle_stream(dashboard: Dashboard) -> impl warp::Reply {
  let interval = IntervalStream::new(tokio::time::interval(PUSH_INTERVAL));
  let stream = interval
    .then(move |_| {
      let state = dashboard.state.clone();
      async move {
        match workers_snapshot(&state).await {
          Ok(snapshot) => match warp::sse::Event::default().json_data(&snapshot) {
            Ok(event) => Some(Ok::<_, Infallible>(event.event("workers"))),
            Err(e) => {
              warn!("Could not encode workers event: {:?}", e);
              None
            }
          },
          Err(e) => {
            warn!("Error fetching worker records: {:?}", e);
            None
          }
        }
      }
    })
    .filter_map(|x| x);

  warp::sse::reply(warp::sse::keep_alive().stream(stream))
}
