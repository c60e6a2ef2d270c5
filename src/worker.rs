use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flow::arbiter::Arbiter;
use flow::config::{StateSettings, WorkerArgs};
use flow::database::connect;
use flow::history::HistoryLog;
use flow::job_source::{JobSource, PgJobSource};
use flow::runtime::WorkerRuntime;
use flow::shutdown::install_shutdown_handler;
use flow::state::WorkerState;
use flow::store::{PgStore, StateStore};
use flow::worker_processing::Handlers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = WorkerArgs::parse();
  let settings = StateSettings::from(&args.state);
  let pool = connect(&args.database_url).await.context("database connection failed")?;
  let shutdown = install_shutdown_handler()?;

  let store: Arc<dyn StateStore> = Arc::new(PgStore::new(pool.clone()));
  let state = WorkerState::new(store.clone(), settings.clone());
  let history = HistoryLog::new(store, settings.history_ttl);
  let (notifier, arbiter) = Arbiter::new(state.clone(), history).spawn(16);

  let source: Arc<dyn JobSource> = Arc::new(PgJobSource::new(pool, args.policy()));
  let runtime = WorkerRuntime::new(
    args.worker_id.clone(),
    args.queue.clone(),
    source,
    Arc::new(Handlers::with_defaults()),
    notifier,
    state,
  )
    .idle_sleep(Duration::from_secs(args.sleep_secs));

  runtime.start().await?;
  runtime.run(shutdown).await?;

  drop(runtime);
  let _ = arbiter.await;
  info!("[{}] Worker exited", args.worker_id);
  Ok(())
}
