use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flow::config::{JobPolicy, SupervisorArgs};
use flow::database::setup_database;
use flow::history::HistoryLog;
use flow::job_source::PgJobSource;
use flow::process::CommandLauncher;
use flow::routes::{routes, Dashboard};
use flow::shutdown::install_shutdown_handler;
use flow::state::WorkerState;
use flow::store::{PgStore, StateStore};
use flow::supervisor::Supervisor;

fn worker_binary(configured: Option<PathBuf>) -> anyhow::Result<PathBuf> {
  if let Some(path) = configured {
    return Ok(path);
  }
  let exe = std::env::current_exe().context("cannot locate the flow executable")?;
  Ok(exe.with_file_name("flow_worker"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = SupervisorArgs::parse();
  let config = args.supervisor_config();
  info!("Flow - queue supervisor with real-time visibility");

  let pool = setup_database(&args.database_url).await.context("database setup failed")?;
  let store: Arc<dyn StateStore> = Arc::new(PgStore::new(pool.clone()));
  let shutdown = install_shutdown_handler()?;

  let dashboard = Dashboard {
    state: WorkerState::new(store.clone(), config.state.clone()),
    history: HistoryLog::new(store.clone(), config.state.history_ttl),
    source: Arc::new(PgJobSource::new(pool, JobPolicy::default())),
  };
  let mut server_shutdown = shutdown.clone();
  let (addr, server) = warp::serve(routes(dashboard))
    .try_bind_with_graceful_shutdown(([0, 0, 0, 0], args.dashboard), async move {
      let _ = server_shutdown.wait_for(|stop| *stop).await;
    })
    .context("cannot bind dashboard port")?;
  let server = tokio::spawn(server);
  info!("Dashboard available at: http://{}/flow/api/workers", addr);

  let mut launcher =
    CommandLauncher::new(worker_binary(args.worker_bin.clone())?).env("DATABASE_URL", args.database_url.clone());
  for (key, value) in args.state.env_vars() {
    launcher = launcher.env(key, value);
  }
  let mut supervisor = Supervisor::new(launcher, store, config);
  supervisor.spawn_pool(args.workers, &args.queues).await?;
  info!("{} workers started successfully. Press Ctrl+C to stop all workers", args.workers);

  let report = supervisor.run(shutdown).await?;
  info!(
    graceful = report.graceful.len(),
    forced = report.forced.len(),
    "Supervisor stopped"
  );
  let _ = server.await;
  Ok(())
}
