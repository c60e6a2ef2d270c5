use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flow::config::{DispatchArgs, JobPolicy};
use flow::database::setup_database;
use flow::job_source::{JobSource, PgJobSource};
use flow::worker_processing::TestJob;

const MESSAGES: [&str; 5] = ["Process data", "Send email", "Generate report", "Cleanup files", "Update cache"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = DispatchArgs::parse();
  let pool = setup_database(&args.database_url).await.context("database setup failed")?;
  let source = PgJobSource::new(pool, JobPolicy::default());

  for i in 0..args.count {
    let message = args.message.clone().unwrap_or_else(|| MESSAGES[i % MESSAGES.len()].to_string());
    let payload = json!({ "message": message, "sleep_seconds": args.sleep_secs });
    let id = source.push(&args.queue, TestJob::CLASS, payload).await?;
    info!("Dispatched {} on {}: {} (will take {}s)", id, args.queue, message, args.sleep_secs);
  }
  Ok(())
}
