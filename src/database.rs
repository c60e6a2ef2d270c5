use sqlx::{Pool, Postgres};
use sqlx::migrate::Migrator;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;

use crate::error::Result;

static MIGRATOR: Migrator = sqlx::migrate!();

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

pub async fn connect(database_url: &str) -> Result<Pool<Postgres>> {
  let pool = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Pool::<Postgres>::connect(database_url)
  })
    .await?;
  Ok(pool)
}

/// Connects and brings the schema up to date.
pub async fn setup_database(database_url: &str) -> Result<Pool<Postgres>> {
  let pool = connect(database_url).await?;
  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}
