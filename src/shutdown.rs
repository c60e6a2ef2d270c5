use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::error::Result;

/// Listens for SIGTERM and SIGINT. The returned receiver flips to `true`
/// on the first one.
pub fn install_shutdown_handler() -> Result<watch::Receiver<bool>> {
  let (tx, rx) = watch::channel(false);
  let mut sigterm = signal(SignalKind::terminate())?;
  let mut sigint = signal(SignalKind::interrupt())?;

  tokio::spawn(async move {
    tokio::select! {
      _ = sigterm.recv() => {
        tracing::info!("Received SIGTERM, initiating graceful shutdown");
      }
      _ = sigint.recv() => {
        tracing::info!("Received SIGINT, initiating graceful shutdown");
      }
    }
    let _ = tx.send(true);
    // Keep the sender alive so receivers never see a closed channel.
    tx.closed().await;
  });

  Ok(rx)
}
