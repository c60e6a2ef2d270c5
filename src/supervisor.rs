//! Owns the worker processes: spawns them, restarts the ones that die,
//! and stops all of them on shutdown.
//!
//! Shutdown runs `Running -> ShuttingDown -> Stopped`. Every worker gets
//! SIGTERM, the supervisor waits out the grace window, then SIGKILLs whatever
//! is still alive and waits for it to go. Records are deleted only after the
//! processes are gone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{FlowError, Result};
use crate::history::HistoryLog;
use crate::models::{WorkerRecord, WorkerStatus};
use crate::process::{resource_snapshot, Launcher, StopSignal, WorkerProcess};
use crate::state::WorkerState;
use crate::store::StateStore;

const EXIT_POLL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Running,
  ShuttingDown,
  Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
  /// Exited within the grace window.
  pub graceful: Vec<String>,
  /// Needed SIGKILL.
  pub forced: Vec<String>,
}

struct TrackedWorker<P> {
  id: String,
  queue: String,
  process: Option<P>,
  started_at: DateTime<Utc>,
  restarts: u32,
  /// Last `jobs_processed` seen on the record of the current process.
  jobs_processed: u64,
}

impl<P: WorkerProcess> TrackedWorker<P> {
  fn is_running(&mut self) -> bool {
    self.process.as_mut().is_some_and(|process| process.is_running())
  }

  fn pid(&self) -> Option<u32> {
    self.process.as_ref().and_then(|process| process.pid())
  }
}

pub fn worker_id(index: usize) -> String {
  format!("flow_worker_{}", index + 1)
}

pub struct Supervisor<L: Launcher> {
  launcher: L,
  state: WorkerState,
  history: HistoryLog,
  config: SupervisorConfig,
  workers: Vec<TrackedWorker<L::Process>>,
  phase: Phase,
}

impl<L: Launcher> Supervisor<L> {
  pub fn new(launcher: L, store: Arc<dyn StateStore>, config: SupervisorConfig) -> Self {
    let state = WorkerState::new(store.clone(), config.state.clone());
    let history = HistoryLog::new(store, config.state.history_ttl);
    Self {
      launcher,
      state,
      history,
      config,
      workers: Vec::new(),
      phase: Phase::Running,
    }
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn worker_ids(&self) -> Vec<String> {
    self.workers.iter().map(|worker| worker.id.clone()).collect()
  }

  pub fn pid(&self, worker_id: &str) -> Option<u32> {
    self.workers.iter().find(|worker| worker.id == worker_id).and_then(|worker| worker.pid())
  }

  pub fn restarts(&self, worker_id: &str) -> u32 {
    self.workers.iter().find(|worker| worker.id == worker_id).map_or(0, |worker| worker.restarts)
  }

  /// Spawns `count` workers, handing out `queues` round-robin.
  pub async fn spawn_pool(&mut self, count: usize, queues: &[String]) -> Result<()> {
    let default_queue = ["default".to_string()];
    let queues = if queues.is_empty() { &default_queue[..] } else { queues };
    info!("Starting {} workers for queues: {}", count, queues.join(", "));
    for index in 0..count {
      let queue = &queues[index % queues.len()];
      self.spawn(&worker_id(index), queue).await?;
    }
    Ok(())
  }

  /// Starts a worker process and writes its idle record and empty history.
  pub async fn spawn(&mut self, worker_id: &str, queue: &str) -> Result<()> {
    let process = self.launcher.launch(worker_id, queue)?;
    let pid = process.pid();
    let started_at = Utc::now();

    match self.workers.iter_mut().find(|worker| worker.id == worker_id) {
      Some(worker) => {
        worker.queue = queue.to_string();
        worker.process = Some(process);
        worker.started_at = started_at;
        worker.jobs_processed = 0;
      }
      None => self.workers.push(TrackedWorker {
        id: worker_id.to_string(),
        queue: queue.to_string(),
        process: Some(process),
        started_at,
        restarts: 0,
        jobs_processed: 0,
      }),
    }

    self.state.put_record(&WorkerRecord::idle(worker_id, queue, pid, started_at)).await?;
    self.history.reset(worker_id).await?;
    self.publish_registry().await?;
    info!(worker_id, pid, queue, "Worker started");
    Ok(())
  }

  async fn publish_registry(&self) -> Result<()> {
    self.state.publish_registry(&self.worker_ids()).await
  }

  /// One liveness pass: restart dead workers, refresh live ones.
  pub async fn health_check_tick(&mut self) -> Result<()> {
    if self.phase != Phase::Running {
      return Ok(());
    }
    for index in 0..self.workers.len() {
      if self.workers[index].is_running() {
        self.refresh(index).await?;
      } else {
        self.restart(index).await?;
      }
    }
    self.publish_registry().await?;
    let purged = self.state.store().purge_expired().await?;
    if purged > 0 {
      debug!(purged, "Dropped expired state keys");
    }
    Ok(())
  }

  async fn refresh(&mut self, index: usize) -> Result<()> {
    let worker = &self.workers[index];
    let (id, queue, started_at) = (worker.id.clone(), worker.queue.clone(), worker.started_at);
    let pid = worker.pid();
    let memory = pid.and_then(resource_snapshot);

    let updated = self
      .state
      .update_record(&id, |record| {
        record.pid = pid;
        record.memory_usage = memory;
        record.touch();
      })
      .await?;

    match updated {
      Some(record) => self.workers[index].jobs_processed = record.jobs_processed,
      None => {
        debug!(worker_id = %id, "Worker record expired, writing it again");
        let mut record = WorkerRecord::idle(&id, &queue, pid, started_at);
        record.memory_usage = memory;
        record.jobs_processed = self.workers[index].jobs_processed;
        self.state.put_record(&record).await?;
      }
    }
    Ok(())
  }

  async fn restart(&mut self, index: usize) -> Result<()> {
    let (id, queue, old_pid) = {
      let worker = &mut self.workers[index];
      worker.restarts += 1;
      (worker.id.clone(), worker.queue.clone(), worker.pid())
    };
    warn!(worker_id = %id, pid = old_pid, restarts = self.workers[index].restarts, "Worker died, restarting");
    self.state.forget_record(&id).await?;

    match self.spawn(&id, &queue).await {
      Ok(()) => Ok(()),
      Err(FlowError::Spawn { worker_id, source }) => {
        error!(worker_id = %worker_id, error = %source, "Restart failed, retrying next tick");
        let worker = &mut self.workers[index];
        worker.process = None;
        let mut record = WorkerRecord::idle(&id, &queue, None, worker.started_at);
        record.status = WorkerStatus::Failed;
        self.state.put_record(&record).await
      }
      Err(e) => Err(e),
    }
  }

  /// Ticks until `shutdown` fires, then stops every worker.
  pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<ShutdownReport> {
    let mut ticker = tokio::time::interval(self.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    while !*shutdown.borrow() {
      tokio::select! {
        _ = shutdown.changed() => break,
        _ = ticker.tick() => {}
      }
      self.health_check_tick().await?;
    }
    Ok(self.shutdown().await)
  }

  /// Graceful stop with forced escalation. Returns once no worker process
  /// is left running.
  pub async fn shutdown(&mut self) -> ShutdownReport {
    self.phase = Phase::ShuttingDown;
    info!("Shutting down Flow supervisor...");

    for worker in &mut self.workers {
      if !worker.is_running() {
        continue;
      }
      info!(worker_id = %worker.id, "Stopping worker...");
      if let Some(process) = worker.process.as_mut() {
        if let Err(e) = process.signal(StopSignal::Terminate) {
          warn!(worker_id = %worker.id, error = %e, "Graceful stop signal failed");
        }
      }
    }

    self.wait_for_exit(self.config.grace_window).await;

    let mut report = ShutdownReport::default();
    for worker in &mut self.workers {
      if !worker.is_running() {
        report.graceful.push(worker.id.clone());
        continue;
      }
      warn!(worker_id = %worker.id, "Worker still running after grace window, killing");
      if let Some(process) = worker.process.as_mut() {
        if let Err(e) = process.signal(StopSignal::Kill) {
          error!(worker_id = %worker.id, error = %e, "Kill signal failed");
        }
      }
      report.forced.push(worker.id.clone());
    }

    if !report.forced.is_empty() {
      self.wait_for_exit(KILL_WAIT).await;
    }

    for worker in &self.workers {
      if let Err(e) = self.state.forget_record(&worker.id).await {
        warn!(worker_id = %worker.id, error = %e, "Could not delete worker record");
      }
    }
    if let Err(e) = self.state.forget_registry().await {
      warn!(error = %e, "Could not delete worker registry");
    }

    self.phase = Phase::Stopped;
    info!("All workers stopped");
    report
  }

  async fn wait_for_exit(&mut self, limit: Duration) {
    let deadline = Instant::now() + limit;
    loop {
      let mut running = 0;
      for worker in &mut self.workers {
        if worker.is_running() {
          running += 1;
        }
      }
      if running == 0 {
        return;
      }
      let now = Instant::now();
      if now >= deadline {
        debug!(running, "Wait for worker exit timed out");
        return;
      }
      tokio::time::sleep(EXIT_POLL.min(deadline - now)).await;
    }
  }
}
