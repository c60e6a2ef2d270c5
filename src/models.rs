use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
  Idle,
  Active,
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Processing,
  Completed,
  Failed,
}

/// Resident memory of a worker process, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
  pub current: u64,
  pub peak: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
  pub id: Uuid,
  pub class: String,
  pub queue: String,
  pub status: JobStatus,
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failed_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub processing_time: Option<u64>,
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
  pub id: String,
  pub queue: String,
  pub status: WorkerStatus,
  pub pid: Option<u32>,
  pub started_at: DateTime<Utc>,
  pub last_heartbeat: DateTime<Utc>,
  pub uptime: u64,
  pub jobs_processed: u64,
  pub current_job: Option<JobRecord>,
  #[serde(default)]
  pub memory_usage: Option<ResourceSnapshot>,
}

impl WorkerRecord {
  pub fn idle(id: &str, queue: &str, pid: Option<u32>, started_at: DateTime<Utc>) -> Self {
    let now = Utc::now();
    Self {
      id: id.to_string(),
      queue: queue.to_string(),
      status: WorkerStatus::Idle,
      pid,
      started_at,
      last_heartbeat: now,
      uptime: uptime_secs(started_at, now),
      jobs_processed: 0,
      current_job: None,
      memory_usage: None,
    }
  }

  /// Puts the worker to work on `job`. Status and current job move together.
  pub fn activate(&mut self, job: JobRecord) {
    self.status = WorkerStatus::Active;
    self.current_job = Some(job);
    self.touch();
  }

  pub fn release(&mut self) {
    self.status = WorkerStatus::Idle;
    self.current_job = None;
    self.touch();
  }

  pub fn touch(&mut self) {
    let now = Utc::now();
    self.last_heartbeat = now;
    self.uptime = uptime_secs(self.started_at, now);
  }

  pub fn is_consistent(&self) -> bool {
    (self.status == WorkerStatus::Active) == self.current_job.is_some()
  }
}

/// Which worker claimed an in-flight job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
  pub worker_id: String,
  pub started_at: DateTime<Utc>,
}

/// A job waiting in the job source, as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingJob {
  pub id: Uuid,
  pub queue: String,
  pub class: String,
  pub data: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub status: String,
}

pub fn uptime_secs(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
  (now - started_at).num_seconds().max(0) as u64
}

/// Milliseconds since `started_at`; zero when the start is unknown or in the future.
pub fn processing_time_ms(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u64 {
  started_at
    .map(|start| (now - start).num_milliseconds().max(0) as u64)
    .unwrap_or(0)
}
