//! OS process control for worker processes.

use std::path::PathBuf;
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::{FlowError, Result};
use crate::models::ResourceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
  /// SIGTERM: finish the job in hand, then exit.
  Terminate,
  /// SIGKILL.
  Kill,
}

pub trait WorkerProcess: Send {
  fn pid(&self) -> Option<u32>;

  /// Non-blocking; reaps the process once it has exited.
  fn is_running(&mut self) -> bool;

  fn signal(&mut self, signal: StopSignal) -> Result<()>;
}

pub trait Launcher: Send + Sync {
  type Process: WorkerProcess;

  fn launch(&self, worker_id: &str, queue: &str) -> Result<Self::Process>;
}

/// Starts `program` with an argument template. `{worker_id}` and `{queue}`
/// are substituted in every argument.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
  program: PathBuf,
  args: Vec<String>,
  envs: Vec<(String, String)>,
  cwd: Option<PathBuf>,
}

impl CommandLauncher {
  pub fn new(program: impl Into<PathBuf>) -> Self {
    Self {
      program: program.into(),
      args: vec!["{worker_id}".into(), "--queue={queue}".into()],
      envs: Vec::new(),
      cwd: None,
    }
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args = args.into_iter().map(Into::into).collect();
    self
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.envs.push((key.into(), value.into()));
    self
  }

  pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.cwd = Some(dir.into());
    self
  }

  pub fn render_args(&self, worker_id: &str, queue: &str) -> Vec<String> {
    self
      .args
      .iter()
      .map(|arg| arg.replace("{worker_id}", worker_id).replace("{queue}", queue))
      .collect()
  }
}

impl Launcher for CommandLauncher {
  type Process = ChildProcess;

  fn launch(&self, worker_id: &str, queue: &str) -> Result<ChildProcess> {
    let mut command = Command::new(&self.program);
    command
      .args(self.render_args(worker_id, queue))
      .envs(self.envs.iter().map(|(key, value)| (key, value)))
      .stdin(Stdio::null())
      .kill_on_drop(true);
    if let Some(cwd) = &self.cwd {
      command.current_dir(cwd);
    }
    let child = command.spawn().map_err(|source| FlowError::Spawn {
      worker_id: worker_id.to_string(),
      source,
    })?;
    let pid = child.id();
    Ok(ChildProcess { child, pid })
  }
}

pub struct ChildProcess {
  child: Child,
  pid: Option<u32>,
}

impl WorkerProcess for ChildProcess {
  fn pid(&self) -> Option<u32> {
    self.pid
  }

  fn is_running(&mut self) -> bool {
    matches!(self.child.try_wait(), Ok(None))
  }

  fn signal(&mut self, stop: StopSignal) -> Result<()> {
    // A reaped pid may already belong to someone else.
    let running = self.is_running();
    let Some(pid) = self.pid.filter(|_| running) else {
      return Ok(());
    };
    match stop {
      StopSignal::Terminate => match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(FlowError::Signal { pid, message: e.to_string() }),
      },
      StopSignal::Kill => self
        .child
        .start_kill()
        .map_err(|e| FlowError::Signal { pid, message: e.to_string() }),
    }
  }
}

/// Current and peak resident memory of `pid`, from `/proc`.
pub fn resource_snapshot(pid: u32) -> Option<ResourceSnapshot> {
  let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
  parse_proc_status(&status)
}

fn parse_proc_status(status: &str) -> Option<ResourceSnapshot> {
  let field = |name: &str| {
    status
      .lines()
      .find_map(|line| line.strip_prefix(name))
      .and_then(|rest| rest.split_whitespace().next())
      .and_then(|kb| kb.parse::<u64>().ok())
      .map(|kb| kb * 1024)
  };
  let current = field("VmRSS:")?;
  let peak = field("VmHWM:").unwrap_or(current);
  Some(ResourceSnapshot { current, peak })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn renders_worker_id_and_queue() {
    let launcher = CommandLauncher::new("/usr/local/bin/flow_worker");
    assert_eq!(
      launcher.render_args("flow_worker_3", "emails"),
      vec!["flow_worker_3".to_string(), "--queue=emails".to_string()]
    );
  }

  #[test]
  fn parses_rss_and_peak() {
    let status = "Name:\tflow_worker\nVmHWM:\t   2048 kB\nVmRSS:\t   1024 kB\nThreads:\t4\n";
    assert_eq!(
      parse_proc_status(status),
      Some(ResourceSnapshot { current: 1024 * 1024, peak: 2048 * 1024 })
    );
    assert_eq!(parse_proc_status("Name:\tzombie\n"), None);
  }

  #[tokio::test]
  async fn terminate_stops_a_real_child() {
    let launcher = CommandLauncher::new("sleep").args(["30"]);
    let mut process = launcher.launch("flow_worker_1", "default").unwrap();
    assert!(process.pid().is_some());
    assert!(process.is_running());
    process.signal(StopSignal::Terminate).unwrap();
    let mut stopped = false;
    for _ in 0..100 {
      if !process.is_running() {
        stopped = true;
        break;
      }
      tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(stopped);
    process.signal(StopSignal::Terminate).unwrap();
  }

  #[tokio::test]
  async fn children_see_configured_env() {
    let launcher = CommandLauncher::new("sh")
      .args(["-c", "[ \"$FLOW_PROBE\" = yes ] && sleep 30"])
      .env("FLOW_PROBE", "yes");
    let mut process = launcher.launch("flow_worker_1", "default").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(process.is_running());
    process.signal(StopSignal::Kill).unwrap();
  }

  #[tokio::test]
  async fn missing_program_is_a_spawn_error() {
    let launcher = CommandLauncher::new("/nonexistent/flow_worker");
    assert!(matches!(
      launcher.launch("flow_worker_1", "default"),
      Err(FlowError::Spawn { .. })
    ));
  }
}
