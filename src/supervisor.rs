use crate::paths::Paths;
use crate::runtime::LaunchSpec;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("cannot open log file: {0}")]
    LogFile(std::io::Error),
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

struct ManagedProcess {
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
}

impl ManagedProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Owns the live OS process of every service.
///
/// Composite operations on one service take [`Supervisor::lock`] first; the
/// process table itself is only held for inserts, removals and probes.
pub struct Supervisor {
    paths: Paths,
    kill_timeout: Duration,
    table: Mutex<HashMap<String, ManagedProcess>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Supervisor {
    pub fn new(paths: Paths, kill_timeout: Duration) -> Self {
        Self {
            paths,
            kill_timeout,
            table: Mutex::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Serializes operations on one service id. Different ids never contend.
    pub async fn lock(&self, service_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(service_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops the lock entry of a deleted service.
    pub fn forget(&self, service_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(service_id);
    }

    /// Spawns the service process in its own process group, appending
    /// stdout and stderr to the service log. A stale entry is replaced.
    pub async fn start(&self, service_id: &str, spec: &LaunchSpec) -> Result<u32, SupervisorError> {
        std::fs::create_dir_all(self.paths.log_dir()).map_err(SupervisorError::LogFile)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.paths.service_log(service_id))
            .map_err(SupervisorError::LogFile)?;
        let log_err = log.try_clone().map_err(SupervisorError::LogFile)?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        let child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let stale = {
            let mut table = self.table.lock().await;
            table.insert(
                service_id.to_string(),
                ManagedProcess {
                    child,
                    pid,
                    started_at: Instant::now(),
                },
            )
        };
        if let Some(mut stale) = stale
            && stale.is_alive()
        {
            tracing::warn!(service = service_id, pid = ?stale.pid, "replacing live process");
            send_group(stale.pid, Signal::SIGKILL);
            tokio::spawn(async move {
                let _ = stale.child.wait().await;
            });
        }

        tracing::info!(service = service_id, pid = ?pid, program = %spec.program, "started process");
        Ok(pid.unwrap_or_default())
    }

    /// Terminates the service process: SIGTERM, then SIGKILL once the grace
    /// window passes. Returns `false` when there was nothing to stop.
    pub async fn stop(&self, service_id: &str) -> bool {
        let entry = self.table.lock().await.remove(service_id);
        match entry {
            Some(process) => {
                terminate(service_id, process, self.kill_timeout).await;
                true
            }
            None => false,
        }
    }

    /// Whether a live process is recorded for the service. Reaps it if it
    /// has exited.
    pub async fn is_alive(&self, service_id: &str) -> bool {
        let mut table = self.table.lock().await;
        table.get_mut(service_id).is_some_and(|p| p.is_alive())
    }

    pub async fn pid(&self, service_id: &str) -> Option<u32> {
        let mut table = self.table.lock().await;
        table
            .get_mut(service_id)
            .and_then(|p| if p.is_alive() { p.pid } else { None })
    }

    pub async fn uptime(&self, service_id: &str) -> Option<Duration> {
        let table = self.table.lock().await;
        table.get(service_id).map(|p| p.started_at.elapsed())
    }

    /// Stops every process concurrently. Used on daemon shutdown.
    pub async fn shutdown_all(&self) {
        let entries: Vec<_> = self.table.lock().await.drain().collect();
        let grace = self.kill_timeout;
        let mut tasks = tokio::task::JoinSet::new();
        for (id, process) in entries {
            tasks.spawn(async move { terminate(&id, process, grace).await });
        }
        while tasks.join_next().await.is_some() {}
    }
}

fn send_group(pid: Option<u32>, sig: Signal) {
    if let Some(pid) = pid {
        let _ = signal::killpg(Pid::from_raw(pid as i32), sig);
    }
}

async fn terminate(service_id: &str, mut process: ManagedProcess, grace: Duration) {
    if !process.is_alive() {
        return;
    }
    send_group(process.pid, Signal::SIGTERM);
    if tokio::time::timeout(grace, process.child.wait()).await.is_ok() {
        tracing::info!(service = service_id, pid = ?process.pid, "stopped process");
        return;
    }
    tracing::warn!(service = service_id, pid = ?process.pid, "grace period expired, sending SIGKILL");
    send_group(process.pid, Signal::SIGKILL);
    let _ = process.child.wait().await;
}
