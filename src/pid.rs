use crate::paths::Paths;
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::PathBuf;

/// The daemon's pid file. Removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Records this process as the daemon, failing if another live daemon
    /// already owns the data directory.
    pub fn acquire(paths: &Paths) -> io::Result<Self> {
        if is_daemon_running(paths)? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "daemon is already running",
            ));
        }
        let path = paths.pid_file();
        fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn read_pid(paths: &Paths) -> Option<u32> {
    fs::read_to_string(paths.pid_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Probes the recorded pid with signal 0. A pid file naming a dead process
/// is removed.
pub fn is_daemon_running(paths: &Paths) -> io::Result<bool> {
    let Some(pid) = read_pid(paths) else {
        return Ok(false);
    };
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH) => {
            let _ = fs::remove_file(paths.pid_file());
            Ok(false)
        }
        Err(e) => Err(io::Error::other(e)),
    }
}
