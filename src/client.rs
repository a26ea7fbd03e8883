use crate::archive;
use crate::paths::Paths;
use crate::pid;
use crate::protocol::{self, Request, Response};
use color_eyre::eyre::{Context, bail};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn send_request(paths: &Paths, request: &Request) -> color_eyre::Result<Response> {
    ensure_daemon_running(paths)?;
    let mut stream = connect_with_retry(paths, 10, Duration::from_millis(200))?;

    let encoded = protocol::encode_request(request)?;
    stream.write_all(&encoded)?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let response = protocol::decode_response(&line)?;
    Ok(response)
}

/// Places a copy of `source` in the uploads directory for the daemon to
/// consume. A directory is packed into a `.tar.gz` first.
pub fn stage_upload(paths: &Paths, source: &Path) -> color_eyre::Result<PathBuf> {
    let uploads = paths.uploads_dir();
    fs::create_dir_all(&uploads)?;
    let dest = uploads.join(format!("{}.tar.gz", uuid::Uuid::new_v4().simple()));

    if source.is_dir() {
        archive::pack(source, &dest)
            .with_context(|| format!("failed to pack {}", source.display()))?;
    } else {
        fs::copy(source, &dest)
            .with_context(|| format!("failed to copy {}", source.display()))?;
    }
    Ok(dest)
}

fn ensure_daemon_running(paths: &Paths) -> color_eyre::Result<()> {
    if pid::is_daemon_running(paths)? && paths.socket_file().exists() {
        return Ok(());
    }

    spawn_daemon(paths)?;

    // Wait for socket file to appear
    let socket = paths.socket_file();
    for _ in 0..50 {
        if socket.exists() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    bail!("timed out waiting for daemon to start");
}

fn spawn_daemon(paths: &Paths) -> color_eyre::Result<()> {
    let exe = std::env::current_exe().context("failed to get current executable path")?;
    fs::create_dir_all(paths.log_dir())?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.daemon_log())
        .context("failed to open daemon log")?;

    std::process::Command::new(exe)
        .arg("--daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(log)
        .process_group(0)
        .spawn()
        .context("failed to spawn daemon")?;

    Ok(())
}

fn connect_with_retry(
    paths: &Paths,
    retries: u32,
    delay: Duration,
) -> color_eyre::Result<UnixStream> {
    let socket = paths.socket_file();
    let mut attempt = 0;
    loop {
        match UnixStream::connect(&socket) {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt + 1 >= retries => {
                bail!("failed to connect to daemon after {retries} attempts: {e}");
            }
            Err(_) => {
                attempt += 1;
                std::thread::sleep(delay);
            }
        }
    }
}
