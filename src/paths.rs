use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var("DEPLOYX_DATA_DIR") {
            return Ok(Self {
                data_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::data_dir() else {
            bail!("could not determine data directory");
        };
        Ok(Self {
            data_dir: base.join("deployx"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { data_dir: base }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("deployx.pid")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.data_dir.join("deployx.sock")
    }

    pub fn db_file(&self) -> PathBuf {
        self.data_dir.join("deployx.db")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Scratch space for extracted, not yet validated uploads.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    /// Archives handed over by the CLI; the daemon deletes them once consumed.
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn services_dir(&self) -> PathBuf {
        self.data_dir.join("services")
    }

    pub fn user_dir(&self, user_id: i64) -> PathBuf {
        self.services_dir().join(format!("user_{user_id}"))
    }

    pub fn service_root(&self, user_id: i64, service_id: &str) -> PathBuf {
        self.user_dir(user_id).join(service_id)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Where an auto-spawned daemon writes its own tracing output.
    pub fn daemon_log(&self) -> PathBuf {
        self.log_dir().join("daemon.log")
    }

    pub fn service_log(&self, service_id: &str) -> PathBuf {
        self.log_dir().join(format!("{service_id}.log"))
    }

    /// Creates every directory the daemon writes into.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.staging_dir(),
            self.uploads_dir(),
            self.services_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
