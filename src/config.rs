use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT_START: u16 = 8000;
pub const DEFAULT_PORT_END: u16 = 9000;
pub const DEFAULT_PORT_ATTEMPTS: u32 = 64;
pub const DEFAULT_FREE_QUOTA: u32 = 3;
pub const DEFAULT_PREMIUM_QUOTA: u32 = 10;
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_MAX_RESTARTS: u32 = 5;
pub const DEFAULT_MIN_UPTIME_MS: u64 = 30_000;
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_OUTPUT_LIMIT: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Host name or address used when building links for users.
    pub public_host: String,
    pub admins: Vec<i64>,
    pub ports: PortSettings,
    pub quota: QuotaSettings,
    pub watchdog: WatchdogSettings,
    pub supervisor: SupervisorSettings,
    pub runtime: RuntimeSettings,
    pub notify: NotifySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortSettings {
    pub start: u16,
    pub end: u16,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaSettings {
    pub free: u32,
    pub premium: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchdogSettings {
    pub interval_ms: u64,
    pub max_restarts: u32,
    pub min_uptime_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSettings {
    pub kill_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSettings {
    /// Interpreter command line, split with shell quoting rules.
    pub python: String,
    pub entry_file: String,
    pub manifest: String,
    pub index: String,
    pub port_env: String,
    pub venv_dir: String,
    /// Bytes of installer output kept in a provisioning error.
    pub output_limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifySettings {
    pub webhook_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            public_host: "127.0.0.1".to_string(),
            admins: Vec::new(),
            ports: PortSettings::default(),
            quota: QuotaSettings::default(),
            watchdog: WatchdogSettings::default(),
            supervisor: SupervisorSettings::default(),
            runtime: RuntimeSettings::default(),
            notify: NotifySettings::default(),
        }
    }
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_START,
            end: DEFAULT_PORT_END,
            max_attempts: DEFAULT_PORT_ATTEMPTS,
        }
    }
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            free: DEFAULT_FREE_QUOTA,
            premium: DEFAULT_PREMIUM_QUOTA,
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
            max_restarts: DEFAULT_MAX_RESTARTS,
            min_uptime_ms: DEFAULT_MIN_UPTIME_MS,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            entry_file: "app.py".to_string(),
            manifest: "requirements.txt".to_string(),
            index: "index.html".to_string(),
            port_env: "PORT".to_string(),
            venv_dir: "venv".to_string(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

impl Settings {
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    pub fn quota_for(&self, premium: bool) -> u32 {
        if premium {
            self.quota.premium
        } else {
            self.quota.free
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.start == 0 || self.ports.start > self.ports.end {
            return Err(ConfigError::Invalid(format!(
                "port range {}-{} is empty",
                self.ports.start, self.ports.end
            )));
        }
        if self.ports.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "ports.max_attempts must be positive".to_string(),
            ));
        }
        if self.watchdog.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.interval_ms must be positive".to_string(),
            ));
        }
        match shell_words::split(&self.runtime.python) {
            Ok(words) if !words.is_empty() => Ok(()),
            Ok(_) => Err(ConfigError::Invalid(
                "runtime.python is empty".to_string(),
            )),
            Err(e) => Err(ConfigError::Invalid(format!(
                "runtime.python is not a valid command line: {e}"
            ))),
        }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("{0}")]
    IoError(String),
}

/// Loads settings from `path`, falling back to defaults when the file is absent.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(e) => return Err(ConfigError::IoError(format!("{}: {}", path.display(), e))),
    };
    parse_settings(&content)
}

pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    let settings: Settings =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;
    settings.validate()?;
    Ok(settings)
}
