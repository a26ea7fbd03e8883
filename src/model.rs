use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Maintenance,
    Suspended,
    /// Tripped by the watchdog after too many rapid crashes.
    CrashLoop,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Maintenance => "maintenance",
            ServiceStatus::Suspended => "suspended",
            ServiceStatus::CrashLoop => "crash_loop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ServiceStatus::Running),
            "stopped" => Some(ServiceStatus::Stopped),
            "maintenance" => Some(ServiceStatus::Maintenance),
            "suspended" => Some(ServiceStatus::Suspended),
            "crash_loop" => Some(ServiceStatus::CrashLoop),
            _ => None,
        }
    }

    /// Deletion is valid from every state and is not modelled here.
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (self, next),
            (Running, Running | Stopped | Maintenance | Suspended | CrashLoop)
                | (Stopped, Running | Suspended)
                | (Maintenance, Running)
                | (Suspended, Running)
                | (CrashLoop, Running | Stopped | Maintenance | Suspended)
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    /// Static documents served as-is.
    Static,
    /// Application entry point plus a dependency manifest.
    Dynamic,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Static => "static",
            ProjectType::Dynamic => "dynamic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(ProjectType::Static),
            "dynamic" => Some(ProjectType::Dynamic),
            _ => None,
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub user_id: i64,
    pub port: u16,
    pub status: ServiceStatus,
    pub project_type: ProjectType,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub last_restart: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_token: Option<String>,
    #[serde(default)]
    pub domain_verified: bool,
}

impl Service {
    pub fn link(&self, host: &str) -> String {
        format!("http://{host}:{}", self.port)
    }
}

/// A service as shown to its owner, with runtime facts attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceView {
    #[serde(flatten)]
    pub service: Service,
    pub link: String,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    /// Whether a watchdog currently monitors the service.
    pub monitored: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub premium: bool,
    pub deployment_count: u32,
}

impl User {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            premium: false,
            deployment_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ban {
    pub user_id: i64,
    pub reason: String,
    pub banned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub user_id: i64,
    pub action: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityLogEntry {
    pub fn now(user_id: i64, action: &str, details: impl Into<String>) -> Self {
        Self {
            user_id,
            action: action.to_string(),
            details: details.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The user on whose behalf an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub admin: bool,
}

impl Actor {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            admin: false,
        }
    }

    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id,
            admin: true,
        }
    }
}
