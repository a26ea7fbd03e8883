use crate::error::DeployError;
use crate::model::{Service, ServiceView};
use serde::{Deserialize, Serialize};

fn default_log_lines() -> usize {
    15
}

/// One request per connection, sent as a single JSON line. `user` is the id
/// the front end authenticated; admin rights are derived by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Deploy {
        user: i64,
        /// Archive path inside the daemon's uploads directory. The daemon
        /// deletes it once the request completes.
        archive: String,
    },
    Update {
        user: i64,
        service_id: String,
        archive: String,
    },
    Redeploy {
        user: i64,
        service_id: String,
    },
    Stop {
        user: i64,
        service_id: String,
    },
    Delete {
        user: i64,
        service_id: String,
    },
    Maintenance {
        user: i64,
        service_id: String,
        enabled: bool,
    },
    Suspend {
        user: i64,
        service_id: String,
    },
    Unsuspend {
        user: i64,
        service_id: String,
    },
    SetPremium {
        user: i64,
        target: i64,
        premium: bool,
    },
    Ban {
        user: i64,
        target: i64,
        reason: String,
    },
    Unban {
        user: i64,
        target: i64,
    },
    List {
        user: i64,
    },
    Info {
        user: i64,
        service_id: String,
    },
    Logs {
        user: i64,
        service_id: String,
        #[serde(default = "default_log_lines")]
        lines: usize,
    },
    Kill,
}

impl Request {
    /// The user on whose behalf the request runs, if any.
    pub fn user(&self) -> Option<i64> {
        match self {
            Request::Deploy { user, .. }
            | Request::Update { user, .. }
            | Request::Redeploy { user, .. }
            | Request::Stop { user, .. }
            | Request::Delete { user, .. }
            | Request::Maintenance { user, .. }
            | Request::Suspend { user, .. }
            | Request::Unsuspend { user, .. }
            | Request::SetPremium { user, .. }
            | Request::Ban { user, .. }
            | Request::Unban { user, .. }
            | Request::List { user }
            | Request::Info { user, .. }
            | Request::Logs { user, .. } => Some(*user),
            Request::Kill => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<Box<Service>>,
    },
    Error {
        /// Stable tag such as `quota_exceeded`; see [`DeployError::kind`].
        kind: String,
        message: String,
    },
    ServiceList {
        services: Vec<Service>,
    },
    ServiceDetail {
        info: Box<ServiceView>,
    },
    LogLines {
        lines: Vec<String>,
    },
}

impl Response {
    pub fn message(message: impl Into<String>) -> Self {
        Response::Success {
            message: Some(message.into()),
            service: None,
        }
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Response::Error {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

impl From<DeployError> for Response {
    fn from(e: DeployError) -> Self {
        Response::error(e.kind(), e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(req)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return Err(ProtocolError::Malformed("empty request".to_string()));
    }
    Ok(serde_json::from_str(trimmed)?)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(resp)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return Err(ProtocolError::Malformed("empty response".to_string()));
    }
    Ok(serde_json::from_str(trimmed)?)
}
