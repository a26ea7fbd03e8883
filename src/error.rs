use crate::model::ServiceStatus;
use crate::store::StoreError;
use crate::supervisor::SupervisorError;

/// Failures of a single orchestrator invocation. None of them touch other services.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("could not extract archive: {0}")]
    ExtractionFailed(String),
    #[error("upload rejected, account banned: {0}")]
    ValidationFailed(String),
    #[error("deployment limit reached ({limit}); upgrade to premium for more")]
    QuotaExceeded { limit: u32 },
    #[error(
        "unsupported project type: need {entry} + {manifest} (dynamic) or {index} (static)"
    )]
    ClassificationFailed {
        entry: String,
        manifest: String,
        index: String,
    },
    #[error("dependency installation failed:\n{0}")]
    ProvisioningFailed(String),
    #[error("no free port available in {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },
    #[error("failed to start process: {0}")]
    ProcessSpawnFailed(String),
    #[error("service {0} does not exist or is not yours")]
    AuthorizationFailed(String),
    #[error("admin only")]
    AdminOnly,
    #[error("service not found: {0}")]
    NotFound(String),
    #[error("cannot {op} service {id} while it is {status}")]
    InvalidState {
        id: String,
        op: &'static str,
        status: ServiceStatus,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Stable tag carried over the wire so callers can tell stages apart.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::ExtractionFailed(_) => "extraction_failed",
            DeployError::ValidationFailed(_) => "validation_failed",
            DeployError::QuotaExceeded { .. } => "quota_exceeded",
            DeployError::ClassificationFailed { .. } => "classification_failed",
            DeployError::ProvisioningFailed(_) => "provisioning_failed",
            DeployError::ResourceExhausted { .. } => "resource_exhausted",
            DeployError::ProcessSpawnFailed(_) => "process_spawn_failed",
            DeployError::AuthorizationFailed(_) | DeployError::AdminOnly => {
                "authorization_failed"
            }
            DeployError::NotFound(_) => "not_found",
            DeployError::InvalidState { .. } => "invalid_state",
            DeployError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for DeployError {
    fn from(e: StoreError) -> Self {
        DeployError::Internal(e.to_string())
    }
}

impl From<SupervisorError> for DeployError {
    fn from(e: SupervisorError) -> Self {
        DeployError::ProcessSpawnFailed(e.to_string())
    }
}

impl From<std::io::Error> for DeployError {
    fn from(e: std::io::Error) -> Self {
        DeployError::Internal(e.to_string())
    }
}

/// Keeps the last `limit` bytes of installer output, cut on a char boundary.
pub fn truncate_output(output: &str, limit: usize) -> String {
    let trimmed = output.trim_end();
    if trimmed.len() <= limit {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - limit;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}
