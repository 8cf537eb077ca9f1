use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Language-neutral error kinds shared by the Agent and the Controller.
/// Mirrors the propagation policy: business errors cross the wire verbatim,
/// transient errors are retried at the boundary that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFailed,
    NotFound,
    InvalidRequest,
    PermissionDenied,
    AgentOffline,
    Timeout,
    SlowConsumer,
    Superseded,
    Conflict,
    RateLimited,
    TransientIo,
    UnsupportedCommand,
    Fatal,
}

impl ErrorKind {
    /// HTTP status this kind maps to at the REST surface.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::AuthFailed => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidRequest | ErrorKind::UnsupportedCommand => 400,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::Conflict => 409,
            ErrorKind::Timeout => 504,
            ErrorKind::AgentOffline => 409,
            ErrorKind::SlowConsumer | ErrorKind::Superseded => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::TransientIo | ErrorKind::Fatal => 500,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::AgentOffline => "agent_offline",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SlowConsumer => "slow_consumer",
            ErrorKind::Superseded => "superseded",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::UnsupportedCommand => "unsupported_command",
            ErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{kind_code}: {message}")]
    Kinded {
        kind: ErrorKind,
        kind_code: &'static str,
        message: String,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        FleetError::Kinded {
            kind,
            kind_code: kind.code(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Kinded { kind, .. } => *kind,
            FleetError::Serde(_) => ErrorKind::InvalidRequest,
            FleetError::Io(_) => ErrorKind::TransientIo,
        }
    }
}

/// Wire representation of an `error` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    pub code: String,
}

impl From<&FleetError> for ErrorPayload {
    fn from(e: &FleetError) -> Self {
        ErrorPayload {
            error: e.to_string(),
            code: e.kind().code().to_string(),
        }
    }
}
