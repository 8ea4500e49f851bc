// Error taxonomy shared by the command surface and the proxy path
//
// Every user-visible failure carries one of these stable kinds so the UI
// can match on them without parsing message strings. Component-internal
// recoverable errors (cache misses, schema coercion) never surface here.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Stable error kinds. The wire form is snake_case (`"port_busy"` etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Reserved,
    PortBusy,
    PortInvalid,
    AuthFailed,
    LoopDetected,
    UpstreamError,
    ParseError,
    RequestInterrupted,
    Timeout,
    IoError,
    PricingMissing,
    PricingCycle,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Reserved => "reserved",
            Self::PortBusy => "port_busy",
            Self::PortInvalid => "port_invalid",
            Self::AuthFailed => "auth_failed",
            Self::LoopDetected => "loop_detected",
            Self::UpstreamError => "upstream_error",
            Self::ParseError => "parse_error",
            Self::RequestInterrupted => "request_interrupted",
            Self::Timeout => "timeout",
            Self::IoError => "io_error",
            Self::PricingMissing => "pricing_missing",
            Self::PricingCycle => "pricing_cycle",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error envelope returned by every command and by proxy-side rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, message)
    }

    /// HTTP status used when this error is returned from the proxy port.
    pub fn http_status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::AuthFailed => StatusCode::UNAUTHORIZED,
            ErrorKind::LoopDetected => StatusCode::LOOP_DETECTED,
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::ParseError, e.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        Self::internal(format!("{e:#}"))
    }
}

/// Result alias for command handlers.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::LoopDetected).unwrap();
        assert_eq!(json, "\"loop_detected\"");
    }

    #[test]
    fn envelope_omits_empty_details() {
        let err = CoreError::new(ErrorKind::AuthFailed, "bad key");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "auth_failed");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn auth_failed_maps_to_401() {
        let err = CoreError::new(ErrorKind::AuthFailed, "unauthorized");
        assert_eq!(err.http_status(), StatusCode::UNAUTHORIZED);
    }
}
