//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! rejected operation surfaces a specific variant so callers can tell
//! "not allowed" from "too fast" from "no such name".

use std::time::Duration;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the warden daemon core.
#[derive(Error, Debug)]
pub enum Error {
    /// Credential rejected by the identity provider.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Policy denied the request, or the session is not in a phase that may ask.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Sender exhausted its token bucket.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A registry already holds an entry under this name.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// Lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Sandbox backend failure.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Cancelled by shutdown or session close.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration snapshot failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Malformed request.
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure kinds reported by a sandbox backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("sandbox timeout after {0:?}")]
    Timeout(Duration),

    #[error("sandbox resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("sandbox backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("sandbox execution failed: {0}")]
    Execution(String),

    #[error("invalid sandbox spec: {0}")]
    InvalidSpec(String),
}

impl Error {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Error::NotAuthorized(_) => "NOT_AUTHORIZED",
            Error::RateLimited(_) => "RATE_LIMITED",
            Error::DuplicateName(_) => "DUPLICATE_NAME",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Sandbox(e) => e.code(),
            Error::Cancelled(_) => "CANCELLED",
            Error::ConfigInvalid(_) => "CONFIG_INVALID",
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => "INTERNAL",
        }
    }
}

impl SandboxError {
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::Timeout(_) => "SANDBOX_TIMEOUT",
            SandboxError::ResourceLimit(_) => "SANDBOX_RESOURCE_LIMIT",
            SandboxError::BackendUnavailable(_) => "SANDBOX_UNAVAILABLE",
            SandboxError::Execution(_) => "SANDBOX_EXECUTION",
            SandboxError::InvalidSpec(_) => "SANDBOX_INVALID_SPEC",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn authentication_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    pub fn not_authorized(msg: impl Into<String>) -> Self {
        Self::NotAuthorized(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    pub fn duplicate_name(msg: impl Into<String>) -> Self {
        Self::DuplicateName(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn config_invalid(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_per_rejection_kind() {
        let codes = [
            Error::authentication_failed("x").code(),
            Error::not_authorized("x").code(),
            Error::rate_limited("x").code(),
            Error::duplicate_name("x").code(),
            Error::not_found("x").code(),
            Error::cancelled("x").code(),
            Error::config_invalid("x").code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_sandbox_error_passes_through() {
        let err: Error = SandboxError::Timeout(Duration::from_secs(2)).into();
        assert_eq!(err.code(), "SANDBOX_TIMEOUT");
        assert!(err.to_string().contains("timeout"));

        let err: Error = SandboxError::BackendUnavailable("noop".into()).into();
        assert_eq!(err.code(), "SANDBOX_UNAVAILABLE");
    }
}
