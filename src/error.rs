//! Validation error taxonomy
//!
//! Every rejection the pipeline can produce maps to exactly one `ErrorKind`, so a
//! caller can tell "your code was rejected" apart from "infrastructure was unavailable".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, serialisable name of a validation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    TokenInvalid,
    TokenRevoked,
    TokenUnknownWorkflow,
    IdentityConflict,
    InvalidRequest,
    ManifestMismatch,
    ServiceIdentityMismatch,
    UnauthorizedImport,
    SandboxTimeout,
    SandboxExecutionError,
    RegistrationMismatch,
    RegistryUnavailable,
    StageSkipped,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TokenInvalid => "TokenInvalid",
            ErrorKind::TokenRevoked => "TokenRevoked",
            ErrorKind::TokenUnknownWorkflow => "TokenUnknownWorkflow",
            ErrorKind::IdentityConflict => "IdentityConflict",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::ManifestMismatch => "ManifestMismatch",
            ErrorKind::ServiceIdentityMismatch => "ServiceIdentityMismatch",
            ErrorKind::UnauthorizedImport => "UnauthorizedImport",
            ErrorKind::SandboxTimeout => "SandboxTimeout",
            ErrorKind::SandboxExecutionError => "SandboxExecutionError",
            ErrorKind::RegistrationMismatch => "RegistrationMismatch",
            ErrorKind::RegistryUnavailable => "RegistryUnavailable",
            ErrorKind::StageSkipped => "StageSkipped",
        }
    }

    /// Whether the failure reflects a transient infrastructure fault rather than the artifact
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::RegistryUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejection raised by one of the validation stages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("TokenInvalid: {0}")]
    TokenInvalid(String),

    #[error("TokenRevoked: {0}")]
    TokenRevoked(String),

    #[error("TokenUnknownWorkflow: {0}")]
    TokenUnknownWorkflow(String),

    #[error("IdentityConflict: {0}")]
    IdentityConflict(String),

    #[error("InvalidRequest: {0}")]
    InvalidRequest(String),

    #[error("ManifestMismatch: {0}")]
    ManifestMismatch(String),

    #[error("ServiceIdentityMismatch: {0}")]
    ServiceIdentityMismatch(String),

    #[error("UnauthorizedImport: module '{0}' is not on the sandbox whitelist")]
    UnauthorizedImport(String),

    #[error("SandboxTimeout: execution exceeded {0} ms")]
    SandboxTimeout(u64),

    #[error("SandboxExecutionError: {0}")]
    SandboxExecutionError(String),

    #[error("RegistrationMismatch: {0}")]
    RegistrationMismatch(String),

    #[error("RegistryUnavailable: {0}")]
    RegistryUnavailable(String),

    #[error("StageSkipped: {0}")]
    StageSkipped(String),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::TokenInvalid(_) => ErrorKind::TokenInvalid,
            ValidationError::TokenRevoked(_) => ErrorKind::TokenRevoked,
            ValidationError::TokenUnknownWorkflow(_) => ErrorKind::TokenUnknownWorkflow,
            ValidationError::IdentityConflict(_) => ErrorKind::IdentityConflict,
            ValidationError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ValidationError::ManifestMismatch(_) => ErrorKind::ManifestMismatch,
            ValidationError::ServiceIdentityMismatch(_) => ErrorKind::ServiceIdentityMismatch,
            ValidationError::UnauthorizedImport(_) => ErrorKind::UnauthorizedImport,
            ValidationError::SandboxTimeout(_) => ErrorKind::SandboxTimeout,
            ValidationError::SandboxExecutionError(_) => ErrorKind::SandboxExecutionError,
            ValidationError::RegistrationMismatch(_) => ErrorKind::RegistrationMismatch,
            ValidationError::RegistryUnavailable(_) => ErrorKind::RegistryUnavailable,
            ValidationError::StageSkipped(_) => ErrorKind::StageSkipped,
        }
    }
}

/// Outcome of a gate operation that can fail either on validation or on infrastructure
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Rejected(#[from] ValidationError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GateError {
    /// The taxonomy kind when the failure is a validation rejection
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            GateError::Rejected(err) => Some(err.kind()),
            GateError::Internal(_) => None,
        }
    }
}
