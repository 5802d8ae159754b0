//! Error types for keyguard

use thiserror::Error;

/// Fixed message returned wherever internal failure detail must not leak.
pub const GENERIC_FAILURE_MESSAGE: &str = "The operation could not be completed. Please try again.";

/// Main error type for keyguard operations
#[derive(Error, Debug)]
pub enum CustodyError {
    // Input errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid format: {0}")]
    Format(String),

    // Credential errors. Carries no detail on purpose: wrong password and
    // corrupted blob must be indistinguishable.
    #[error("Authentication failed")]
    Authentication,

    // Hardware errors
    #[error("Device error: {0}")]
    Device(String),

    // Internal only, routes to the degraded signing path
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Resource error: {0}")]
    Resource(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{}", GENERIC_FAILURE_MESSAGE)]
    Obscured,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CustodyError {
    pub fn device(msg: impl Into<String>) -> Self {
        CustodyError::Device(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CustodyError::Validation(msg.into())
    }

    /// Whether this error may cross a caller-facing boundary as-is.
    pub fn is_caller_safe(&self) -> bool {
        matches!(
            self,
            CustodyError::Validation(_)
                | CustodyError::Format(_)
                | CustodyError::Authentication
                | CustodyError::Device(_)
                | CustodyError::Obscured
        )
    }
}

impl From<std::io::Error> for CustodyError {
    fn from(err: std::io::Error) -> Self {
        CustodyError::Resource(err.to_string())
    }
}

impl From<hex::FromHexError> for CustodyError {
    fn from(err: hex::FromHexError) -> Self {
        CustodyError::Format(format!("Hex decode error: {}", err))
    }
}

impl From<base64::DecodeError> for CustodyError {
    fn from(err: base64::DecodeError) -> Self {
        CustodyError::Format(format!("Base64 decode error: {}", err))
    }
}

impl From<tokio::task::JoinError> for CustodyError {
    fn from(err: tokio::task::JoinError) -> Self {
        CustodyError::Internal(format!("Background task failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, CustodyError>;
