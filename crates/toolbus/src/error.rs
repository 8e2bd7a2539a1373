//! Error types for the tool bus.

use std::fmt;

use thiserror::Error;

/// Result type alias for tool bus registration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure raised by an endpoint handler.
///
/// A guard rejection is a deliberate refusal (bad input, policy) and maps to
/// `GUARD_REJECTED`; anything else maps to `ERROR`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Guard(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn guard(reason: impl Into<String>) -> Self {
        Self::Guard(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    #[must_use]
    pub const fn is_guard(&self) -> bool {
        matches!(self, Self::Guard(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Guard(format!("invalid JSON payload: {err}"))
    }
}

/// Tool bus registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An endpoint with this name is already registered.
    DuplicateEndpoint { name: String },
    /// The endpoint declares no invoke, stream or subscribe handler.
    EmptyEndpoint { name: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateEndpoint { name } => {
                write!(f, "tool endpoint '{name}' is already registered")
            }
            Self::EmptyEndpoint { name } => {
                write!(f, "tool endpoint '{name}' has no handlers")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn duplicate_endpoint(name: impl Into<String>) -> Self {
        Self::DuplicateEndpoint { name: name.into() }
    }

    pub fn empty_endpoint(name: impl Into<String>) -> Self {
        Self::EmptyEndpoint { name: name.into() }
    }
}
