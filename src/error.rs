//! Error types for Synheart Stride

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::SessionState;

/// Errors raised by the companion link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Companion link is not reachable")]
    Unavailable,

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Malformed link payload: {0}")]
    Serialization(String),

    #[error("Link channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors raised by the biometric store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BiometricError {
    #[error("Biometric store access was not granted")]
    AuthorizationDenied,

    #[error("Biometric store unavailable: {0}")]
    Unavailable(String),

    #[error("Biometric query failed: {0}")]
    Query(String),
}

/// Errors raised by the session controller
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A session is already in progress ({0})")]
    AlreadyActive(SessionState),

    #[error("Cannot {action} while {from}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },

    #[error("Platform session error: {0}")]
    PlatformSession(String),

    #[error("Companion refused the session: {0}")]
    PeerRefused(String),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

impl From<BiometricError> for SessionError {
    fn from(e: BiometricError) -> Self {
        SessionError::PlatformSession(e.to_string())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: &'static str, value: String },
}
