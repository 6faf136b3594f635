//! Unified error types for netrun

use std::time::Duration;
use thiserror::Error;

/// Unified error type for all netrun operations
#[derive(Error, Debug)]
pub enum NetrunError {
    // Lifecycle errors - fatal, caller must fix call ordering
    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Execution bridge is not initialized or its loop thread has died")]
    BridgeNotInitialized,

    #[error("Execution bridge is shut down")]
    BridgeShutdown,

    #[error("Cannot submit work from a thread that is already inside an async runtime")]
    NestedRuntime,

    #[error("Cannot submit work from the bridge's own loop thread")]
    WrongThread,

    // Transient I/O failures - retry policy lives with the caller
    #[error("Session error: {0}")]
    Session(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Shared store error: {0}")]
    Store(String),

    // Dependency protection - fail fast, no I/O attempted
    #[error("Circuit '{name}' is open, retry in {remaining:?}")]
    CircuitOpen { name: String, remaining: Duration },

    // Credential-state signal - needs human input, not a device failure
    #[error("OTP required for department {dept} group {group} ({} devices pending)", pending_devices.len())]
    OtpRequired {
        dept: String,
        group: String,
        pending_devices: Vec<String>,
    },

    // Input errors
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl NetrunError {
    /// Whether this error is the "needs human input" signal rather than a failure
    pub fn is_otp_required(&self) -> bool {
        matches!(self, NetrunError::OtpRequired { .. })
    }
}

/// Result type alias using NetrunError
pub type Result<T> = std::result::Result<T, NetrunError>;
