//! Error types for lightwave-smart
//!
//! This module defines the error taxonomy shared by the authentication flow,
//! token lifecycle, connection activation and reconciliation layers, using
//! `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for lightwave-smart operations
///
/// The first group of variants is the credential/connection taxonomy that the
/// interactive flow translates into step error codes or abort reasons. The
/// remaining variants cover configuration, storage and host collaborator
/// failures.
#[derive(Error, Debug)]
pub enum LightwaveError {
    /// Transport-level failure talking to the backend
    #[error("Cannot connect: {0}")]
    CannotConnect(String),

    /// Credentials rejected by the backend, including forced invalidation
    #[error("Invalid authentication: {0}")]
    InvalidAuth(String),

    /// Unsupported or malformed authentication method selection
    #[error("Invalid authentication method: {0}")]
    InvalidMethod(String),

    /// Reauthentication or reconfiguration resolved to a different identity
    #[error("Identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// Identity bound to the entry being replaced
        expected: String,
        /// Identity produced by the flow
        actual: String,
    },

    /// A second installation was requested while one already exists
    #[error("Only a single installation is allowed")]
    SingleInstanceConflict,

    /// Catch-all carrying the original message for diagnostics
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// Setup could not activate the connection; the host should reauthenticate
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Reconciliation was asked to run against a partially populated hierarchy
    #[error("Hierarchy snapshot is incomplete")]
    IncompleteHierarchy,

    /// Configuration entry does not exist
    #[error("Config entry not found: {0}")]
    EntryNotFound(String),

    /// Operation abandoned because the owning installation is shutting down
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Keyring/credential storage errors
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Result type alias for lightwave-smart operations
///
/// Uses `anyhow::Error` so callers can attach context while still being able
/// to `downcast_ref::<LightwaveError>()` when they need to classify a failure.
pub type Result<T> = anyhow::Result<T>;
