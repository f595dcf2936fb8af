//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error delivered through a check's completion callback
///
/// This is the only error surface of the dispatch API: nothing is returned
/// as `Err` from `start_check` or `cancel_check` themselves. The variants
/// are distinguishable so a caller can tell "I gave up" (`Cancelled`) from
/// "the check never had a chance" (`MissingInterface`, `TransportSetup`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// The caller cancelled the check
    #[error("connectivity check cancelled")]
    Cancelled,

    /// The engine is shutting down and drained the check
    #[error("connectivity checking is shutting down")]
    ShuttingDown,

    /// The check was started without an interface to bind to
    #[error("no interface specified for connectivity check")]
    MissingInterface,

    /// The transport could not even begin the exchange
    #[error("transport setup failed: {0}")]
    TransportSetup(String),
}
