//! Core functionality of the Altair connectivity engine
//!
//! This crate implements connectivity verification: on request it probes a
//! configured HTTP endpoint through a specific network interface and
//! classifies the outcome as full internet access, a captive portal,
//! limited connectivity, or an error. The [`engine::ConnectivityEngine`]
//! is the entry point; transport and name resolution sit behind traits so
//! tests can run without network access.

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod transport;

mod checker;

// Re-export schema types for convenience
pub use schema::*;

pub use checker::{CHECK_TIMEOUT, STATUS_HEADER};
pub use config::{ConfigHandle, ConnectivityConfig, DEFAULT_RESPONSE, MAX_INTERVAL};
pub use engine::ConnectivityEngine;
pub use error::{CheckError, CoreError, Result};
pub use registry::{CheckCallback, CheckId, IfSpec};
pub use resolver::{ResolveStrategy, ResolvedAddress, SystemdResolver};
pub use transport::{HttpTransport, HyperTransport, ProbeRequest, TransportError, TransportEvent};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
