//! Connectivity configuration state
//!
//! This module holds the process-wide, hot-reloadable connectivity
//! configuration. A reload either fully applies or is fully rejected; the
//! derived fields (`host`, `port`, `enabled`) are always consistent with the
//! latest applied URI. Checks read an immutable `Arc` snapshot when they
//! start, so a reload never alters the semantics of an in-flight check.

use crate::{CoreError, Result};
use hyper::Uri;
use schema::ConnectivitySettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Built-in expected response body, used when no explicit response is
/// configured
pub const DEFAULT_RESPONSE: &str = "Altair is online";

/// Upper bound on the polling interval (7 days)
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Validated connectivity configuration snapshot
///
/// Produced by [`ConfigHandle::apply`]; never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityConfig {
    /// Probe URL; `None` means checking is unconfigured
    pub uri: Option<String>,
    /// Host component of `uri`
    pub host: Option<String>,
    /// Explicit port component of `uri`, if any
    pub port: Option<u16>,
    /// Expected response body prefix; `None` selects [`DEFAULT_RESPONSE`],
    /// `Some("")` is the explicit no-content (204) mode
    pub response: Option<String>,
    /// Whether checks may run: URI set, interval nonzero and the
    /// administrative flag enabled
    pub enabled: bool,
    /// Polling period, clamped to [`MAX_INTERVAL`]
    pub interval: Duration,
}

impl ConnectivityConfig {
    /// The response body prefix checks should expect
    pub fn expected_response(&self) -> &str {
        self.response.as_deref().unwrap_or(DEFAULT_RESPONSE)
    }

    /// The port checks should target, defaulting to plain HTTP
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(80)
    }
}

/// Shared handle to the connectivity configuration
///
/// Readers take cheap `Arc` snapshots; writers go through [`apply`].
/// Subscribers observe one notification per applied change.
///
/// [`apply`]: ConfigHandle::apply
#[derive(Debug)]
pub struct ConfigHandle {
    tx: watch::Sender<Arc<ConnectivityConfig>>,
}

impl ConfigHandle {
    /// Create a handle holding an unconfigured (disabled) snapshot
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ConnectivityConfig::default()));
        Self { tx }
    }

    /// Current configuration snapshot
    pub fn snapshot(&self) -> Arc<ConnectivityConfig> {
        self.tx.borrow().clone()
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConnectivityConfig>> {
        self.tx.subscribe()
    }

    /// Validate `settings` and atomically replace the snapshot
    ///
    /// Returns `true` if a changed snapshot was installed. Invalid settings
    /// are logged and rejected wholesale: the previous snapshot stays in
    /// force and no notification is emitted. Re-applying identical settings
    /// is a no-op and also emits no notification.
    pub fn apply(&self, settings: &ConnectivitySettings) -> bool {
        let uri = match validate_uri(settings.uri.as_deref()) {
            Ok(uri) => uri,
            Err(err) => {
                error!("{}", err);
                return false;
            }
        };

        let (host, port) = match &uri {
            Some(uri) => host_and_port(uri),
            None => (None, None),
        };

        let interval = Duration::from_secs(settings.interval_secs.min(MAX_INTERVAL.as_secs()));
        let enabled = uri.is_some() && !interval.is_zero() && settings.enabled;

        let next = ConnectivityConfig {
            uri,
            host,
            port,
            response: settings.response.clone(),
            enabled,
            interval,
        };

        if **self.tx.borrow() == next {
            return false;
        }

        info!(
            "connectivity configuration changed: uri={}, enabled={}, interval={}s",
            next.uri.as_deref().unwrap_or("(unset)"),
            next.enabled,
            next.interval.as_secs()
        );
        self.tx.send_replace(Arc::new(next));
        true
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that `uri` is usable for connectivity probing
///
/// Only the plaintext `http` scheme is accepted: TLS cannot be validated
/// meaningfully behind a captive portal, so `https` URIs are rejected with
/// a warning. An unset or empty URI is valid and means "unconfigured".
fn validate_uri(uri: Option<&str>) -> Result<Option<String>> {
    let uri = match uri {
        None | Some("") => return Ok(None),
        Some(uri) => uri,
    };

    let parsed: Uri = uri
        .parse()
        .map_err(|_| CoreError::ConfigurationError(format!("invalid connectivity URI '{}'", uri)))?;

    match parsed.scheme_str() {
        Some("http") => {}
        Some("https") => {
            warn!(
                "use of HTTPS for connectivity checking is not reliable and is rejected (URI: {})",
                uri
            );
            return Err(CoreError::ConfigurationError(format!(
                "https scheme not allowed for connectivity check URI '{}'",
                uri
            )));
        }
        _ => {
            return Err(CoreError::ConfigurationError(format!(
                "scheme of connectivity URI '{}' is not allowed",
                uri
            )));
        }
    }

    if parsed.host().is_none() {
        return Err(CoreError::ConfigurationError(format!(
            "connectivity URI '{}' has no host",
            uri
        )));
    }

    Ok(Some(uri.to_string()))
}

/// Derive host and explicit port from a validated URI
fn host_and_port(uri: &str) -> (Option<String>, Option<u16>) {
    match uri.parse::<Uri>() {
        Ok(parsed) => (parsed.host().map(str::to_string), parsed.port_u16()),
        Err(_) => (None, None),
    }
}
