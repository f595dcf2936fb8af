//! Response classification and execution of a single connectivity check
//!
//! A check is one HTTP exchange against the configured probe URI, judged
//! incrementally as the response streams in. The classifier can settle
//! early on a marker header or on enough body bytes; the remainder of the
//! exchange is then abandoned. A watchdog bounds the whole exchange.

use bytes::Bytes;
use hyper::StatusCode;
use schema::{AddrFamily, ReachabilityState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::ConnectivityConfig;
use crate::error::CheckError;
use crate::registry::IfSpec;
use crate::resolver::{ResolveStrategy, ResolvedAddress};
use crate::transport::{HttpTransport, ProbeRequest, TransportEvent, TransportError};

/// Watchdog bound on one complete check
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(20);

/// Marker header a cooperating probe endpoint sets to assert full
/// connectivity regardless of the body
pub const STATUS_HEADER: &str = "X-Altair-Status";

const STATUS_ONLINE: &str = "online";

/// Terminal outcome of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub state: ReachabilityState,
    pub error: Option<CheckError>,
    /// Human-readable rationale, for logging
    pub reason: String,
}

impl Verdict {
    pub fn full(reason: impl Into<String>) -> Self {
        Self {
            state: ReachabilityState::Full,
            error: None,
            reason: reason.into(),
        }
    }

    pub fn portal(reason: impl Into<String>) -> Self {
        Self {
            state: ReachabilityState::Portal,
            error: None,
            reason: reason.into(),
        }
    }

    pub fn limited(reason: impl Into<String>) -> Self {
        Self {
            state: ReachabilityState::Limited,
            error: None,
            reason: reason.into(),
        }
    }

    pub fn error(error: CheckError) -> Self {
        Self {
            state: ReachabilityState::Error,
            reason: error.to_string(),
            error: Some(error),
        }
    }

    pub fn fake() -> Self {
        Self {
            state: ReachabilityState::Fake,
            error: None,
            reason: "fake result".to_string(),
        }
    }
}

/// Incremental judge of one probe response
///
/// Fed headers and body chunks in arrival order; returns a verdict as soon
/// as one can be justified so the caller can abandon the rest of the
/// exchange.
pub(crate) struct ResponseClassifier {
    expected: String,
    received: Vec<u8>,
}

impl ResponseClassifier {
    pub fn new(expected: &str) -> Self {
        Self {
            expected: expected.to_string(),
            received: Vec::new(),
        }
    }

    /// Judge one response header; settles on the connectivity marker
    pub fn on_header(&self, name: &str, value: &str) -> Option<Verdict> {
        if name.eq_ignore_ascii_case(STATUS_HEADER)
            && value.trim().eq_ignore_ascii_case(STATUS_ONLINE)
        {
            return Some(Verdict::full("status header found"));
        }
        None
    }

    /// Accumulate a body chunk; settles once enough bytes have arrived to
    /// compare against the expected response
    pub fn on_body(&mut self, chunk: &Bytes) -> Option<Verdict> {
        if self.expected.is_empty() {
            // content where none was expected is a portal's page
            if !chunk.is_empty() {
                return Some(Verdict::portal("unexpected response content"));
            }
            return None;
        }

        self.received.extend_from_slice(chunk);
        if self.received.len() < self.expected.len() {
            return None;
        }

        if self.received[..self.expected.len()] == *self.expected.as_bytes() {
            Some(Verdict::full("expected response"))
        } else {
            Some(Verdict::portal("unexpected response"))
        }
    }

    /// Judge the completed exchange when no earlier event settled it
    pub fn on_done(&self, status: StatusCode) -> Verdict {
        if self.expected.is_empty() && self.received.is_empty() {
            if status == StatusCode::NO_CONTENT {
                return Verdict::full("no content, as expected");
            }
            return Verdict::portal(format!(
                "unexpected status {} with no content expected",
                status.as_u16()
            ));
        }
        Verdict::portal("unexpected short response")
    }
}

/// Map a transport failure to a verdict
fn failure_verdict(error: TransportError) -> Verdict {
    if error.is_setup() {
        Verdict::error(CheckError::TransportSetup(error.to_string()))
    } else {
        Verdict::limited(format!("check failed: {}", error))
    }
}

/// Abort a spawned task when the guard goes out of scope
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Execute one check against `config` and classify the outcome
///
/// Resolution and the exchange both run under the [`CHECK_TIMEOUT`]
/// watchdog, so a stalled resolution strategy cannot hang the check;
/// expiry yields `Limited`. Never panics and never returns early without
/// a verdict.
pub(crate) async fn run_check(
    config: Arc<ConnectivityConfig>,
    transport: Arc<dyn HttpTransport>,
    resolver: Arc<dyn ResolveStrategy>,
    family: AddrFamily,
    ifspec: Option<IfSpec>,
) -> Verdict {
    let uri = match config.uri.as_deref() {
        Some(uri) => uri.to_string(),
        None => {
            return Verdict::error(CheckError::TransportSetup(
                "no connectivity URI configured".to_string(),
            ))
        }
    };

    let expected = config.expected_response().to_string();
    let check = async {
        let resolve = seed_addresses(&config, resolver.as_ref(), family, ifspec.as_ref()).await;
        let request = ProbeRequest {
            uri,
            ifname: ifspec.map(|spec| spec.ifname),
            family,
            resolve,
        };
        classify_exchange(transport, request, &expected).await
    };

    match tokio::time::timeout(CHECK_TIMEOUT, check).await {
        Ok(verdict) => verdict,
        Err(_) => Verdict::limited("timeout"),
    }
}

/// Pre-resolve the probe host through the resolution strategy
///
/// An unavailable strategy yields an empty list and the transport resolves
/// natively instead.
async fn seed_addresses(
    config: &ConnectivityConfig,
    resolver: &dyn ResolveStrategy,
    family: AddrFamily,
    ifspec: Option<&IfSpec>,
) -> Vec<ResolvedAddress> {
    let host = match config.host.as_deref() {
        Some(host) => host,
        None => return Vec::new(),
    };
    let ifindex = ifspec.map(|spec| spec.ifindex).unwrap_or(0);

    let addrs = match resolver.resolve(host, family, ifindex).await {
        Some(addrs) => addrs,
        None => {
            debug!("name resolution unavailable, using transport's own lookup");
            return Vec::new();
        }
    };

    let port = config.port_or_default();
    addrs
        .into_iter()
        .filter(|addr| family.matches(*addr))
        .map(|addr| {
            let entry = ResolvedAddress {
                host: host.to_string(),
                port,
                addr,
            };
            trace!("adding '{}' to transport resolve list", entry);
            entry
        })
        .collect()
}

/// Run the exchange and fold its event stream into a verdict
async fn classify_exchange(
    transport: Arc<dyn HttpTransport>,
    request: ProbeRequest,
    expected: &str,
) -> Verdict {
    let (tx, mut rx) = mpsc::channel(16);
    let fetch = AbortOnDrop(tokio::spawn(async move {
        transport.fetch(request, tx).await;
    }));

    let mut classifier = ResponseClassifier::new(expected);
    while let Some(event) = rx.recv().await {
        let verdict = match event {
            TransportEvent::Header { name, value } => classifier.on_header(&name, &value),
            TransportEvent::Body(chunk) => classifier.on_body(&chunk),
            TransportEvent::Done { status } => Some(classifier.on_done(status)),
            TransportEvent::Failed(error) => Some(failure_verdict(error)),
        };
        if let Some(verdict) = verdict {
            drop(fetch);
            return verdict;
        }
    }

    // transport task ended without a terminal event
    Verdict::limited("check failed: transport ended unexpectedly")
}
