//! HTTP transport adapter for connectivity probes
//!
//! The checker drives one HTTP exchange per check and consumes it as a
//! stream of events (headers, body chunks, completion). The adapter seam is
//! the [`HttpTransport`] trait: production uses [`HyperTransport`], tests
//! substitute scripted transports. A transport stops the exchange as soon
//! as the consumer drops its event receiver.

use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::HttpBody;
use hyper::client::conn;
use hyper::header::{CONNECTION, HOST};
use hyper::{Body, Request, StatusCode, Uri};
use schema::AddrFamily;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::resolver::ResolvedAddress;

/// Description of one probe exchange
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// Absolute probe URI (plain `http`)
    pub uri: String,
    /// Interface to bind the probe socket to, if any
    pub ifname: Option<String>,
    /// Address family restriction for the connection
    pub family: AddrFamily,
    /// Pre-resolved targets; when non-empty these are used instead of the
    /// transport's own name resolution
    pub resolve: Vec<ResolvedAddress>,
}

/// Incremental observation of a probe exchange
#[derive(Debug)]
pub enum TransportEvent {
    /// One response header line
    Header { name: String, value: String },
    /// One chunk of the response body
    Body(Bytes),
    /// The exchange finished; the full response was received
    Done { status: StatusCode },
    /// The exchange failed before completing
    Failed(TransportError),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid probe URI: {0}")]
    InvalidUri(String),

    #[error("could not resolve probe host '{0}'")]
    Resolve(String),

    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("binding probe socket to '{ifname}' failed: {source}")]
    Bind {
        ifname: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),
}

impl TransportError {
    /// Whether the failure happened before the exchange could begin
    pub fn is_setup(&self) -> bool {
        matches!(self, TransportError::InvalidUri(_))
    }
}

/// Transport seam of the connectivity checker
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform the exchange, streaming observations into `events`
    ///
    /// The exchange ends with exactly one `Done` or `Failed` event, unless
    /// the receiver is dropped first, in which case the transport stops
    /// silently.
    async fn fetch(&self, request: ProbeRequest, events: mpsc::Sender<TransportEvent>);
}

/// Production transport over a direct hyper HTTP/1.1 connection
///
/// Connection management is deliberately minimal: one fresh TCP connection
/// per probe, `Connection: close`, no pooling and no redirect following. A
/// captive portal's redirect is itself the signal being measured.
#[derive(Debug, Default)]
pub struct HyperTransport;

impl HyperTransport {
    pub fn new() -> Self {
        Self
    }

    async fn fetch_inner(
        &self,
        request: &ProbeRequest,
        events: &mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let uri: Uri = request
            .uri
            .parse()
            .map_err(|_| TransportError::InvalidUri(request.uri.clone()))?;
        let host = uri
            .host()
            .ok_or_else(|| TransportError::InvalidUri(request.uri.clone()))?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);

        let addrs = target_addrs(&host, port, request).await?;

        let mut stream = None;
        let mut last_err = None;
        for addr in addrs {
            trace!("connecting to {} for probe of '{}'", addr, request.uri);
            match connect_bound(addr, request.ifname.as_deref()).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(err) => {
                    debug!("probe connect to {} failed: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }
        let stream = match stream {
            Some(stream) => stream,
            None => return Err(last_err.unwrap_or(TransportError::Resolve(host))),
        };

        let (mut sender, connection) = conn::handshake(stream).await?;
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("probe connection error: {}", err);
            }
        });

        // origin-form request target; explicit HOST per HTTP/1.1
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let host_header = if port == 80 {
            host.clone()
        } else {
            format!("{}:{}", host, port)
        };
        let req = Request::get(path)
            .header(HOST, host_header)
            .header(CONNECTION, "close")
            .body(Body::empty())
            .map_err(|_| TransportError::InvalidUri(request.uri.clone()))?;

        let response = sender.send_request(req).await?;
        let status = response.status();

        for (name, value) in response.headers() {
            let event = TransportEvent::Header {
                name: name.as_str().to_string(),
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            };
            if events.send(event).await.is_err() {
                driver.abort();
                return Ok(());
            }
        }

        let mut body = response.into_body();
        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            if events.send(TransportEvent::Body(chunk)).await.is_err() {
                driver.abort();
                return Ok(());
            }
        }

        let _ = events.send(TransportEvent::Done { status }).await;
        driver.abort();
        Ok(())
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn fetch(&self, request: ProbeRequest, events: mpsc::Sender<TransportEvent>) {
        if let Err(err) = self.fetch_inner(&request, &events).await {
            let _ = events.send(TransportEvent::Failed(err)).await;
        }
    }
}

/// Candidate socket addresses for the probe, seeded entries first
///
/// Pre-resolved addresses matching the probe host bypass native lookup
/// entirely. Otherwise the host is resolved normally and filtered to the
/// requested address family.
async fn target_addrs(
    host: &str,
    port: u16,
    request: &ProbeRequest,
) -> Result<Vec<SocketAddr>, TransportError> {
    let seeded: Vec<SocketAddr> = request
        .resolve
        .iter()
        .filter(|entry| entry.host == host && entry.port == port)
        .filter(|entry| request.family.matches(entry.addr))
        .map(|entry| SocketAddr::new(entry.addr, entry.port))
        .collect();
    if !seeded.is_empty() {
        return Ok(seeded);
    }

    if let Ok(addr) = host.parse::<IpAddr>() {
        if request.family.matches(addr) {
            return Ok(vec![SocketAddr::new(addr, port)]);
        }
        return Err(TransportError::Resolve(host.to_string()));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| TransportError::Resolve(host.to_string()))?
        .filter(|addr| request.family.matches(addr.ip()))
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Resolve(host.to_string()));
    }
    Ok(addrs)
}

/// Open a TCP connection to `addr`, bound to `ifname` when given
async fn connect_bound(
    addr: SocketAddr,
    ifname: Option<&str>,
) -> Result<tokio::net::TcpStream, TransportError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(TransportError::Connect)?;

    if let Some(ifname) = ifname {
        bind_to_interface(&socket, ifname).map_err(|source| TransportError::Bind {
            ifname: ifname.to_string(),
            source,
        })?;
    }

    socket.connect(addr).await.map_err(TransportError::Connect)
}

#[cfg(target_os = "linux")]
fn bind_to_interface(socket: &TcpSocket, ifname: &str) -> std::io::Result<()> {
    use nix::sys::socket::setsockopt;
    use nix::sys::socket::sockopt::BindToDevice;
    use std::ffi::OsString;
    use std::os::fd::{AsRawFd, BorrowedFd};

    // SAFETY: the fd is owned by `socket`, which outlives this call
    let fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
    setsockopt(&fd, BindToDevice, &OsString::from(ifname))
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(not(target_os = "linux"))]
fn bind_to_interface(_socket: &TcpSocket, ifname: &str) -> std::io::Result<()> {
    tracing::warn!(
        "interface binding to '{}' not supported on this platform; probing over default routes",
        ifname
    );
    Ok(())
}
