//! Name-resolution strategy for connectivity checks
//!
//! A check first tries to resolve the probe host through the system
//! resolver service (`org.freedesktop.resolve1`) over the message bus,
//! scoped to the check's interface index so link-local and split-horizon
//! answers are correct. Every failure mode (bus unreachable, service
//! absent, call error, timeout) collapses into "unavailable", and the
//! check silently falls back to the transport's own resolution. Resolver
//! trouble is never surfaced as a check failure.

use async_trait::async_trait;
use schema::AddrFamily;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::debug;

/// systemd-resolved flag selecting classic DNS resolution
const SD_RESOLVED_DNS: u64 = 1;

/// Bound on the bus resolution attempt; on expiry the check proceeds with
/// transport-native resolution
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// One pre-resolved probe target, in the `hostname:port:address` form the
/// transport's resolution cache accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub host: String,
    pub port: u16,
    pub addr: IpAddr,
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.addr)
    }
}

/// Strategy interface for resolving the probe host
///
/// `None` means the strategy is unavailable; the caller falls back to the
/// transport's native resolution rather than failing the check.
#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    async fn resolve(&self, host: &str, family: AddrFamily, ifindex: i32) -> Option<Vec<IpAddr>>;
}

#[zbus::proxy(
    interface = "org.freedesktop.resolve1.Manager",
    default_service = "org.freedesktop.resolve1",
    default_path = "/org/freedesktop/resolve1",
    gen_blocking = false
)]
trait Resolve1Manager {
    #[allow(clippy::type_complexity)]
    fn resolve_hostname(
        &self,
        ifindex: i32,
        name: &str,
        family: i32,
        flags: u64,
    ) -> zbus::Result<(Vec<(i32, i32, Vec<u8>)>, String, u64)>;
}

/// Bus-backed resolution via systemd-resolved
#[derive(Debug, Default)]
pub struct SystemdResolver;

impl SystemdResolver {
    pub fn new() -> Self {
        Self
    }

    async fn resolve_inner(
        &self,
        host: &str,
        family: AddrFamily,
        ifindex: i32,
    ) -> zbus::Result<Vec<IpAddr>> {
        let connection = zbus::Connection::system().await?;
        let proxy = Resolve1ManagerProxy::new(&connection).await?;

        debug!("resolving '{}' ({}) via systemd-resolved", host, family);
        let (records, _canonical, _flags) = proxy
            .resolve_hostname(ifindex, host, family.as_af(), SD_RESOLVED_DNS)
            .await?;

        Ok(records
            .into_iter()
            .filter_map(|(_ifindex, af, bytes)| decode_address(af, &bytes))
            .collect())
    }
}

#[async_trait]
impl ResolveStrategy for SystemdResolver {
    async fn resolve(&self, host: &str, family: AddrFamily, ifindex: i32) -> Option<Vec<IpAddr>> {
        match tokio::time::timeout(RESOLVE_TIMEOUT, self.resolve_inner(host, family, ifindex)).await
        {
            Ok(Ok(addrs)) => Some(addrs),
            Ok(Err(err)) => {
                debug!("can't resolve '{}' via systemd-resolved: {}", host, err);
                None
            }
            Err(_) => {
                debug!("systemd-resolved query for '{}' timed out", host);
                None
            }
        }
    }
}

/// Decode a raw resolver address record; records with an unexpected
/// family/length combination are skipped
fn decode_address(af: i32, bytes: &[u8]) -> Option<IpAddr> {
    match af {
        2 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        10 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
