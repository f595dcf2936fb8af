//! Connectivity-check types shared between the engine and its consumers
//!
//! This module contains the value types exchanged across the connectivity
//! engine's public boundary: the reachability classification reported for a
//! completed check, the address-family selector a check is issued under, and
//! the raw settings payload the configuration loader hands to the engine.
//!
//! ## Reachability states
//!
//! A completed check reports exactly one of:
//! - `None`: no connectivity observed
//! - `Limited`: the probe could not complete (connect failure, timeout)
//! - `Portal`: the probe was answered, but not by the expected endpoint
//! - `Full`: the expected probe response was observed
//! - `Error`: the check could not be attempted at all
//! - `Fake`: a synthetic result produced while checking is disabled
//!
//! `Unknown` never comes out of a completed check; it exists as an initial
//! placeholder for consumers that have not yet received a result.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Outcome classification of a single connectivity check
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ReachabilityState {
    /// No result received yet
    Unknown,
    /// No connectivity at all
    None,
    /// Network is reachable but the probe did not complete
    Limited,
    /// An intermediary (captive portal) answered instead of the probe target
    Portal,
    /// The expected probe response was observed
    Full,
    /// The check could not be attempted
    Error,
    /// Synthetic result; checking is disabled by configuration
    Fake,
}

impl ReachabilityState {
    /// Whether this state represents verified internet access
    pub fn is_online(&self) -> bool {
        matches!(self, ReachabilityState::Full)
    }

    /// Whether this state came from an actual probe rather than a
    /// dispatch failure or a synthetic result
    pub fn is_probed(&self) -> bool {
        matches!(
            self,
            ReachabilityState::None
                | ReachabilityState::Limited
                | ReachabilityState::Portal
                | ReachabilityState::Full
        )
    }
}

impl fmt::Display for ReachabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReachabilityState::Unknown => "UNKNOWN",
            ReachabilityState::None => "NONE",
            ReachabilityState::Limited => "LIMITED",
            ReachabilityState::Portal => "PORTAL",
            ReachabilityState::Full => "FULL",
            ReachabilityState::Error => "ERROR",
            ReachabilityState::Fake => "FAKE",
        };
        f.write_str(s)
    }
}

/// Address family a connectivity check is restricted to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum AddrFamily {
    /// IPv4 only
    Ipv4,
    /// IPv6 only
    Ipv6,
    /// Either family
    Unspecified,
}

impl AddrFamily {
    /// Whether the given address belongs to this family
    pub fn matches(&self, addr: IpAddr) -> bool {
        match self {
            AddrFamily::Ipv4 => addr.is_ipv4(),
            AddrFamily::Ipv6 => addr.is_ipv6(),
            AddrFamily::Unspecified => true,
        }
    }

    /// Numeric address-family value as used on the system bus
    /// (`AF_INET` / `AF_INET6` / `AF_UNSPEC` on Linux)
    pub fn as_af(&self) -> i32 {
        match self {
            AddrFamily::Ipv4 => 2,
            AddrFamily::Ipv6 => 10,
            AddrFamily::Unspecified => 0,
        }
    }
}

impl Default for AddrFamily {
    fn default() -> Self {
        AddrFamily::Unspecified
    }
}

impl fmt::Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddrFamily::Ipv4 => "IPv4",
            AddrFamily::Ipv6 => "IPv6",
            AddrFamily::Unspecified => "any",
        };
        f.write_str(s)
    }
}

/// Raw connectivity settings as supplied by the configuration loader
///
/// These are the unvalidated inputs to the engine's `apply_config`
/// operation. The engine derives a validated snapshot from them; invalid
/// values are rejected wholesale and leave the previous snapshot in force.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivitySettings {
    /// Absolute probe URL; unset or empty disables checking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Expected response body prefix; unset means "use the built-in
    /// default", while an explicit empty string means "expect no content"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    /// Polling period in seconds; zero disables checking
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Administrative enable flag
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            uri: None,
            response: None,
            interval_secs: default_interval_secs(),
            enabled: default_enabled(),
        }
    }
}

const fn default_interval_secs() -> u64 {
    300
}

const fn default_enabled() -> bool {
    true
}
