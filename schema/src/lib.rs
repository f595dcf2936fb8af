//! Schema definitions for Altair
//!
//! This crate contains shared data structures used across the Altair
//! ecosystem. All types here implement JSON Schema generation for
//! external consumption.

pub mod connectivity;

pub use connectivity::{AddrFamily, ConnectivitySettings, ReachabilityState};
