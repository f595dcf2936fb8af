//! Registry of in-flight connectivity checks
//!
//! Every started check is registered here until it reaches its terminal
//! state. Removal from the registry is the termination latch: the first of
//! the possible termination triggers (classification, timeout, cancel,
//! shutdown drain) to remove an entry owns the single callback invocation;
//! later triggers observe an empty slot and do nothing.

use schema::{AddrFamily, ReachabilityState};
use std::collections::HashMap;
use std::fmt;
use tokio::task::JoinHandle;

use crate::error::CheckError;

/// Opaque identifier of one connectivity check
///
/// Stable for the lifetime of the request; used for cancellation and for
/// correlating the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckId(u64);

impl CheckId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "check #{}", self.0)
    }
}

/// Completion callback of a check; invoked exactly once per started check
pub type CheckCallback =
    Box<dyn FnOnce(CheckId, ReachabilityState, Option<CheckError>) + Send + 'static>;

/// Interface binding of a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfSpec {
    /// Kernel interface index, used to scope name resolution
    pub ifindex: i32,
    /// Interface name the probe socket is bound to
    pub ifname: String,
}

impl IfSpec {
    /// Bind-interface string in the transport's `if!<ifname>` convention
    pub fn ifspec(&self) -> String {
        format!("if!{}", self.ifname)
    }
}

/// One registered, not-yet-terminal check
pub(crate) struct RegisteredCheck {
    pub family: AddrFamily,
    pub ifspec: Option<IfSpec>,
    pub callback: CheckCallback,
    pub task: Option<JoinHandle<()>>,
}

/// Process-wide collection of in-flight check handles
///
/// Insert and remove are O(1); `drain_all` empties the registry for the
/// shutdown path. All access is serialized by the engine's registry lock.
#[derive(Default)]
pub(crate) struct CheckRegistry {
    handles: HashMap<u64, RegisteredCheck>,
}

impl CheckRegistry {
    pub fn insert(&mut self, id: CheckId, check: RegisteredCheck) {
        self.handles.insert(id.0, check);
    }

    pub fn remove(&mut self, id: CheckId) -> Option<RegisteredCheck> {
        self.handles.remove(&id.0)
    }

    pub fn attach_task(&mut self, id: CheckId, task: JoinHandle<()>) {
        if let Some(check) = self.handles.get_mut(&id.0) {
            check.task = Some(task);
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Remove and return every live entry
    pub fn drain_all(&mut self) -> Vec<(CheckId, RegisteredCheck)> {
        self.handles
            .drain()
            .map(|(id, check)| (CheckId(id), check))
            .collect()
    }
}
