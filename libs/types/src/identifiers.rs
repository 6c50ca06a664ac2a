//! Device, session and request identifiers
//!
//! `DeviceId` survives reconnects; `SessionToken` does not. Late device
//! responses are matched against the session token they were issued under,
//! so a token must never be handed out twice within a process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Opaque, comparable key of a connected switch (e.g. `openflow:1`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Datastore path of this device's node record
    pub fn node_path(&self) -> String {
        format!("nodes/{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

static SESSION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Unique value assigned each time a device is accepted.
///
/// Carries a process-wide sequence number next to the UUID so that two tokens
/// for the same device can be ordered: the higher sequence is the newer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken {
    sequence: u64,
    id: Uuid,
}

impl SessionToken {
    pub fn generate() -> Self {
        Self {
            sequence: SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            id: Uuid::new_v4(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn uuid(&self) -> Uuid {
        self.id
    }

    /// True if `self` was issued after `other`
    pub fn supersedes(&self, other: &SessionToken) -> bool {
        self.sequence > other.sequence
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}-{}", self.sequence, self.id.simple())
    }
}

/// Identifier of one poll cycle (the OpenFlow transaction id of the kickoff)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid-{}", self.0)
    }
}

/// Correlation id of a single statistics request sent to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Monotonic id source shared by the components that need fresh ids
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub const fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_transaction_id(&self) -> TransactionId {
        TransactionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}
