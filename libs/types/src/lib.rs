//! # Plugin Types
//!
//! Identifiers, the statistics capability model, lifecycle states and the
//! shared error taxonomy used by every crate in the workspace.
//!
//! ## Identifiers
//!
//! - [`DeviceId`]: stable key for one switch, used as the map key in every registry
//! - [`SessionToken`]: fresh per accepted connection, never reused
//! - [`TransactionId`] / [`RequestId`]: poll-cycle and per-request correlation ids
//!
//! ```rust
//! use types::{Capability, CapabilitySet, DeviceId};
//!
//! let device = DeviceId::new("openflow:1");
//! let caps = CapabilitySet::new([Capability::Port, Capability::Flow], 4);
//! assert_eq!(caps.poll_order().next(), Some(Capability::Flow));
//! assert_eq!(device.as_str(), "openflow:1");
//! ```

pub mod capability;
pub mod errors;
pub mod identifiers;
pub mod state;

pub use capability::{Capability, CapabilitySet};
pub use errors::{DatastoreError, PluginError, Result};
pub use identifiers::{DeviceId, IdGenerator, RequestId, SessionToken, TransactionId};
pub use state::{ChainStatus, CollectorState};
