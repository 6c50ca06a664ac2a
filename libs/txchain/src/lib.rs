//! Transaction Chain Infrastructure
//!
//! Serializes datastore mutations for each connected device into a single
//! ordered commit stream and guarantees that at most one chain manager is
//! `WORKING` per device.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐      ┌───────────────────────────┐
//! │  ChainManagerRegistry    │      │  TransactionChainManager  │
//! │                          │      │  (one per DeviceId)       │
//! │  identity lock ─┐        │      │                           │
//! │  managers map ──┼────────┼─────▶│  pending: [op1, op2, ..]  │
//! │                 │        │      │  submit ─────────────┐    │
//! └─────────────────┼────────┘      └──────────────────────┼────┘
//!                   │ removal via Registration             ▼
//!                   └──────────────────────────── TransactionChain
//!                                                  (DataBroker collaborator)
//! ```
//!
//! # Lock Ordering
//!
//! 1. registry identity lock
//! 2. registry `managers` map
//! 3. manager `state`
//!
//! A manager never calls back into the registry while holding its own state
//! lock; the removal callback runs after the lock is released.

pub mod connection;
pub mod datastore;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod operation;
pub mod registration;
pub mod registry;

pub use connection::{ConnectionContext, ReadyForNewChainHandler};
pub use datastore::{DataBroker, DataReader, Mutation, ReadWriteTransaction, TransactionChain};
pub use manager::TransactionChainManager;
pub use memory::{JournalEntry, MemoryDataBroker};
pub use metrics::{ChainMetrics, ChainStats, RegistryMetrics, RegistryStats};
pub use operation::{OperationKind, StatOperation};
pub use registration::Registration;
pub use registry::{ChainManagerRegistry, ChainProvision};
