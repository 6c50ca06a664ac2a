//! # OpenFlow Statistics Plugin Service
//!
//! Ties the transaction chain registry and the statistics manager to switch
//! connection events.
//!
//! - [`LifecycleCoordinator`] runs each connection through connect,
//!   chain-ready, capability registration and active collection, and tears
//!   it down again on disconnect
//! - [`PluginProvider`] validates configuration and collaborators, builds the
//!   components and starts the connection providers
//! - [`SwitchSimulator`] is an in-process switch fabric used by the `ofplugin`
//!   binary and the end-to-end tests

pub mod lifecycle;
pub mod provider;
pub mod simulator;

pub use lifecycle::{ConnectOutcome, LifecycleCoordinator, LifecycleMetrics, LifecycleStats};
pub use provider::{ConnectionProvider, PluginProvider, PluginProviderBuilder};
pub use simulator::{SimulatedConnection, SimulatorConfig, SwitchSimulator};
