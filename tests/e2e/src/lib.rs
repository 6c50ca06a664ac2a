//! End-to-End Test Harness
//!
//! Wires the real registry, statistics manager and lifecycle coordinator to an
//! in-memory datastore and a scripted device RPC so scenarios can drive
//! connections, responses and disconnects step by step.

pub mod fixtures;

pub use fixtures::{init_test_logging, wait_until, Harness, ScriptedRpc, TestConnection};
