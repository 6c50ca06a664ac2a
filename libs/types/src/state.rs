//! Lifecycle states shared between the chain and statistics crates

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a transaction chain manager
///
/// ```text
/// WORKING ──close / commit failure──> TEARING_DOWN ──drained──> CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainStatus {
    Working,
    TearingDown,
    Closed,
}

impl ChainStatus {
    pub fn is_working(&self) -> bool {
        matches!(self, ChainStatus::Working)
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainStatus::Working => "WORKING",
            ChainStatus::TearingDown => "TEARING_DOWN",
            ChainStatus::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Poll state of a per-device statistics collector
///
/// `Idle <-> Collecting`, with `Disconnected` absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectorState {
    Idle,
    Collecting,
    Disconnected,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectorState::Idle => "IDLE",
            CollectorState::Collecting => "COLLECTING",
            CollectorState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}
