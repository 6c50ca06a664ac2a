//! Statistics Collection
//!
//! Quota-gated polling of connected devices. Each device gets a
//! [`StatisticsCollector`] that runs poll cycles against the device RPC and
//! hands completed results to the device's transaction chain; the
//! [`StatisticsManager`] owns the collectors, schedules them in node groups
//! and routes device responses back to them.
//!
//! ```text
//!  StatisticsManager ── node group ticks ──▶ StatisticsCollector ──▶ DeviceRpc
//!        ▲                                        │
//!        └──── response channel ◀── device ───────┘
//!                                                 ▼
//!                                   TransactionChainManager (DataCommit)
//! ```

pub mod collector;
pub mod manager;
pub mod metrics;
pub mod quota;
pub mod rpc;

pub use collector::{CollectOutcome, CollectorResources, ExpiredRequests, ResponseOutcome, StatisticsCollector};
pub use manager::StatisticsManager;
pub use metrics::{StatisticsMetrics, StatisticsStats};
pub use quota::{QuotaGate, QuotaPermit, QuotaStats, MAX_CEILING};
pub use rpc::{DeviceRpc, StatsRequest, StatsResponse};
