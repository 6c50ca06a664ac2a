//! Default values and bounds
//!
//! Kept in one place so the loader, the validator and the binary's CLI help
//! agree on them.

/// Quota defaults and bounds
pub mod quota {
    /// Default ceiling of outstanding device RPCs across the process
    pub const RPC_REQUESTS_QUOTA: u64 = 20_000;

    /// Upper bound for any request quota (signed 32-bit max)
    pub const MAX_QUOTA: u64 = i32::MAX as u64;

    /// Default capacity of the inbound device-response channel
    pub const GLOBAL_NOTIFICATION_QUOTA: u64 = 64_000;
}

/// Statistics collector defaults
pub mod statistics {
    /// Interval between poll-cycle kickoffs (milliseconds)
    pub const MIN_REQUEST_INTERVAL_MS: u64 = 3_000;

    /// Devices handled by one collector group
    pub const MAX_NODES_FOR_COLLECTOR: usize = 16;

    /// Time after which an unanswered request is abandoned (milliseconds)
    pub const REQUEST_TIMEOUT_MS: u64 = 10_000;
}

/// Transaction chain defaults
pub mod chain {
    /// Interval of the per-device submit task (milliseconds)
    pub const SUBMIT_INTERVAL_MS: u64 = 500;
}
