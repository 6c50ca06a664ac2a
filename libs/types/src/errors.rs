//! Plugin Error Types
//!
//! One taxonomy for the whole plugin. Device-scoped variants never escalate
//! past the device they name; only configuration and missing-collaborator
//! errors abort initialization.

use crate::capability::Capability;
use crate::identifiers::{DeviceId, RequestId, SessionToken};
use crate::state::ChainStatus;
use thiserror::Error;

/// Failures reported by the datastore collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatastoreError {
    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("commit timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transaction chain closed")]
    ChainClosed,
}

/// Main plugin error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    /// Second connection for a device that already has a manager
    #[error("Conflicting connection for {device}: existing chain manager is {status}")]
    Conflict { device: DeviceId, status: ChainStatus },

    /// Operation offered to a chain manager that is no longer working
    #[error("Operation rejected for {device}: chain manager is {status}")]
    RejectedOperation { device: DeviceId, status: ChainStatus },

    /// Datastore commit failed and the device's chain is being torn down
    #[error("Transaction chain broken for {device}: {source}")]
    ChainBroken {
        device: DeviceId,
        #[source]
        source: DatastoreError,
    },

    /// Request quota exhausted; retried on the next cycle
    #[error("Request quota exhausted ({outstanding}/{ceiling} outstanding)")]
    QuotaExceeded { outstanding: usize, ceiling: usize },

    /// Response for a request that no longer belongs to the live session
    #[error("Stale response {request_id} for {device} (session {session:?})")]
    StaleResponse {
        device: DeviceId,
        request_id: RequestId,
        session: Option<SessionToken>,
    },

    #[error("Device {device} is not registered for statistics collection")]
    NotRegistered { device: DeviceId },

    /// Device lacks capabilities required by `switch_features_mandatory`
    #[error("Device {device} is missing mandatory features: {missing:?}")]
    FeaturesMissing { device: DeviceId, missing: Vec<Capability> },

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Device RPC error for {device}: {message}")]
    Rpc { device: DeviceId, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String, field: Option<String> },

    #[error("Missing required collaborator: {name}")]
    MissingCollaborator { name: String },
}

/// Result type alias for plugin operations
pub type Result<T> = std::result::Result<T, PluginError>;

impl PluginError {
    pub fn conflict(device: &DeviceId, status: ChainStatus) -> Self {
        Self::Conflict {
            device: device.clone(),
            status,
        }
    }

    pub fn rejected(device: &DeviceId, status: ChainStatus) -> Self {
        Self::RejectedOperation {
            device: device.clone(),
            status,
        }
    }

    pub fn chain_broken(device: &DeviceId, source: DatastoreError) -> Self {
        Self::ChainBroken {
            device: device.clone(),
            source,
        }
    }

    pub fn stale(device: &DeviceId, request_id: RequestId, session: Option<SessionToken>) -> Self {
        Self::StaleResponse {
            device: device.clone(),
            request_id,
            session,
        }
    }

    pub fn not_registered(device: &DeviceId) -> Self {
        Self::NotRegistered {
            device: device.clone(),
        }
    }

    pub fn rpc(device: &DeviceId, message: impl Into<String>) -> Self {
        Self::Rpc {
            device: device.clone(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn missing_collaborator(name: impl Into<String>) -> Self {
        Self::MissingCollaborator { name: name.into() }
    }

    /// Device the error is confined to, if any
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            PluginError::Conflict { device, .. }
            | PluginError::RejectedOperation { device, .. }
            | PluginError::ChainBroken { device, .. }
            | PluginError::StaleResponse { device, .. }
            | PluginError::NotRegistered { device }
            | PluginError::FeaturesMissing { device, .. }
            | PluginError::Rpc { device, .. } => Some(device),
            _ => None,
        }
    }

    pub fn is_device_scoped(&self) -> bool {
        self.device().is_some()
    }

    /// Errors that must abort plugin initialization
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PluginError::Configuration { .. } | PluginError::MissingCollaborator { .. }
        )
    }

    /// Soft signals that callers log and move past
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            PluginError::QuotaExceeded { .. } | PluginError::StaleResponse { .. } | PluginError::Conflict { .. }
        )
    }
}
