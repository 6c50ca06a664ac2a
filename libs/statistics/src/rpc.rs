//! Device RPC collaborator
//!
//! Outbound statistics requests go through [`DeviceRpc`]; replies come back
//! asynchronously on the statistics manager's response channel and are
//! correlated by request id plus session token, never by arrival order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use types::{Capability, DeviceId, RequestId, Result, SessionToken, TransactionId};

/// One statistics request for one capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRequest {
    pub device: DeviceId,
    pub session: SessionToken,
    pub request_id: RequestId,
    pub transaction: TransactionId,
    pub capability: Capability,
    pub table_count: u8,
}

/// One (possibly partial) reply from a device
///
/// `more` is set on every part of a multipart reply except the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub device: DeviceId,
    pub session: SessionToken,
    pub request_id: RequestId,
    pub capability: Capability,
    pub body: Vec<Value>,
    pub more: bool,
}

impl StatsResponse {
    /// Final (or only) part answering `request`
    pub fn reply_to(request: &StatsRequest, body: Vec<Value>) -> Self {
        Self {
            device: request.device.clone(),
            session: request.session,
            request_id: request.request_id,
            capability: request.capability,
            body,
            more: false,
        }
    }

    /// Same reply, flagged as not the last part
    pub fn with_more(mut self, more: bool) -> Self {
        self.more = more;
        self
    }
}

#[async_trait]
pub trait DeviceRpc: Send + Sync {
    /// Hand the request to the device transport. Returning `Ok` only means the
    /// request was sent; the answer arrives later as a [`StatsResponse`].
    async fn send_request(&self, request: StatsRequest) -> Result<()>;
}
