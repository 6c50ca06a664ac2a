//! Statistics commit operations
//!
//! Each variant carries only what its datastore effect needs. Operations are
//! immutable once enqueued; the chain manager applies them in enqueue order.

use crate::datastore::ReadWriteTransaction;
use serde_json::{json, Value};
use types::{Capability, CapabilitySet, DeviceId, SessionToken, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    NodeUpdate,
    NodeRemoval,
    DataCommit,
}

/// Unit of work for a device's transaction chain
#[derive(Debug, Clone, PartialEq)]
pub enum StatOperation {
    /// Write or refresh the node record for a newly registered session
    NodeUpdate {
        device: DeviceId,
        session: SessionToken,
        capabilities: CapabilitySet,
    },
    /// Remove the node record and every statistics subtree below it
    NodeRemoval { device: DeviceId },
    /// Replace one capability's statistics with a completed poll result
    DataCommit {
        device: DeviceId,
        capability: Capability,
        transaction: TransactionId,
        entries: Vec<Value>,
    },
}

impl StatOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            StatOperation::NodeUpdate { .. } => OperationKind::NodeUpdate,
            StatOperation::NodeRemoval { .. } => OperationKind::NodeRemoval,
            StatOperation::DataCommit { .. } => OperationKind::DataCommit,
        }
    }

    pub fn device(&self) -> &DeviceId {
        match self {
            StatOperation::NodeUpdate { device, .. }
            | StatOperation::NodeRemoval { device }
            | StatOperation::DataCommit { device, .. } => device,
        }
    }

    /// Record this operation's reads and writes in `tx`
    pub fn apply(&self, tx: &mut ReadWriteTransaction) {
        match self {
            StatOperation::NodeUpdate {
                device,
                session,
                capabilities,
            } => {
                let kinds: Vec<&'static str> = capabilities.poll_order().map(|c| c.as_str()).collect();
                tx.merge(
                    device.node_path(),
                    json!({
                        "id": device.as_str(),
                        "session": session.to_string(),
                        "capabilities": kinds,
                        "table_count": capabilities.table_count(),
                    }),
                );
            }
            StatOperation::NodeRemoval { device } => {
                tx.delete(device.node_path());
            }
            StatOperation::DataCommit {
                device,
                capability,
                transaction,
                entries,
            } => {
                let path = capability.data_path(&device.node_path());
                let generation = tx
                    .read(&path)
                    .and_then(|previous| previous.get("generation").and_then(Value::as_u64))
                    .unwrap_or(0);
                tx.put(
                    path,
                    json!({
                        "transaction": transaction.0,
                        "generation": generation + 1,
                        "entries": entries,
                    }),
                );
            }
        }
    }
}
