//! Connection-side collaborators consumed by the registry

use types::DeviceId;

/// The transport session of one connected switch
pub trait ConnectionContext: Send + Sync {
    fn device_id(&self) -> &DeviceId;

    /// Close the underlying transport. `propagate` asks the transport to emit
    /// its own disconnect event; a dropped duplicate connection passes `false`.
    fn close_connection(&self, propagate: bool);
}

/// Notified when a chain manager the handler waited on has fully closed
pub trait ReadyForNewChainHandler: Send + Sync {
    fn on_ready_for_new_chain(&self);
}
