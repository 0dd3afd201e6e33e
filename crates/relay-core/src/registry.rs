use async_trait::async_trait;

use crate::errors::PushError;
use crate::ids::ConnectionId;
use crate::wire::OutboundMessage;

/// Push-to-connection capability of the gateway that owns client connections.
///
/// Implementations are shared by every concurrent session.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Deliver one frame. `PushError::Gone` means the peer has disconnected.
    async fn push(
        &self,
        connection_id: &ConnectionId,
        message: &OutboundMessage,
    ) -> Result<(), PushError>;

    /// Drop the connection. Deleting an unknown connection yields `PushError::Gone`.
    async fn delete(&self, connection_id: &ConnectionId) -> Result<(), PushError>;
}
