// Event Bus
//
// Typed publish/subscribe over a shared transport. Payloads are JSON on the
// wire and decoded once per delivery before the handler sees them.

pub mod client;
pub mod transport;

pub use client::BusClient;
pub use transport::{MemoryTransport, Subscription, Transport, TransportError};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("message bus not connected")]
    Unavailable,
    #[error("failed to serialize bus payload: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Consumer of one topic's decoded payloads.
///
/// Errors are logged by the listener and the message is dropped; there is no
/// caller to report to and no redelivery.
#[async_trait]
pub trait MessageHandler<P>: Send + Sync + 'static {
    async fn handle(&self, payload: P) -> anyhow::Result<()>;
}
