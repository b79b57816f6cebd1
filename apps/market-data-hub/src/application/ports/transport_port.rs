//! Pub/Sub Transport Ports (Driven Ports)
//!
//! Publishing and subscribing are separate connections: most brokers
//! forbid publishing on a connection that is in subscriber mode.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Channel the message arrived on.
    pub channel: String,
    /// Raw payload.
    pub payload: String,
}

/// Receiver for messages arriving on a subscriber connection.
pub type MessageReceiver = mpsc::UnboundedReceiver<TransportMessage>;

/// Transport error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection error.
    #[error("Transport connection error: {message}")]
    ConnectionError {
        /// Error details.
        message: String,
    },

    /// Subscribe or unsubscribe was not acknowledged.
    #[error("Subscription change failed on {channel}: {message}")]
    SubscribeFailed {
        /// Channel affected.
        channel: String,
        /// Error details.
        message: String,
    },

    /// Publishing failed.
    #[error("Publish failed on {channel}: {message}")]
    PublishFailed {
        /// Channel affected.
        channel: String,
        /// Error details.
        message: String,
    },

    /// The connection has been closed.
    #[error("Transport connection closed")]
    Closed,
}

/// Publish-only transport connection.
#[async_trait]
pub trait TransportPublisher: Send + Sync {
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&self);
}

/// Subscribe-only transport connection.
///
/// Messages on one channel are delivered in publish order.
#[async_trait]
pub trait TransportSubscriber: Send + Sync {
    /// Subscribe to `channel`, returning once acknowledged.
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Unsubscribe from `channel`, returning once acknowledged.
    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Take the receiver for incoming messages. Yields `Some` once.
    fn take_messages(&self) -> Option<MessageReceiver>;

    /// Close the connection. The message receiver ends afterwards.
    async fn close(&self);
}
