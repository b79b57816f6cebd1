//! In-memory pub/sub broker for testing and local development.
//!
//! One `InMemoryBroker` plays the role of the message bus; publisher and
//! subscriber connections are handed out from it. Publishing is a
//! synchronous push into each subscribed connection's queue, so messages on
//! a channel arrive in publish order.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::application::ports::{
    MessageReceiver, TransportError, TransportMessage, TransportPublisher, TransportSubscriber,
};

#[derive(Debug)]
struct Connection {
    id: u64,
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    connections: RwLock<Vec<Connection>>,
    next_id: AtomicU64,
    published: AtomicU64,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
}

/// Shared in-memory message bus.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    /// Create a broker with no connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a publish-only connection.
    #[must_use]
    pub fn publisher(&self) -> InMemoryPublisher {
        InMemoryPublisher {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a subscribe-only connection.
    #[must_use]
    pub fn subscriber(&self) -> InMemorySubscriber {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.connections.write().push(Connection {
            id,
            channels: HashSet::new(),
            tx,
        });

        InMemorySubscriber {
            id,
            state: Arc::clone(&self.state),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Whether any connection is subscribed to `channel`.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.state
            .connections
            .read()
            .iter()
            .any(|c| c.channels.contains(channel))
    }

    /// All channels with at least one subscriber.
    #[must_use]
    pub fn subscribed_channels(&self) -> HashSet<String> {
        self.state
            .connections
            .read()
            .iter()
            .flat_map(|c| c.channels.iter().cloned())
            .collect()
    }

    /// Messages successfully published so far.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.state.published.load(Ordering::SeqCst)
    }

    /// Make publishes fail until reset.
    pub fn fail_publishes(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make subscribe and unsubscribe fail until reset.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.state.fail_subscribe.store(fail, Ordering::SeqCst);
    }
}

/// Publish-only connection to an `InMemoryBroker`.
#[derive(Debug)]
pub struct InMemoryPublisher {
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

#[async_trait]
impl TransportPublisher for InMemoryPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed {
                channel: channel.to_string(),
                message: "broker rejected publish".to_string(),
            });
        }

        for connection in self.state.connections.read().iter() {
            if connection.channels.contains(channel) {
                // A dropped receiver just means that subscriber is gone.
                let _ = connection.tx.send(TransportMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
            }
        }

        self.state.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Subscribe-only connection to an `InMemoryBroker`.
#[derive(Debug)]
pub struct InMemorySubscriber {
    id: u64,
    state: Arc<BrokerState>,
    rx: Mutex<Option<MessageReceiver>>,
}

impl InMemorySubscriber {
    fn change(&self, channel: &str, subscribe: bool) -> Result<(), TransportError> {
        if self.state.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::SubscribeFailed {
                channel: channel.to_string(),
                message: "broker rejected subscription change".to_string(),
            });
        }

        let mut connections = self.state.connections.write();
        let connection = connections
            .iter_mut()
            .find(|c| c.id == self.id)
            .ok_or(TransportError::Closed)?;

        if subscribe {
            connection.channels.insert(channel.to_string());
        } else {
            connection.channels.remove(channel);
        }
        Ok(())
    }
}

#[async_trait]
impl TransportSubscriber for InMemorySubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.change(channel, true)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.change(channel, false)
    }

    fn take_messages(&self) -> Option<MessageReceiver> {
        self.rx.lock().take()
    }

    async fn close(&self) {
        // Dropping the sender ends the receiver's stream.
        self.state.connections.write().retain(|c| c.id != self.id);
    }
}
