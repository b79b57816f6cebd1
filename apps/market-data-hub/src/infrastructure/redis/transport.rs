//! Redis pub/sub transport.
//!
//! The subscriber connection is owned by a single task. Subscribe and
//! unsubscribe requests reach it over a command channel and are
//! acknowledged once Redis confirms them; messages are forwarded to the
//! receiver handed out by `take_messages`.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::{MultiplexedConnection, PubSub};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::{
    MessageReceiver, TransportError, TransportMessage, TransportPublisher, TransportSubscriber,
};

// =============================================================================
// Publisher
// =============================================================================

/// Publish-only Redis connection.
pub struct RedisPublisher {
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPublisher")
            .field("open", &self.connection.lock().is_some())
            .finish()
    }
}

impl RedisPublisher {
    /// Open a dedicated connection for publishing.
    ///
    /// # Errors
    ///
    /// `ConnectionError` if the server cannot be reached.
    pub async fn connect(client: &redis::Client) -> Result<Self, TransportError> {
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::ConnectionError {
                message: e.to_string(),
            })?;
        info!("Redis publish connection established");

        Ok(Self {
            connection: Mutex::new(Some(connection)),
        })
    }
}

#[async_trait]
impl TransportPublisher for RedisPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), TransportError> {
        let mut conn = self.connection.lock().clone().ok_or(TransportError::Closed)?;
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| TransportError::PublishFailed {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;
        debug!(channel, receivers, "Published");
        Ok(())
    }

    async fn close(&self) {
        if self.connection.lock().take().is_some() {
            info!("Redis publish connection closed");
        }
    }
}

// =============================================================================
// Subscriber
// =============================================================================

type Ack = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug)]
enum Command {
    Subscribe { channel: String, ack: Ack },
    Unsubscribe { channel: String, ack: Ack },
}

enum Event {
    Command(Command),
    Stop,
    ConnectionLost,
}

/// Subscribe-only Redis connection.
pub struct RedisSubscriber {
    commands: mpsc::UnboundedSender<Command>,
    messages: Mutex<Option<MessageReceiver>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RedisSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSubscriber")
            .field("open", &!self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RedisSubscriber {
    /// Open the pub/sub connection and start the task that drives it.
    ///
    /// # Errors
    ///
    /// `ConnectionError` if the server cannot be reached.
    pub async fn connect(client: &redis::Client) -> Result<Self, TransportError> {
        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| TransportError::ConnectionError {
                message: e.to_string(),
            })?;
        info!("Redis pub/sub connection established");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(drive(pubsub, command_rx, message_tx, cancel.clone()));

        Ok(Self {
            commands: command_tx,
            messages: Mutex::new(Some(message_rx)),
            task: Mutex::new(Some(task)),
            cancel,
        })
    }

    async fn request(
        &self,
        channel: &str,
        build: fn(String, Ack) -> Command,
    ) -> Result<(), TransportError> {
        let (ack, response) = oneshot::channel();
        self.commands
            .send(build(channel.to_string(), ack))
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl TransportSubscriber for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.request(channel, |channel, ack| Command::Subscribe { channel, ack })
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.request(channel, |channel, ack| Command::Unsubscribe { channel, ack })
            .await
    }

    fn take_messages(&self) -> Option<MessageReceiver> {
        self.messages.lock().take()
    }

    async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Pub/sub task ended abnormally");
        }
    }
}

/// Own the pub/sub connection: apply commands and forward messages until
/// cancelled or the connection drops.
async fn drive(
    mut pubsub: PubSub,
    mut commands: mpsc::UnboundedReceiver<Command>,
    messages: mpsc::UnboundedSender<TransportMessage>,
    cancel: CancellationToken,
) {
    loop {
        // The message stream borrows the connection, so it is rebuilt after
        // every command.
        let event = {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break Event::Stop,
                    command = commands.recv() => match command {
                        Some(command) => break Event::Command(command),
                        None => break Event::Stop,
                    },
                    message = stream.next() => match message {
                        Some(message) => forward(&message, &messages),
                        None => break Event::ConnectionLost,
                    },
                }
            }
        };

        match event {
            Event::Command(Command::Subscribe { channel, ack }) => {
                let result = pubsub.subscribe(&channel).await.map_err(|e| {
                    TransportError::SubscribeFailed {
                        channel: channel.clone(),
                        message: e.to_string(),
                    }
                });
                let _ = ack.send(result);
            }
            Event::Command(Command::Unsubscribe { channel, ack }) => {
                let result = pubsub.unsubscribe(&channel).await.map_err(|e| {
                    TransportError::SubscribeFailed {
                        channel: channel.clone(),
                        message: e.to_string(),
                    }
                });
                let _ = ack.send(result);
            }
            Event::Stop => {
                info!("Redis pub/sub connection closed");
                break;
            }
            Event::ConnectionLost => {
                warn!("Redis pub/sub connection lost");
                break;
            }
        }
    }

    // Anyone still waiting on an acknowledgement sees `Closed`.
    commands.close();
    while let Ok(command) = commands.try_recv() {
        let (Command::Subscribe { ack, .. } | Command::Unsubscribe { ack, .. }) = command;
        let _ = ack.send(Err(TransportError::Closed));
    }
}

fn forward(message: &redis::Msg, messages: &mpsc::UnboundedSender<TransportMessage>) {
    let channel = message.get_channel_name().to_string();
    match message.get_payload::<String>() {
        Ok(payload) => {
            // Receiver gone means the distributor is shutting down.
            let _ = messages.send(TransportMessage { channel, payload });
        }
        Err(e) => {
            warn!(channel = %channel, error = %e, "Dropping non-UTF-8 payload");
        }
    }
}
