//! Market Data Distributor
//!
//! `MarketDataService` owns the transport's publisher and subscriber
//! connections and the callback registry. It bridges transport messages to
//! registered callbacks and owns the publish path.
//!
//! # Channel Lifecycle
//!
//! ```text
//!                first subscribe                 last unsubscribe
//! Unsubscribed ──────────────────► Subscribed ──────────────────► Unsubscribed
//!                (transport SUB)                 (transport UNSUB)
//! ```
//!
//! Transitions are serialized by a lifecycle lock and run on a detached
//! task, so a caller that gives up mid-way cannot leave the registry and
//! the transport disagreeing. The transport call happens first; if it fails
//! the registry is left untouched.
//!
//! # Delivery
//!
//! A single dispatch task drains the subscriber connection. For each message
//! it snapshots the callbacks registered for the channel and invokes them one
//! after another. A panicking callback is caught and logged; the remaining
//! callbacks still run. Messages on one channel are therefore seen by every
//! callback in publish order.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DatabaseService;
use crate::application::ports::{
    DataAccessError, MessageReceiver, TransportError, TransportMessage, TransportPublisher,
    TransportSubscriber,
};
use crate::domain::market_data::{NewTick, SecurityId, Tick};
use crate::domain::subscription::{
    CallbackHandle, ChannelChange, SubscriptionRegistry, SubscriptionStats, WeakCallbackHandle,
};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Distributor error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketDataError {
    /// The data access layer failed; nothing was broadcast.
    #[error(transparent)]
    DataAccess(#[from] DataAccessError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A tick could not be serialized for the transport.
    #[error("Tick serialization error: {message}")]
    Serialization {
        /// Error details.
        message: String,
    },

    /// A subscription transition task did not complete.
    #[error("Subscription task failed: {message}")]
    TaskFailed {
        /// Error details.
        message: String,
    },

    /// The service has been shut down.
    #[error("Market data service is shut down")]
    ShutDown,
}

// =============================================================================
// Configuration
// =============================================================================

/// Distributor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributorConfig {
    /// Ticks a [`TickStream`] holds for a consumer that is not polling.
    /// Further ticks are dropped until it catches up.
    pub stream_capacity: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 1_000,
        }
    }
}

// =============================================================================
// Service
// =============================================================================

struct Inner {
    config: DistributorConfig,
    database: Arc<DatabaseService>,
    publisher: Arc<dyn TransportPublisher>,
    subscriber: Arc<dyn TransportSubscriber>,
    registry: SubscriptionRegistry,
    lifecycle: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Inner {
    async fn register(
        &self,
        security: &SecurityId,
        callback: CallbackHandle,
    ) -> Result<ChannelChange, MarketDataError> {
        let _guard = self.lifecycle.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(MarketDataError::ShutDown);
        }

        if self.registry.preview_add(security, &callback) == ChannelChange::Opened {
            self.subscriber.subscribe(&security.channel()).await?;
            debug!(security_id = %security, "Channel subscribed");
        }

        let change = self.registry.add(security, callback);
        metrics::set_active_channels(self.registry.stats().channel_count);
        Ok(change)
    }

    async fn unregister(
        &self,
        security: &SecurityId,
        callback: &CallbackHandle,
    ) -> Result<ChannelChange, MarketDataError> {
        let _guard = self.lifecycle.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Ok(ChannelChange::Noop);
        }

        if self.registry.preview_remove(security, callback) == ChannelChange::Closed {
            self.subscriber.unsubscribe(&security.channel()).await?;
            debug!(security_id = %security, "Channel unsubscribed");
        }

        let change = self.registry.remove(security, callback);
        metrics::set_active_channels(self.registry.stats().channel_count);
        Ok(change)
    }

    fn dispatch(&self, message: &TransportMessage) {
        let Some(security) = SecurityId::from_channel(&message.channel) else {
            warn!(channel = %message.channel, "Message on unknown channel");
            metrics::record_malformed_payload("unknown_channel");
            return;
        };

        let tick = match Tick::from_json(&message.payload) {
            Ok(tick) => tick,
            Err(e) => {
                warn!(security_id = %security, error = %e, "Dropping malformed tick payload");
                metrics::record_malformed_payload("invalid_json");
                return;
            }
        };

        if tick.security_id != security {
            warn!(
                channel = %message.channel,
                security_id = %tick.security_id,
                "Tick does not belong to its channel"
            );
            metrics::record_malformed_payload("channel_mismatch");
            return;
        }

        let mut delivered = 0;
        for registration in self.registry.registrations(&security) {
            if registration.deliver_live(&tick, |callback, tick| {
                invoke(callback, tick);
            }) {
                delivered += 1;
            }
        }
        metrics::record_ticks_delivered(delivered);
    }
}

/// Run one callback, containing any panic it raises.
fn invoke(callback: &CallbackHandle, tick: &Tick) -> bool {
    match catch_unwind(AssertUnwindSafe(|| callback.call(tick))) {
        Ok(()) => true,
        Err(panic) => {
            error!(
                security_id = %tick.security_id,
                callback = ?callback,
                panic = %panic_message(panic.as_ref()),
                "Tick callback panicked"
            );
            metrics::record_callback_failure();
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

async fn dispatch_loop(inner: Arc<Inner>, mut messages: MessageReceiver, cancel: CancellationToken) {
    debug!("Dispatch loop started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => inner.dispatch(&message),
                None => {
                    if !inner.closed.load(Ordering::Acquire) {
                        warn!("Subscriber connection ended unexpectedly");
                    }
                    break;
                }
            },
        }
    }
    debug!("Dispatch loop stopped");
}

/// Publish/subscribe distributor for security ticks.
///
/// Each instance owns its registry and transport connections; instances do
/// not share state.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example(service: market_data_hub::MarketDataService) -> Result<(), market_data_hub::MarketDataError> {
/// use market_data_hub::{CallbackHandle, NewTick, SecurityId};
/// use rust_decimal::Decimal;
///
/// let crdb = SecurityId::new("CRDB");
/// let printer = CallbackHandle::from_fn(|tick| println!("{} @ {}", tick.security_id, tick.price));
///
/// service.subscribe(&crdb, &printer).await?;
/// service.publish_update(NewTick::new("CRDB", Decimal::from(405), Some(1500))).await?;
/// service.unsubscribe(&crdb, &printer).await?;
/// # Ok(())
/// # }
/// ```
pub struct MarketDataService {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataService")
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .field("subscriptions", &self.inner.registry.stats())
            .finish_non_exhaustive()
    }
}

impl MarketDataService {
    /// Start the distributor over a data access layer and two dedicated
    /// transport connections.
    ///
    /// Spawns the dispatch task, so this must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `Transport(Closed)` if the subscriber's message receiver was already
    /// taken.
    pub fn start(
        database: Arc<DatabaseService>,
        publisher: Arc<dyn TransportPublisher>,
        subscriber: Arc<dyn TransportSubscriber>,
    ) -> Result<Self, MarketDataError> {
        Self::start_with_config(database, publisher, subscriber, DistributorConfig::default())
    }

    /// [`start`](Self::start) with explicit tuning.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub fn start_with_config(
        database: Arc<DatabaseService>,
        publisher: Arc<dyn TransportPublisher>,
        subscriber: Arc<dyn TransportSubscriber>,
        config: DistributorConfig,
    ) -> Result<Self, MarketDataError> {
        let messages = subscriber
            .take_messages()
            .ok_or(MarketDataError::Transport(TransportError::Closed))?;

        let inner = Arc::new(Inner {
            config,
            database,
            publisher,
            subscriber,
            registry: SubscriptionRegistry::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::clone(&inner),
            messages,
            cancel.clone(),
        ));

        info!(
            stream_capacity = config.stream_capacity,
            "Market data service started"
        );

        Ok(Self {
            inner,
            cancel,
            dispatcher: parking_lot::Mutex::new(Some(dispatcher)),
        })
    }

    fn ensure_open(&self) -> Result<(), MarketDataError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MarketDataError::ShutDown);
        }
        Ok(())
    }

    /// The data access layer this service writes through.
    #[must_use]
    pub fn database(&self) -> &Arc<DatabaseService> {
        &self.inner.database
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register `callback` for `security`.
    ///
    /// The first registration for a security subscribes its channel. Right
    /// after registering, the currently cached tick (if any) is delivered to
    /// `callback` before this returns, unless a live tick reached it first.
    /// Registering the same callback twice does nothing.
    ///
    /// # Errors
    ///
    /// `Transport` if the channel subscription fails; the callback is then
    /// not registered.
    pub async fn subscribe(
        &self,
        security: &SecurityId,
        callback: &CallbackHandle,
    ) -> Result<(), MarketDataError> {
        self.ensure_open()?;

        let inner = Arc::clone(&self.inner);
        let task_security = security.clone();
        let task_callback = callback.clone();
        let change = tokio::spawn(async move {
            inner.register(&task_security, task_callback).await
        })
        .await
        .map_err(|e| MarketDataError::TaskFailed {
            message: e.to_string(),
        })??;

        if change == ChannelChange::Noop {
            return Ok(());
        }

        match self.inner.database.get_cached_tick(security).await {
            Ok(Some(tick)) => {
                // A live tick that got there first is newer than the cache read.
                let backfilled = self
                    .inner
                    .registry
                    .registration(security, callback)
                    .is_some_and(|registration| {
                        registration.deliver_backfill(&tick, |callback, tick| {
                            invoke(callback, tick);
                        })
                    });
                if !backfilled {
                    debug!(security_id = %security, "Backfill superseded by live tick");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(security_id = %security, error = %e, "Skipping backfill, cache unavailable");
            }
        }

        Ok(())
    }

    /// Remove `callback` from `security`.
    ///
    /// Removing the last callback unsubscribes the channel. Removing a
    /// callback that is not registered does nothing.
    ///
    /// # Errors
    ///
    /// `Transport` if the channel unsubscription fails; the callback then
    /// stays registered.
    pub async fn unsubscribe(
        &self,
        security: &SecurityId,
        callback: &CallbackHandle,
    ) -> Result<(), MarketDataError> {
        let inner = Arc::clone(&self.inner);
        let task_security = security.clone();
        let task_callback = callback.clone();
        tokio::spawn(async move { inner.unregister(&task_security, &task_callback).await })
            .await
            .map_err(|e| MarketDataError::TaskFailed {
                message: e.to_string(),
            })??;
        Ok(())
    }

    /// Subscribe to `security` as an async stream of ticks.
    ///
    /// The stream starts with the cached tick, if any. It buffers up to
    /// [`DistributorConfig::stream_capacity`] ticks; while full, new ticks
    /// are dropped and counted. Dropping the stream (or calling
    /// [`TickStream::close`]) unsubscribes.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe).
    pub async fn stream(&self, security: &SecurityId) -> Result<TickStream, MarketDataError> {
        let (tx, rx) = mpsc::channel(self.inner.config.stream_capacity.max(1));
        let callback = CallbackHandle::from_fn(move |tick| match tx.try_send(tick.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(security_id = %tick.security_id, "Stream full, dropping tick");
                metrics::record_stream_overflow();
            }
            // Receiver gone means the stream is being torn down.
            Err(TrySendError::Closed(_)) => {}
        });

        self.subscribe(security, &callback).await?;

        Ok(TickStream {
            security: security.clone(),
            callback: Some(callback.downgrade()),
            inner: Arc::clone(&self.inner),
            ticks: ReceiverStream::new(rx),
        })
    }

    /// Whether the channel for `security` has subscribers.
    #[must_use]
    pub fn is_subscribed(&self, security: &SecurityId) -> bool {
        self.inner.registry.is_active(security)
    }

    /// Securities with at least one registered callback.
    #[must_use]
    pub fn active_securities(&self) -> Vec<SecurityId> {
        self.inner.registry.active_securities()
    }

    /// Registry statistics.
    #[must_use]
    pub fn subscription_stats(&self) -> SubscriptionStats {
        self.inner.registry.stats()
    }

    // =========================================================================
    // Publishing and History
    // =========================================================================

    /// Record a tick and broadcast it on its security's channel.
    ///
    /// The tick is written to the durable store, then the cache, then
    /// published. A store failure returns before anything is published. A
    /// publish failure leaves the tick stored and cached.
    ///
    /// # Errors
    ///
    /// `DataAccess` if recording failed, `Transport` if publishing failed.
    pub async fn publish_update(&self, new: NewTick) -> Result<Tick, MarketDataError> {
        self.ensure_open()?;
        let started = Instant::now();

        let tick = self
            .inner
            .database
            .update_market_data(new)
            .await
            .inspect_err(|e| {
                warn!(error = %e, "Tick not recorded, skipping broadcast");
                metrics::record_store_error(e.kind());
            })?;

        let payload = tick.to_json().map_err(|e| MarketDataError::Serialization {
            message: e.to_string(),
        })?;

        self.inner
            .publisher
            .publish(&tick.security_id.channel(), &payload)
            .await
            .inspect_err(|e| {
                error!(
                    security_id = %tick.security_id,
                    error = %e,
                    "Tick recorded but not broadcast"
                );
                metrics::record_publish_failure();
            })?;

        metrics::record_tick_published();
        metrics::record_publish_duration(started.elapsed());
        debug!(security_id = %tick.security_id, price = %tick.price, "Tick published");
        Ok(tick)
    }

    /// Recorded ticks for `security` in `[start, end]`, ascending.
    ///
    /// # Errors
    ///
    /// Propagates data access errors.
    pub async fn get_historical_data(
        &self,
        security: &SecurityId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Tick>, MarketDataError> {
        Ok(self
            .inner
            .database
            .get_tick_history(security, start, end)
            .await?)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether the dispatch task is still draining the subscriber
    /// connection.
    #[must_use]
    pub fn is_dispatching(&self) -> bool {
        self.dispatcher
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop dispatching and close both transport connections.
    ///
    /// All registrations are dropped, which ends any open [`TickStream`].
    /// Later calls do nothing.
    pub async fn shutdown(&self) {
        {
            let _guard = self.inner.lifecycle.lock().await;
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            let cleared = self.inner.registry.clear();
            metrics::set_active_channels(0);
            debug!(channels = cleared.len(), "Registry cleared");
        }

        self.cancel.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Dispatch task ended abnormally");
        }

        self.inner.subscriber.close().await;
        self.inner.publisher.close().await;
        info!("Market data service shut down");
    }
}

impl Drop for MarketDataService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Tick Stream
// =============================================================================

/// Live ticks for one security.
///
/// Ends when the service shuts down. Dropping it unsubscribes on a
/// background task; use [`close`](Self::close) to unsubscribe and wait.
pub struct TickStream {
    security: SecurityId,
    // Weak so that clearing the registry drops the sender and ends `ticks`.
    callback: Option<WeakCallbackHandle>,
    inner: Arc<Inner>,
    ticks: ReceiverStream<Tick>,
}

impl std::fmt::Debug for TickStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickStream")
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

impl TickStream {
    /// Security this stream follows.
    #[must_use]
    pub const fn security(&self) -> &SecurityId {
        &self.security
    }

    /// Ticks waiting to be received.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.ticks.as_ref().len()
    }

    /// Next tick, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Tick> {
        self.ticks.next().await
    }

    /// Unsubscribe and wait for the transition to complete.
    ///
    /// # Errors
    ///
    /// `Transport` if the channel unsubscription fails.
    pub async fn close(mut self) -> Result<(), MarketDataError> {
        let Some(callback) = self.callback.take().and_then(|weak| weak.upgrade()) else {
            return Ok(());
        };
        self.inner.unregister(&self.security, &callback).await?;
        Ok(())
    }
}

impl Stream for TickStream {
    type Item = Tick;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Tick>> {
        Pin::new(&mut self.ticks).poll_next(cx)
    }
}

impl Drop for TickStream {
    fn drop(&mut self) {
        let Some(callback) = self.callback.take().and_then(|weak| weak.upgrade()) else {
            return;
        };

        let inner = Arc::clone(&self.inner);
        let security = self.security.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.unregister(&security, &callback).await {
                        warn!(security_id = %security, error = %e, "Stream unsubscribe failed");
                    }
                });
            }
            Err(_) => {
                warn!(security_id = %security, "Stream dropped outside a runtime; subscription leaked");
            }
        }
    }
}
