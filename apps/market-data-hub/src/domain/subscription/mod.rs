//! Subscription Registry
//!
//! Tracks which callbacks are registered for which securities.
//!
//! # Design
//!
//! The registry is the source of truth for transport channel lifecycle:
//! - The first callback registered for a security opens its channel
//! - The last callback removed for a security closes its channel
//! - Callbacks are a set keyed by identity, so registering the same
//!   callback twice is a no-op
//!
//! Each registration also carries a delivery cursor. Live ticks and the
//! one-off backfill of the cached tick both go through it, which keeps a
//! callback from running on two tasks at once and from seeing the backfill
//! after a newer live tick.
//!
//! Each distributor owns its own registry; nothing here is process-global.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::domain::market_data::{SecurityId, Tick};

// =============================================================================
// Callback Handles
// =============================================================================

/// A tick callback as registered by subscribers.
pub type TickCallback = Arc<dyn Fn(&Tick) + Send + Sync>;

/// A registered callback, compared by identity.
///
/// Two handles are equal when they wrap the same allocation, which is what
/// gives `(security, callback)` pairs set semantics.
#[derive(Clone)]
pub struct CallbackHandle(TickCallback);

impl CallbackHandle {
    /// Wrap a callback.
    #[must_use]
    pub fn new(callback: TickCallback) -> Self {
        Self(callback)
    }

    /// Wrap a closure.
    pub fn from_fn(f: impl Fn(&Tick) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Invoke the callback.
    pub fn call(&self, tick: &Tick) {
        (self.0)(tick);
    }

    /// Identity of the wrapped allocation, for logging.
    #[must_use]
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    /// A handle that does not keep the callback alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakCallbackHandle {
        WeakCallbackHandle(Arc::downgrade(&self.0))
    }
}

/// Non-owning counterpart of [`CallbackHandle`].
#[derive(Clone)]
pub struct WeakCallbackHandle(Weak<dyn Fn(&Tick) + Send + Sync>);

impl WeakCallbackHandle {
    /// The callback, if something still holds it.
    #[must_use]
    pub fn upgrade(&self) -> Option<CallbackHandle> {
        self.0.upgrade().map(CallbackHandle)
    }
}

impl PartialEq for CallbackHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for CallbackHandle {}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallbackHandle")
            .field(&format_args!("{:#x}", self.id()))
            .finish()
    }
}

impl From<TickCallback> for CallbackHandle {
    fn from(callback: TickCallback) -> Self {
        Self(callback)
    }
}

// =============================================================================
// Registrations
// =============================================================================

/// What a registration has been shown so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Pending,
    Backfilled(DateTime<Utc>),
    Live,
}

/// A callback registered for one security, with its delivery cursor.
#[derive(Clone)]
pub struct Registration {
    callback: CallbackHandle,
    delivery: Arc<Mutex<Delivery>>,
}

impl Registration {
    fn new(callback: CallbackHandle) -> Self {
        Self {
            callback,
            delivery: Arc::new(Mutex::new(Delivery::Pending)),
        }
    }

    /// The registered callback.
    #[must_use]
    pub const fn callback(&self) -> &CallbackHandle {
        &self.callback
    }

    /// Hand the cached tick to the callback unless anything was delivered
    /// already. Returns whether `deliver` ran.
    pub fn deliver_backfill(
        &self,
        tick: &Tick,
        deliver: impl FnOnce(&CallbackHandle, &Tick),
    ) -> bool {
        let mut delivery = self.delivery.lock();
        if *delivery != Delivery::Pending {
            return false;
        }
        *delivery = Delivery::Backfilled(tick.timestamp);
        deliver(&self.callback, tick);
        true
    }

    /// Hand a live tick to the callback. A tick no newer than the backfill
    /// it follows is skipped. Returns whether `deliver` ran.
    pub fn deliver_live(
        &self,
        tick: &Tick,
        deliver: impl FnOnce(&CallbackHandle, &Tick),
    ) -> bool {
        let mut delivery = self.delivery.lock();
        if let Delivery::Backfilled(at) = *delivery
            && tick.timestamp <= at
        {
            return false;
        }
        *delivery = Delivery::Live;
        deliver(&self.callback, tick);
        true
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("callback", &self.callback)
            // Mid-delivery shows as `None`.
            .field("delivery", &self.delivery.try_lock().map(|d| *d))
            .finish()
    }
}

// =============================================================================
// Registry Changes
// =============================================================================

/// Effect of a registry mutation on the security's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelChange {
    /// First callback registered; the channel must be subscribed.
    Opened,
    /// Last callback removed; the channel must be unsubscribed.
    Closed,
    /// Callback set changed but the channel stays as it was.
    Unchanged,
    /// Nothing changed (duplicate add or unknown remove).
    Noop,
}

// =============================================================================
// Registry
// =============================================================================

/// Registry of callbacks per security.
///
/// Callbacks for a security are kept in registration order, which is the
/// order they are invoked in.
///
/// # Example
///
/// ```rust
/// use market_data_hub::domain::subscription::{CallbackHandle, ChannelChange, SubscriptionRegistry};
///
/// let registry = SubscriptionRegistry::new();
/// let a = CallbackHandle::from_fn(|_| {});
/// let b = CallbackHandle::from_fn(|_| {});
///
/// assert_eq!(registry.add(&"CRDB".into(), a.clone()), ChannelChange::Opened);
/// assert_eq!(registry.add(&"CRDB".into(), b.clone()), ChannelChange::Unchanged);
/// assert_eq!(registry.remove(&"CRDB".into(), &a), ChannelChange::Unchanged);
/// assert_eq!(registry.remove(&"CRDB".into(), &b), ChannelChange::Closed);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: RwLock<HashMap<SecurityId, Vec<Registration>>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `security`.
    pub fn add(&self, security: &SecurityId, callback: CallbackHandle) -> ChannelChange {
        let mut channels = self.channels.write();
        let registrations = channels.entry(security.clone()).or_default();

        if registrations.iter().any(|r| r.callback == callback) {
            return ChannelChange::Noop;
        }

        registrations.push(Registration::new(callback));

        if registrations.len() == 1 {
            ChannelChange::Opened
        } else {
            ChannelChange::Unchanged
        }
    }

    /// Remove `callback` from `security`.
    pub fn remove(&self, security: &SecurityId, callback: &CallbackHandle) -> ChannelChange {
        let mut channels = self.channels.write();
        let Some(registrations) = channels.get_mut(security) else {
            return ChannelChange::Noop;
        };

        let Some(pos) = registrations.iter().position(|r| &r.callback == callback) else {
            return ChannelChange::Noop;
        };

        registrations.remove(pos);

        if registrations.is_empty() {
            channels.remove(security);
            ChannelChange::Closed
        } else {
            ChannelChange::Unchanged
        }
    }

    /// Change that `add` would report, without mutating.
    #[must_use]
    pub fn preview_add(&self, security: &SecurityId, callback: &CallbackHandle) -> ChannelChange {
        match self.channels.read().get(security) {
            None => ChannelChange::Opened,
            Some(registrations) if registrations.iter().any(|r| &r.callback == callback) => {
                ChannelChange::Noop
            }
            Some(_) => ChannelChange::Unchanged,
        }
    }

    /// Change that `remove` would report, without mutating.
    #[must_use]
    pub fn preview_remove(
        &self,
        security: &SecurityId,
        callback: &CallbackHandle,
    ) -> ChannelChange {
        match self.channels.read().get(security) {
            Some(registrations) if registrations.iter().any(|r| &r.callback == callback) => {
                if registrations.len() == 1 {
                    ChannelChange::Closed
                } else {
                    ChannelChange::Unchanged
                }
            }
            _ => ChannelChange::Noop,
        }
    }

    /// Snapshot of the registrations for `security`, in registration order.
    #[must_use]
    pub fn registrations(&self, security: &SecurityId) -> Vec<Registration> {
        self.channels
            .read()
            .get(security)
            .cloned()
            .unwrap_or_default()
    }

    /// The registration of `callback` for `security`, if any.
    #[must_use]
    pub fn registration(
        &self,
        security: &SecurityId,
        callback: &CallbackHandle,
    ) -> Option<Registration> {
        self.channels
            .read()
            .get(security)?
            .iter()
            .find(|r| &r.callback == callback)
            .cloned()
    }

    /// Snapshot of the callbacks registered for `security`.
    #[must_use]
    pub fn callbacks(&self, security: &SecurityId) -> Vec<CallbackHandle> {
        self.registrations(security)
            .into_iter()
            .map(|r| r.callback)
            .collect()
    }

    /// Whether `security` has at least one callback.
    #[must_use]
    pub fn is_active(&self, security: &SecurityId) -> bool {
        self.channels.read().contains_key(security)
    }

    /// Whether `callback` is registered for `security`.
    #[must_use]
    pub fn contains(&self, security: &SecurityId, callback: &CallbackHandle) -> bool {
        self.channels
            .read()
            .get(security)
            .is_some_and(|registrations| registrations.iter().any(|r| &r.callback == callback))
    }

    /// Securities with at least one callback.
    #[must_use]
    pub fn active_securities(&self) -> Vec<SecurityId> {
        self.channels.read().keys().cloned().collect()
    }

    /// Drop every registration, returning the securities that were active.
    pub fn clear(&self) -> Vec<SecurityId> {
        self.channels.write().drain().map(|(id, _)| id).collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let channels = self.channels.read();
        SubscriptionStats {
            channel_count: channels.len(),
            callback_count: channels.values().map(Vec::len).sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Securities with at least one callback.
    pub channel_count: usize,
    /// Registered callbacks across all securities.
    pub callback_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::market_data::NewTick;

    fn noop() -> CallbackHandle {
        CallbackHandle::from_fn(|_| {})
    }

    fn crdb() -> SecurityId {
        SecurityId::new("CRDB")
    }

    #[test]
    fn first_callback_opens_channel() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.add(&crdb(), noop()), ChannelChange::Opened);
        assert!(registry.is_active(&crdb()));
    }

    #[test]
    fn second_callback_leaves_channel_unchanged() {
        let registry = SubscriptionRegistry::new();
        registry.add(&crdb(), noop());
        assert_eq!(registry.add(&crdb(), noop()), ChannelChange::Unchanged);
        assert_eq!(registry.callbacks(&crdb()).len(), 2);
    }

    #[test]
    fn duplicate_callback_is_noop() {
        let registry = SubscriptionRegistry::new();
        let cb = noop();

        registry.add(&crdb(), cb.clone());
        assert_eq!(registry.add(&crdb(), cb), ChannelChange::Noop);
        assert_eq!(registry.callbacks(&crdb()).len(), 1);
    }

    #[test]
    fn weak_handle_follows_registry_ownership() {
        let registry = SubscriptionRegistry::new();
        let cb = noop();
        let weak = cb.downgrade();
        registry.add(&crdb(), cb);

        assert!(weak.upgrade().is_some_and(|cb| registry.contains(&crdb(), &cb)));

        registry.clear();
        assert!(weak.upgrade().is_none());
    }

    fn tick_at(price: i64, seconds: i64) -> Tick {
        NewTick::new("CRDB", Decimal::from(price), None)
            .at(DateTime::from_timestamp(1_767_600_000 + seconds, 0).unwrap())
    }

    #[test]
    fn backfill_after_live_tick_is_skipped() {
        let registry = SubscriptionRegistry::new();
        let cb = noop();
        registry.add(&crdb(), cb.clone());
        let registration = registry.registration(&crdb(), &cb).unwrap();
        let mut seen = Vec::new();

        assert!(registration.deliver_live(&tick_at(410, 10), |_, t| seen.push(t.price)));
        assert!(!registration.deliver_backfill(&tick_at(400, 0), |_, t| seen.push(t.price)));

        assert_eq!(seen, vec![Decimal::from(410)]);
    }

    #[test]
    fn live_tick_not_newer_than_backfill_is_skipped() {
        let registry = SubscriptionRegistry::new();
        let cb = noop();
        registry.add(&crdb(), cb.clone());
        let registration = registry.registration(&crdb(), &cb).unwrap();
        let mut seen = Vec::new();

        assert!(registration.deliver_backfill(&tick_at(410, 10), |_, t| seen.push(t.price)));
        assert!(!registration.deliver_live(&tick_at(410, 10), |_, t| seen.push(t.price)));
        assert!(!registration.deliver_live(&tick_at(400, 5), |_, t| seen.push(t.price)));
        assert!(registration.deliver_live(&tick_at(420, 20), |_, t| seen.push(t.price)));
        // Once live, ticks are delivered in arrival order.
        assert!(registration.deliver_live(&tick_at(415, 15), |_, t| seen.push(t.price)));

        assert_eq!(seen, vec![Decimal::from(410), Decimal::from(420), Decimal::from(415)]);
    }

    #[test]
    fn registration_is_shared_with_snapshots() {
        let registry = SubscriptionRegistry::new();
        let cb = noop();
        registry.add(&crdb(), cb.clone());

        let snapshot = registry.registrations(&crdb());
        assert!(snapshot[0].deliver_live(&tick_at(410, 10), |_, _| {}));

        let registration = registry.registration(&crdb(), &cb).unwrap();
        assert!(!registration.deliver_backfill(&tick_at(400, 0), |_, _| {}));
        assert_eq!(registration.callback(), &cb);
    }

    #[test]
    fn removing_last_callback_closes_channel() {
        let registry = SubscriptionRegistry::new();
        let cb = noop();

        registry.add(&crdb(), cb.clone());
        assert_eq!(registry.remove(&crdb(), &cb), ChannelChange::Closed);
        assert!(!registry.is_active(&crdb()));
        assert!(registry.active_securities().is_empty());
    }

    #[test]
    fn removing_with_remaining_callbacks_keeps_channel() {
        let registry = SubscriptionRegistry::new();
        let a = noop();
        let b = noop();

        registry.add(&crdb(), a.clone());
        registry.add(&crdb(), b.clone());

        assert_eq!(registry.remove(&crdb(), &a), ChannelChange::Unchanged);
        assert!(registry.contains(&crdb(), &b));
        assert!(!registry.contains(&crdb(), &a));
    }

    #[test]
    fn removing_unknown_callback_is_noop() {
        let registry = SubscriptionRegistry::new();
        let registered = noop();
        registry.add(&crdb(), registered.clone());

        assert_eq!(registry.remove(&crdb(), &noop()), ChannelChange::Noop);
        assert_eq!(
            registry.remove(&SecurityId::new("NMB"), &registered),
            ChannelChange::Noop
        );
        assert!(registry.contains(&crdb(), &registered));
    }

    #[test]
    fn previews_match_mutations() {
        let registry = SubscriptionRegistry::new();
        let a = noop();
        let b = noop();

        assert_eq!(registry.preview_add(&crdb(), &a), ChannelChange::Opened);
        registry.add(&crdb(), a.clone());
        assert_eq!(registry.preview_add(&crdb(), &a), ChannelChange::Noop);
        assert_eq!(registry.preview_add(&crdb(), &b), ChannelChange::Unchanged);

        assert_eq!(registry.preview_remove(&crdb(), &b), ChannelChange::Noop);
        assert_eq!(registry.preview_remove(&crdb(), &a), ChannelChange::Closed);
        registry.add(&crdb(), b);
        assert_eq!(registry.preview_remove(&crdb(), &a), ChannelChange::Unchanged);
    }

    #[test]
    fn callbacks_keep_registration_order() {
        let registry = SubscriptionRegistry::new();
        let a = noop();
        let b = noop();
        let c = noop();

        registry.add(&crdb(), a.clone());
        registry.add(&crdb(), b.clone());
        registry.add(&crdb(), c.clone());

        assert_eq!(registry.callbacks(&crdb()), vec![a, b, c]);
    }

    #[test]
    fn resubscribe_after_close_reopens() {
        let registry = SubscriptionRegistry::new();
        let cb = noop();

        registry.add(&crdb(), cb.clone());
        registry.remove(&crdb(), &cb);
        assert_eq!(registry.add(&crdb(), cb), ChannelChange::Opened);
    }

    #[test]
    fn clear_returns_active_securities() {
        let registry = SubscriptionRegistry::new();
        registry.add(&crdb(), noop());
        registry.add(&SecurityId::new("NMB"), noop());

        let mut cleared = registry.clear();
        cleared.sort();

        assert_eq!(cleared, vec![crdb(), SecurityId::new("NMB")]);
        assert_eq!(registry.stats(), SubscriptionStats::default());
    }

    #[test]
    fn stats_are_accurate() {
        let registry = SubscriptionRegistry::new();
        registry.add(&crdb(), noop());
        registry.add(&crdb(), noop());
        registry.add(&SecurityId::new("TBL"), noop());

        let stats = registry.stats();
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.callback_count, 3);
    }

    #[test]
    fn callback_handle_invokes_closure() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let cb = CallbackHandle::from_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let tick = crate::domain::market_data::NewTick::new("CRDB", 405.into(), Some(1500))
            .at(chrono::Utc::now());
        cb.call(&tick);
        cb.call(&tick);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
