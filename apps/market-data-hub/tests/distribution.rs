//! Tick Distribution Integration Tests
//!
//! Exercises `MarketDataService` over the in-memory store, cache and
//! broker: channel lifecycle, delivery order, backfill, callback isolation
//! and the publish path's failure behaviour.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use proptest::prelude::*;
use rust_decimal::Decimal;
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;

use market_data_hub::{
    CallbackHandle, DataAccessError, DatabaseService, DistributorConfig, FastCache,
    InMemoryBroker, InMemoryCache, InMemoryStore, MarketDataError, MarketDataService, NewTick,
    SecurityId, Tick, TransportError, TransportPublisher,
};

struct Hub {
    service: MarketDataService,
    database: Arc<DatabaseService>,
    store: Arc<InMemoryStore>,
    cache: Arc<InMemoryCache>,
    broker: InMemoryBroker,
}

fn hub() -> Hub {
    hub_with_config(DistributorConfig::default())
}

fn hub_with_config(config: DistributorConfig) -> Hub {
    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(InMemoryCache::new());
    let broker = InMemoryBroker::new();
    let database = Arc::new(DatabaseService::new(store.clone(), cache.clone()));
    let service = MarketDataService::start_with_config(
        Arc::clone(&database),
        Arc::new(broker.publisher()),
        Arc::new(broker.subscriber()),
        config,
    )
    .unwrap();

    Hub {
        service,
        database,
        store,
        cache,
        broker,
    }
}

fn recorder() -> (CallbackHandle, mpsc::UnboundedReceiver<Tick>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = CallbackHandle::from_fn(move |tick| {
        let _ = tx.send(tick.clone());
    });
    (callback, rx)
}

async fn next_tick(rx: &mut mpsc::UnboundedReceiver<Tick>) -> Tick {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("tick not delivered in time")
        .expect("callback dropped")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Tick>) {
    assert!(
        timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
        "unexpected delivery"
    );
}

fn tick(id: &str, price: i64, volume: i64) -> NewTick {
    NewTick::new(id, Decimal::from(price), Some(volume))
}

/// Cache whose next read holds its value until released.
#[derive(Default)]
struct SlowReadCache {
    inner: InMemoryCache,
    armed: AtomicBool,
    reading: Notify,
    release: Notify,
}

#[async_trait]
impl FastCache for SlowReadCache {
    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), DataAccessError> {
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DataAccessError> {
        let value = self.inner.get(key).await;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reading.notify_one();
            self.release.notified().await;
        }
        value
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), DataAccessError> {
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), DataAccessError> {
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, DataAccessError> {
        self.inner.set_members(key).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

// =============================================================================
// Publish Path
// =============================================================================

#[tokio::test]
async fn publish_update_converges_store_and_cache() {
    let hub = hub();
    let crdb = SecurityId::new("CRDB");
    let before = Utc::now();

    let published = hub.service.publish_update(tick("CRDB", 405, 1500)).await.unwrap();

    let cached = hub.database.get_cached_tick(&crdb).await.unwrap().unwrap();
    let history = hub
        .service
        .get_historical_data(&crdb, before, Utc::now())
        .await
        .unwrap();
    let stored = history.last().unwrap();

    assert_eq!(cached.price, stored.price);
    assert_eq!(cached.volume, stored.volume);
    assert_eq!(cached, published);
    assert_eq!(hub.broker.published_count(), 1);
}

#[tokio::test]
async fn store_failure_prevents_cache_write_and_publish() {
    let hub = hub();
    let (callback, mut rx) = recorder();
    hub.service
        .subscribe(&SecurityId::new("TBL"), &callback)
        .await
        .unwrap();

    hub.store.set_unavailable(true);
    let cache_calls = hub.cache.calls();

    let err = hub
        .service
        .publish_update(tick("TBL", 1000, 10))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MarketDataError::DataAccess(DataAccessError::StoreUnavailable { .. })
    ));
    assert_eq!(hub.cache.calls(), cache_calls);
    assert_eq!(hub.broker.published_count(), 0);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn publish_failure_leaves_store_and_cache_updated() {
    let hub = hub();
    let nmb = SecurityId::new("NMB");
    let (callback, mut rx) = recorder();
    hub.service.subscribe(&nmb, &callback).await.unwrap();

    hub.broker.fail_publishes(true);

    let err = hub
        .service
        .publish_update(tick("NMB", 3910, 200))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MarketDataError::Transport(TransportError::PublishFailed { .. })
    ));
    assert_eq!(hub.store.tick_count(&nmb), 1);
    let cached = hub.database.get_cached_tick(&nmb).await.unwrap().unwrap();
    assert_eq!(cached.price, Decimal::from(3910));
    assert_quiet(&mut rx).await;
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn every_callback_on_a_channel_is_invoked_once() {
    let hub = hub();
    let nmb = SecurityId::new("NMB");
    let (first, mut first_rx) = recorder();
    let (second, mut second_rx) = recorder();
    hub.service.subscribe(&nmb, &first).await.unwrap();
    hub.service.subscribe(&nmb, &second).await.unwrap();

    hub.service.publish_update(tick("NMB", 3910, 200)).await.unwrap();

    for rx in [&mut first_rx, &mut second_rx] {
        let received = next_tick(rx).await;
        assert_eq!(received.price, Decimal::from(3910));
        assert_eq!(received.volume, Some(200));
        assert_quiet(rx).await;
    }
}

#[tokio::test]
async fn delivery_follows_publish_order() {
    let hub = hub();
    let crdb = SecurityId::new("CRDB");
    let (callback, mut rx) = recorder();
    hub.service.subscribe(&crdb, &callback).await.unwrap();

    for price in 1..=25 {
        hub.service.publish_update(tick("CRDB", price, 1)).await.unwrap();
    }

    for price in 1..=25 {
        assert_eq!(next_tick(&mut rx).await.price, Decimal::from(price));
    }
}

#[tokio::test]
async fn other_channels_are_not_delivered() {
    let hub = hub();
    let (callback, mut rx) = recorder();
    hub.service
        .subscribe(&SecurityId::new("CRDB"), &callback)
        .await
        .unwrap();

    hub.service.publish_update(tick("NMB", 3910, 1)).await.unwrap();

    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn late_subscriber_is_backfilled_from_cache() {
    let hub = hub();
    let crdb = SecurityId::new("CRDB");
    let published = hub.service.publish_update(tick("CRDB", 405, 1500)).await.unwrap();

    let (callback, mut rx) = recorder();
    hub.service.subscribe(&crdb, &callback).await.unwrap();

    // Delivered before subscribe returned.
    assert_eq!(rx.try_recv().unwrap(), published);
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn backfill_never_follows_a_newer_live_tick() {
    let cache = Arc::new(SlowReadCache::default());
    let broker = InMemoryBroker::new();
    let database = Arc::new(DatabaseService::new(
        Arc::new(InMemoryStore::new()),
        cache.clone(),
    ));
    let service = MarketDataService::start(
        database,
        Arc::new(broker.publisher()),
        Arc::new(broker.subscriber()),
    )
    .unwrap();
    let crdb = SecurityId::new("CRDB");
    service.publish_update(tick("CRDB", 400, 1)).await.unwrap();

    let (callback, mut rx) = recorder();
    cache.armed.store(true, Ordering::SeqCst);

    // The backfill read returns 400 but is held until 410 has gone out live.
    let ((), live) = tokio::join!(
        async { service.subscribe(&crdb, &callback).await.unwrap() },
        async {
            cache.reading.notified().await;
            service.publish_update(tick("CRDB", 410, 1)).await.unwrap();
            let live = next_tick(&mut rx).await;
            cache.release.notify_one();
            live
        },
    );

    assert_eq!(live.price, Decimal::from(410));
    assert_quiet(&mut rx).await;

    service.publish_update(tick("CRDB", 420, 1)).await.unwrap();
    assert_eq!(next_tick(&mut rx).await.price, Decimal::from(420));
}

#[tokio::test]
async fn duplicate_subscription_delivers_once() {
    let hub = hub();
    let crdb = SecurityId::new("CRDB");
    let (callback, mut rx) = recorder();

    hub.service.subscribe(&crdb, &callback).await.unwrap();
    hub.service.subscribe(&crdb, &callback).await.unwrap();
    assert_eq!(hub.service.subscription_stats().callback_count, 1);

    hub.service.publish_update(tick("CRDB", 405, 1)).await.unwrap();

    next_tick(&mut rx).await;
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn panicking_callback_does_not_starve_others() {
    let hub = hub();
    let crdb = SecurityId::new("CRDB");
    let panics = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&panics);
    let faulty = CallbackHandle::from_fn(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        panic!("subscriber bug");
    });
    let (healthy, mut rx) = recorder();

    hub.service.subscribe(&crdb, &faulty).await.unwrap();
    hub.service.subscribe(&crdb, &healthy).await.unwrap();

    hub.service.publish_update(tick("CRDB", 405, 1)).await.unwrap();
    hub.service.publish_update(tick("CRDB", 406, 1)).await.unwrap();

    assert_eq!(next_tick(&mut rx).await.price, Decimal::from(405));
    assert_eq!(next_tick(&mut rx).await.price, Decimal::from(406));
    assert_eq!(panics.load(Ordering::SeqCst), 2);
    assert!(hub.service.is_dispatching());
}

#[tokio::test]
async fn malformed_payload_is_skipped() {
    let hub = hub();
    let crdb = SecurityId::new("CRDB");
    let (callback, mut rx) = recorder();
    hub.service.subscribe(&crdb, &callback).await.unwrap();

    let rogue = hub.broker.publisher();
    rogue.publish("market:CRDB", "{not json").await.unwrap();
    rogue
        .publish("market:CRDB", r#"{"securityId":"NMB","timestamp":"2026-01-05T10:00:00Z","price":"1"}"#)
        .await
        .unwrap();

    hub.service.publish_update(tick("CRDB", 405, 1)).await.unwrap();

    assert_eq!(next_tick(&mut rx).await.price, Decimal::from(405));
    assert_quiet(&mut rx).await;
}

// =============================================================================
// Channel Lifecycle
// =============================================================================

#[tokio::test]
async fn channel_follows_first_and_last_callback() {
    let hub = hub();
    let tbl = SecurityId::new("TBL");
    let (first, _first_rx) = recorder();
    let (second, _second_rx) = recorder();

    hub.service.subscribe(&tbl, &first).await.unwrap();
    assert!(hub.broker.is_subscribed("market:TBL"));

    hub.service.subscribe(&tbl, &second).await.unwrap();
    hub.service.unsubscribe(&tbl, &first).await.unwrap();
    assert!(hub.broker.is_subscribed("market:TBL"));

    hub.service.unsubscribe(&tbl, &second).await.unwrap();
    assert!(!hub.broker.is_subscribed("market:TBL"));
    assert!(!hub.service.is_subscribed(&tbl));
}

#[tokio::test]
async fn resubscribe_after_full_unsubscribe() {
    let hub = hub();
    let tbl = SecurityId::new("TBL");
    let (callback, mut rx) = recorder();

    hub.service.subscribe(&tbl, &callback).await.unwrap();
    hub.service.unsubscribe(&tbl, &callback).await.unwrap();
    hub.service.subscribe(&tbl, &callback).await.unwrap();

    assert!(hub.broker.is_subscribed("market:TBL"));
    hub.service.publish_update(tick("TBL", 1000, 1)).await.unwrap();
    assert_eq!(next_tick(&mut rx).await.price, Decimal::from(1000));
}

#[tokio::test]
async fn unknown_unsubscribe_is_a_noop() {
    let hub = hub();
    let crdb = SecurityId::new("CRDB");
    let (registered, _rx) = recorder();
    let (stranger, _stranger_rx) = recorder();

    hub.service
        .unsubscribe(&SecurityId::new("NMB"), &stranger)
        .await
        .unwrap();

    hub.service.subscribe(&crdb, &registered).await.unwrap();
    hub.service.unsubscribe(&crdb, &stranger).await.unwrap();
    hub.service.unsubscribe(&crdb, &stranger).await.unwrap();

    assert!(hub.broker.is_subscribed("market:CRDB"));
    assert_eq!(hub.service.subscription_stats().callback_count, 1);
    assert_eq!(
        hub.broker.subscribed_channels(),
        HashSet::from(["market:CRDB".to_string()])
    );
}

#[tokio::test]
async fn failed_channel_subscribe_registers_nothing() {
    let hub = hub();
    let dse = SecurityId::new("DSE");
    let (callback, _rx) = recorder();
    hub.broker.fail_subscriptions(true);

    let err = hub.service.subscribe(&dse, &callback).await.unwrap_err();

    assert!(matches!(
        err,
        MarketDataError::Transport(TransportError::SubscribeFailed { .. })
    ));
    assert!(!hub.service.is_subscribed(&dse));
    assert!(!hub.broker.is_subscribed("market:DSE"));
}

#[tokio::test]
async fn failed_channel_unsubscribe_keeps_registration() {
    let hub = hub();
    let dse = SecurityId::new("DSE");
    let (callback, _rx) = recorder();
    hub.service.subscribe(&dse, &callback).await.unwrap();
    hub.broker.fail_subscriptions(true);

    assert!(hub.service.unsubscribe(&dse, &callback).await.is_err());

    assert!(hub.service.is_subscribed(&dse));
    assert!(hub.broker.is_subscribed("market:DSE"));
}

#[tokio::test]
async fn abandoned_subscribe_still_completes_consistently() {
    let hub = hub();
    let crdb = SecurityId::new("CRDB");
    let (callback, _rx) = recorder();

    // Give up before the transition task has a chance to run.
    let _ = timeout(Duration::ZERO, hub.service.subscribe(&crdb, &callback)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        hub.service.is_subscribed(&crdb),
        hub.broker.is_subscribed("market:CRDB")
    );
}

// =============================================================================
// Streams
// =============================================================================

#[tokio::test]
async fn stream_yields_backfill_then_live_ticks() {
    let hub = hub();
    let crdb = SecurityId::new("CRDB");
    hub.service.publish_update(tick("CRDB", 400, 1)).await.unwrap();

    let mut stream = hub.service.stream(&crdb).await.unwrap();
    hub.service.publish_update(tick("CRDB", 401, 1)).await.unwrap();

    let first = timeout(Duration::from_secs(2), stream.next()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), stream.next()).await.unwrap().unwrap();
    assert_eq!(first.price, Decimal::from(400));
    assert_eq!(second.price, Decimal::from(401));

    stream.close().await.unwrap();
    assert!(!hub.broker.is_subscribed("market:CRDB"));
}

#[tokio::test]
async fn stalled_stream_holds_at_most_its_capacity() {
    let hub = hub_with_config(DistributorConfig { stream_capacity: 4 });
    let crdb = SecurityId::new("CRDB");

    let mut stream = hub.service.stream(&crdb).await.unwrap();
    // Registered after the stream, so it sees each tick after the stream did.
    let (witness, mut rx) = recorder();
    hub.service.subscribe(&crdb, &witness).await.unwrap();

    for price in 1..=10 {
        hub.service.publish_update(tick("CRDB", price, 1)).await.unwrap();
    }
    for _ in 1..=10 {
        next_tick(&mut rx).await;
    }

    assert_eq!((&stream).buffered(), 4);
    for price in 1..=4 {
        let received = timeout(Duration::from_secs(2), stream.recv()).await.unwrap().unwrap();
        assert_eq!(received.price, Decimal::from(price));
    }
    assert!(timeout(Duration::from_millis(100), stream.recv()).await.is_err());

    // Room again once drained.
    hub.service.publish_update(tick("CRDB", 11, 1)).await.unwrap();
    let received = timeout(Duration::from_secs(2), stream.recv()).await.unwrap().unwrap();
    assert_eq!(received.price, Decimal::from(11));
}

#[tokio::test]
async fn dropping_stream_unsubscribes() {
    let hub = hub();
    let nmb = SecurityId::new("NMB");

    let stream = hub.service.stream(&nmb).await.unwrap();
    assert!(hub.broker.is_subscribed("market:NMB"));
    drop(stream);

    timeout(Duration::from_secs(2), async {
        while hub.broker.is_subscribed("market:NMB") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream drop did not unsubscribe");
    assert!(!hub.service.is_subscribed(&nmb));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn shutdown_is_idempotent_and_ends_streams() {
    let hub = hub();
    let crdb = SecurityId::new("CRDB");
    let mut stream = hub.service.stream(&crdb).await.unwrap();

    hub.service.shutdown().await;
    hub.service.shutdown().await;

    assert!(hub.service.is_shut_down());
    assert!(!hub.service.is_dispatching());
    assert!(hub.broker.subscribed_channels().is_empty());
    assert!(timeout(Duration::from_secs(2), stream.recv()).await.unwrap().is_none());

    let err = hub
        .service
        .publish_update(tick("CRDB", 1, 1))
        .await
        .unwrap_err();
    assert_eq!(err, MarketDataError::ShutDown);

    let (callback, _rx) = recorder();
    assert_eq!(
        hub.service.subscribe(&crdb, &callback).await.unwrap_err(),
        MarketDataError::ShutDown
    );
}

// =============================================================================
// Property Tests
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    Subscribe(usize, usize),
    Unsubscribe(usize, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..2usize, 0..3usize).prop_map(|(s, c)| Op::Subscribe(s, c)),
        (0..2usize, 0..3usize).prop_map(|(s, c)| Op::Unsubscribe(s, c)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn channel_subscribed_iff_callbacks_registered(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let hub = hub();
            let securities = [SecurityId::new("CRDB"), SecurityId::new("NMB")];
            let callbacks: Vec<CallbackHandle> =
                (0..3).map(|_| CallbackHandle::from_fn(|_| {})).collect();
            let mut model: HashMap<usize, HashSet<usize>> = HashMap::new();

            for op in ops {
                match op {
                    Op::Subscribe(s, c) => {
                        hub.service.subscribe(&securities[s], &callbacks[c]).await.unwrap();
                        model.entry(s).or_default().insert(c);
                    }
                    Op::Unsubscribe(s, c) => {
                        hub.service.unsubscribe(&securities[s], &callbacks[c]).await.unwrap();
                        model.entry(s).or_default().remove(&c);
                    }
                }

                for (s, security) in securities.iter().enumerate() {
                    let expected = model.get(&s).is_some_and(|set| !set.is_empty());
                    assert_eq!(hub.service.is_subscribed(security), expected);
                    assert_eq!(hub.broker.is_subscribed(&security.channel()), expected);
                }
            }

            hub.service.shutdown().await;
        });
    }
}
