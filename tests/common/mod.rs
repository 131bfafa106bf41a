// tests/common/mod.rs
// Shared mocks for integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use collectible_notifier::config::LedgerPolicy;
use collectible_notifier::ingest::enrich::{Enricher, RankLookup};
use collectible_notifier::ingest::types::{
    DedupeKey, Event, EventClass, FeedAdapter, IdentityId, RankInfo, SourceFeed,
};
use collectible_notifier::ledger::{Ledger, MemoryLedger, RecordOutcome};
use collectible_notifier::notify::{DeliveryReceipt, Dispatcher, Notification, Notifier};
use collectible_notifier::pipeline::Pipeline;
use collectible_notifier::subscriptions::{
    ChannelRef, Destination, MemorySubscriptionStore, SubscriptionResolver,
};

pub fn event(
    collection: &str,
    serial: u64,
    class: EventClass,
    feed: SourceFeed,
    at: DateTime<Utc>,
    source_ref: &str,
) -> Event {
    Event {
        collection_id: collection.to_string(),
        serial_number: serial,
        event_class: class,
        source_feed: feed,
        occurred_at: at,
        source_ref: Some(source_ref.to_string()),
        price_minor: 600,
        price_currency: "TON".into(),
        counterparty_from: "alice".into(),
        counterparty_to: match class {
            EventClass::Sale => Some("bob".into()),
            EventClass::Listing => None,
        },
        display_name: "Plush Pepe".into(),
        image_reference: None,
        rank_info: None,
        raw_source_payload: serde_json::Value::Null,
    }
}

pub fn destination(id: &str, secondary: Option<&str>, enabled: bool, collections: &[&str]) -> Destination {
    Destination {
        destination_id: id.to_string(),
        primary_channel: ChannelRef(format!("{id}-main")),
        secondary_channel: secondary.map(|s| ChannelRef(s.to_string())),
        enabled,
        tracked_collections: collections.iter().map(|c| c.to_string()).collect(),
    }
}

/// Feed returning whatever the test put in it.
pub struct MockFeed {
    feed: SourceFeed,
    pub events: Mutex<Vec<Event>>,
    pub calls: AtomicUsize,
}

impl MockFeed {
    pub fn new(feed: SourceFeed, events: Vec<Event>) -> Arc<Self> {
        Arc::new(Self {
            feed,
            events: Mutex::new(events),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, events: Vec<Event>) {
        *self.events.lock() = events;
    }
}

#[async_trait]
impl FeedAdapter for MockFeed {
    async fn fetch(&self, limit: usize) -> Vec<Event> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().iter().take(limit).cloned().collect()
    }

    fn feed(&self) -> SourceFeed {
        self.feed
    }
}

pub struct NoRanks;

#[async_trait]
impl RankLookup for NoRanks {
    async fn lookup_rank(&self, _c: &str, _s: u64) -> Result<Option<RankInfo>> {
        Ok(None)
    }
}

/// Rank source that never answers in time.
#[derive(Default)]
pub struct HangingRanks {
    pub calls: AtomicUsize,
}

#[async_trait]
impl RankLookup for HangingRanks {
    async fn lookup_rank(&self, _c: &str, _s: u64) -> Result<Option<RankInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(None)
    }
}

/// Records deliveries; channels listed in `failing` reject every message.
#[derive(Default)]
pub struct RecordingNotifier {
    pub failing: Mutex<HashSet<String>>,
    pub delivered: Mutex<Vec<(String, String)>>,
    pub attempts: AtomicUsize,
    pub acks: AtomicUsize,
    pub fail_acks: AtomicBool,
    next_id: AtomicI64,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_channel(&self, channel: &str) {
        self.failing.lock().insert(channel.to_string());
    }

    pub fn channels(&self) -> Vec<String> {
        self.delivered.lock().iter().map(|(c, _)| c.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, channel: &ChannelRef, msg: &Notification) -> Result<DeliveryReceipt> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(&channel.0) {
            bail!("forbidden: {}", channel.0);
        }
        self.delivered.lock().push((channel.0.clone(), msg.text.clone()));
        Ok(DeliveryReceipt {
            channel: channel.clone(),
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn acknowledge(&self, _receipt: &DeliveryReceipt) -> Result<()> {
        if self.fail_acks.load(Ordering::SeqCst) {
            bail!("reactions disabled");
        }
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// In-memory ledger whose writes can be switched off.
#[derive(Default)]
pub struct FlakyLedger {
    pub inner: MemoryLedger,
    pub fail_records: AtomicBool,
    pub fail_lookups: AtomicBool,
    pub record_calls: AtomicUsize,
    pub inserted: AtomicUsize,
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn exists(&self, id: &IdentityId, key: &DedupeKey) -> Result<bool> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            bail!("storage unavailable");
        }
        self.inner.exists(id, key).await
    }

    async fn record(&self, id: &IdentityId, key: &DedupeKey, collection_id: &str) -> Result<RecordOutcome> {
        self.record_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_records.load(Ordering::SeqCst) {
            bail!("storage unavailable");
        }
        let out = self.inner.record(id, key, collection_id).await?;
        if out == RecordOutcome::Inserted {
            self.inserted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(out)
    }

    async fn watermark(&self, class: EventClass) -> Result<Option<DateTime<Utc>>> {
        self.inner.watermark(class).await
    }

    async fn set_watermark(&self, class: EventClass, at: DateTime<Utc>) -> Result<()> {
        self.inner.set_watermark(class, at).await
    }

    async fn prune_older_than(&self, age: chrono::Duration) -> Result<usize> {
        self.inner.prune_older_than(age).await
    }
}

pub struct Harness {
    pub feed_a: Arc<MockFeed>,
    pub feed_b: Arc<MockFeed>,
    pub ledger: Arc<FlakyLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<MemorySubscriptionStore>,
    pub pipeline: Arc<Pipeline>,
}

pub async fn harness(destinations: Vec<Destination>) -> Harness {
    harness_with(destinations, LedgerPolicy::Always).await
}

pub async fn harness_with(destinations: Vec<Destination>, policy: LedgerPolicy) -> Harness {
    let enricher = Enricher::new(Arc::new(NoRanks), SourceFeed::B, Duration::from_secs(60));
    harness_with_enricher(destinations, policy, enricher).await
}

pub async fn harness_with_enricher(
    destinations: Vec<Destination>,
    policy: LedgerPolicy,
    enricher: Enricher,
) -> Harness {
    let feed_a = MockFeed::new(SourceFeed::A, vec![]);
    let feed_b = MockFeed::new(SourceFeed::B, vec![]);
    let ledger = Arc::new(FlakyLedger::default());
    let notifier = RecordingNotifier::new();
    let store = Arc::new(MemorySubscriptionStore::new(destinations));
    let resolver = Arc::new(SubscriptionResolver::new(store.clone(), Duration::from_secs(30)));
    resolver.refresh().await.expect("memory store loads");

    let pipeline = Pipeline::new(
        feed_a.clone(),
        feed_b.clone(),
        enricher,
        ledger.clone(),
        resolver,
        Dispatcher::new(notifier.clone(), Duration::ZERO),
    )
    .with_policy(policy);

    Harness {
        feed_a,
        feed_b,
        ledger,
        notifier,
        store,
        pipeline: Arc::new(pipeline),
    }
}
