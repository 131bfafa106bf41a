// tests/scheduler.rs
mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use collectible_notifier::ingest::enrich::Enricher;
use collectible_notifier::ingest::types::{Event, FeedAdapter, SourceFeed};
use collectible_notifier::ledger::MemoryLedger;
use collectible_notifier::notify::Dispatcher;
use collectible_notifier::pipeline::Pipeline;
use collectible_notifier::scheduler::{spawn_scheduler, tick_once, SchedulerCfg};
use collectible_notifier::subscriptions::{MemorySubscriptionStore, SubscriptionResolver};

use common::{destination, harness, MockFeed, NoRanks, RecordingNotifier};

struct PanickingFeed;

#[async_trait]
impl FeedAdapter for PanickingFeed {
    async fn fetch(&self, _limit: usize) -> Vec<Event> {
        panic!("feed blew up");
    }

    fn feed(&self) -> SourceFeed {
        SourceFeed::A
    }
}

#[tokio::test]
async fn panicking_tick_is_contained() {
    let resolver = Arc::new(SubscriptionResolver::new(
        Arc::new(MemorySubscriptionStore::new(vec![])),
        Duration::from_secs(30),
    ));
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(PanickingFeed),
        MockFeed::new(SourceFeed::B, vec![]),
        Enricher::new(Arc::new(NoRanks), SourceFeed::B, Duration::from_secs(60)),
        Arc::new(MemoryLedger::new()),
        resolver,
        Dispatcher::new(RecordingNotifier::new(), Duration::ZERO),
    ));

    assert!(tick_once(&pipeline).await.is_none());
    // the caller survives and can keep ticking
    assert!(tick_once(&pipeline).await.is_none());
}

#[tokio::test]
async fn tick_once_returns_report() {
    let h = harness(vec![destination("d1", None, true, &["T1"])]).await;
    let report = tick_once(&h.pipeline).await.expect("tick completes");
    assert_eq!(report.processed, 0);
    assert!(report.started_at.is_some());
    assert_eq!(h.feed_a.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.feed_b.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn scheduler_runs_on_cadence_and_publishes_last_tick() {
    let h = harness(vec![]).await;
    let last = Arc::new(RwLock::new(None));
    let handle = spawn_scheduler(
        h.pipeline.clone(),
        SchedulerCfg {
            interval: Duration::from_secs(3),
        },
        last.clone(),
    );

    // first tick fires immediately, second at t=3s
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    handle.abort();

    assert_eq!(h.feed_a.calls.load(Ordering::SeqCst), 2);
    assert!(last.read().unwrap().is_some());
}
