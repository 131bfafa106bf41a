//! # Pipeline
//! One tick end-to-end: fetch both feeds → dedupe → recency filter → enrich
//! the survivors → per event: ledger check → resolve → dispatch → ledger
//! record → watermark.
//!
//! Dedupe runs before the filter so a feed's late copy of an event cannot
//! survive just because the first copy already fell under the watermark; the
//! ledger check also matches on the dedupe key for copies that arrive after
//! the first one left the feed page. Only events that will actually be
//! processed are enriched.
//!
//! Stages after the fetch run sequentially. Every failure is absorbed at the
//! stage that hit it; a tick only reports, it never aborts the process.
//!
//! The watermark of a class only moves across a contiguous run of confirmed
//! events. Once one event of the batch is left unconfirmed (ledger lookup or
//! write failed, or the ledger policy held it back), later events are still
//! delivered and recorded but no longer move the watermark, so the held event
//! is retried on the next tick while it is fresh.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::config::LedgerPolicy;
use crate::ingest::dedup::dedupe;
use crate::ingest::enrich::Enricher;
use crate::ingest::fetch_all;
use crate::ingest::filter::{filter_class, FreshnessWindows};
use crate::ingest::types::{Event, EventClass, FeedAdapter};
use crate::ledger::{Ledger, RecordOutcome, Watermarks};
use crate::notify::Dispatcher;
use crate::subscriptions::SubscriptionResolver;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ledger_skipped_total",
            "Events skipped because the ledger already holds them."
        );
        describe_counter!("dispatch_success_total", "Successful deliveries.");
        describe_counter!("dispatch_failure_total", "Failed deliveries.");
        describe_counter!(
            "dispatch_undeliverable_total",
            "Events with destinations where every delivery failed."
        );
        describe_counter!(
            "ledger_write_failures_total",
            "Ledger or watermark writes that could not be confirmed."
        );
        describe_histogram!("pipeline_tick_ms", "Tick duration in milliseconds.");
        describe_gauge!("pipeline_last_tick_ts", "Unix ts when the last tick finished.");
    });
}

/// Per-tick tallies, exposed on `/status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub fetched_a: usize,
    pub fetched_b: usize,
    pub enriched: usize,
    pub stale: usize,
    pub duplicates: usize,
    pub already_delivered: usize,
    pub processed: usize,
    pub deliveries_ok: usize,
    pub deliveries_failed: usize,
    pub undeliverable: usize,
    pub held_back: usize,
    pub ledger_failures: usize,
}

/// What happened to a single event after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// In the ledger (now or before); the watermark may move past it.
    Confirmed,
    /// Not in the ledger; must stay above the watermark.
    Unconfirmed,
}

pub struct Pipeline {
    feed_a: Arc<dyn FeedAdapter>,
    feed_b: Arc<dyn FeedAdapter>,
    enricher: Enricher,
    ledger: Arc<dyn Ledger>,
    resolver: Arc<SubscriptionResolver>,
    dispatcher: Dispatcher,
    windows: FreshnessWindows,
    fetch_limit: usize,
    policy: LedgerPolicy,
}

impl Pipeline {
    pub fn new(
        feed_a: Arc<dyn FeedAdapter>,
        feed_b: Arc<dyn FeedAdapter>,
        enricher: Enricher,
        ledger: Arc<dyn Ledger>,
        resolver: Arc<SubscriptionResolver>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            feed_a,
            feed_b,
            enricher,
            ledger,
            resolver,
            dispatcher,
            windows: FreshnessWindows::default(),
            fetch_limit: 50,
            policy: LedgerPolicy::Always,
        }
    }

    pub fn with_windows(mut self, windows: FreshnessWindows) -> Self {
        self.windows = windows;
        self
    }

    pub fn with_fetch_limit(mut self, limit: usize) -> Self {
        self.fetch_limit = limit.max(1);
        self
    }

    pub fn with_policy(mut self, policy: LedgerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn resolver(&self) -> &Arc<SubscriptionResolver> {
        &self.resolver
    }

    /// Seed each class watermark from the newest event either feed currently
    /// reports (or `now` if none), never lowering a stored value. Keeps a restart
    /// from replaying the feeds' backlog.
    pub async fn seed_watermarks(&self, now: DateTime<Utc>) -> Result<Watermarks> {
        let (a, b) = fetch_all(&*self.feed_a, &*self.feed_b, self.fetch_limit).await;
        let mut seeded = Watermarks::default();

        for class in EventClass::ALL {
            let newest = a
                .iter()
                .chain(b.iter())
                .filter(|e| e.event_class == class)
                .map(|e| e.occurred_at)
                .max();
            let stored = self
                .ledger
                .watermark(class)
                .await
                .with_context(|| format!("reading {class} watermark"))?;
            let target = match (newest.unwrap_or(now), stored) {
                (seed, Some(cur)) if cur > seed => cur,
                (seed, _) => seed,
            };
            self.ledger
                .set_watermark(class, target)
                .await
                .with_context(|| format!("seeding {class} watermark"))?;
            seeded.advance(class, target);

            tracing::info!(
                target: "pipeline",
                class = %class,
                watermark = %target,
                from_feed = newest.is_some(),
                "watermark seeded"
            );
        }
        Ok(seeded)
    }

    pub async fn run_tick(&self) -> TickReport {
        self.run_tick_at(Utc::now()).await
    }

    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> TickReport {
        ensure_metrics_described();
        let t0 = Instant::now();
        let mut report = TickReport {
            started_at: Some(now),
            ..TickReport::default()
        };

        let (a, b) = fetch_all(&*self.feed_a, &*self.feed_b, self.fetch_limit).await;
        report.fetched_a = a.len();
        report.fetched_b = b.len();

        let mut batch = a;
        batch.extend(b);

        let (sales, listings): (Vec<Event>, Vec<Event>) = batch
            .into_iter()
            .partition(|e| e.event_class == EventClass::Sale);

        for (class, events) in [(EventClass::Sale, sales), (EventClass::Listing, listings)] {
            self.run_class(class, events, now, &mut report).await;
        }

        report.duration_ms = t0.elapsed().as_millis() as u64;
        histogram!("pipeline_tick_ms").record(report.duration_ms as f64);
        gauge!("pipeline_last_tick_ts").set(Utc::now().timestamp() as f64);
        report
    }

    async fn run_class(
        &self,
        class: EventClass,
        events: Vec<Event>,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let watermark = match self.ledger.watermark(class).await {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(target: "pipeline", error = ?e, class = %class, "watermark read failed, skipping class this tick");
                report.ledger_failures += 1;
                return;
            }
        };

        let (unique, dups) = dedupe(events);
        counter!("ingest_dedup_total", "class" => class.as_str()).increment(dups as u64);
        report.duplicates += dups;

        let (mut fresh, stale) = filter_class(unique, class, watermark, now, &self.windows);
        counter!("ingest_stale_total", "class" => class.as_str()).increment(stale as u64);
        report.stale += stale;

        report.enriched += self.enricher.enrich(&mut fresh).await;

        // stable: equal instants keep first-seen order
        fresh.sort_by_key(|e| e.occurred_at);

        let mut hold_watermark = false;
        for ev in &fresh {
            match self.process_event(ev, report).await {
                Outcome::Confirmed if !hold_watermark => self.advance_watermark(ev, report).await,
                Outcome::Confirmed => {}
                Outcome::Unconfirmed => hold_watermark = true,
            }
        }
    }

    async fn process_event(&self, ev: &Event, report: &mut TickReport) -> Outcome {
        let id = ev.identity_id();
        let key = ev.dedupe_key();

        match self.ledger.exists(&id, &key).await {
            Ok(true) => {
                report.already_delivered += 1;
                counter!("ledger_skipped_total").increment(1);
                tracing::debug!(target: "pipeline", id = %id, "already delivered");
                return Outcome::Confirmed;
            }
            Ok(false) => {}
            Err(e) => {
                // unknown state: do not risk a duplicate, retry next tick
                tracing::warn!(target: "pipeline", error = ?e, id = %id, "ledger lookup failed, deferring event");
                report.ledger_failures += 1;
                return Outcome::Unconfirmed;
            }
        }

        let routes = self.resolver.resolve(&ev.collection_id, ev.event_class);
        let dispatch = self.dispatcher.dispatch(ev, &routes).await;
        report.deliveries_ok += dispatch.delivered;
        report.deliveries_failed += dispatch.failed;

        if dispatch.undeliverable() {
            report.undeliverable += 1;
            counter!("dispatch_undeliverable_total").increment(1);
            tracing::warn!(
                target: "pipeline",
                id = %id,
                collection = %ev.collection_id,
                destinations = dispatch.attempted,
                status = "undeliverable",
                "no destination accepted the notification"
            );
            if self.policy == LedgerPolicy::RequireDelivery {
                report.held_back += 1;
                return Outcome::Unconfirmed;
            }
        }

        match self.ledger.record(&id, &key, &ev.collection_id).await {
            Ok(outcome) => {
                if outcome == RecordOutcome::AlreadyExists {
                    // another tick got there first
                    tracing::debug!(target: "pipeline", id = %id, "ledger entry already present");
                }
                report.processed += 1;
                tracing::info!(
                    target: "pipeline",
                    id = %id,
                    class = %ev.event_class,
                    feed = ev.source_feed.as_str(),
                    delivered = dispatch.delivered,
                    failed = dispatch.failed,
                    "event processed"
                );
                Outcome::Confirmed
            }
            Err(e) => {
                tracing::error!(target: "pipeline", error = ?e, id = %id, "ledger write failed, event may be redelivered");
                counter!("ledger_write_failures_total").increment(1);
                report.ledger_failures += 1;
                Outcome::Unconfirmed
            }
        }
    }

    async fn advance_watermark(&self, ev: &Event, report: &mut TickReport) {
        if let Err(e) = self.ledger.set_watermark(ev.event_class, ev.occurred_at).await {
            tracing::warn!(target: "pipeline", error = ?e, class = %ev.event_class, "watermark write failed");
            counter!("ledger_write_failures_total").increment(1);
            report.ledger_failures += 1;
        }
    }
}
