// src/ingest/enrich.rs
//! Backfill rank/rarity on events from the thin feed using the rich feed.
//! Best effort: a failed, slow or empty lookup leaves `rank_info` as `None`.
//!
//! Each lookup is bounded by a short timeout, and a failed item is not asked
//! again until the back-off entry expires, so a hanging upstream costs at most
//! one timeout per item per back-off period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics::counter;
use moka::future::Cache;

use crate::ingest::types::{Event, RankInfo, SourceFeed};

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(30);

#[async_trait::async_trait]
pub trait RankLookup: Send + Sync {
    async fn lookup_rank(&self, collection_id: &str, serial_number: u64) -> Result<Option<RankInfo>>;
}

type ItemKey = (String, u64);

pub struct Enricher {
    lookup: Arc<dyn RankLookup>,
    /// Feed whose events lack rank metadata.
    weak_feed: SourceFeed,
    ranks: Cache<ItemKey, Option<RankInfo>>,
    failures: Cache<ItemKey, ()>,
    lookup_timeout: Duration,
}

impl Enricher {
    pub fn new(lookup: Arc<dyn RankLookup>, weak_feed: SourceFeed, cache_ttl: Duration) -> Self {
        Self {
            lookup,
            weak_feed,
            ranks: Cache::builder()
                .time_to_live(cache_ttl)
                .max_capacity(50_000)
                .build(),
            failures: Cache::builder()
                .time_to_live(DEFAULT_FAILURE_BACKOFF)
                .max_capacity(10_000)
                .build(),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Returns how many events gained rank info.
    pub async fn enrich(&self, events: &mut [Event]) -> usize {
        let mut enriched = 0usize;
        for ev in events
            .iter_mut()
            .filter(|e| e.source_feed == self.weak_feed && e.rank_info.is_none())
        {
            let key = (ev.collection_id.clone(), ev.serial_number);
            let found = if self.failures.get(&key).await.is_some() {
                None
            } else if let Some(cached) = self.ranks.get(&key).await {
                cached
            } else {
                self.fetch(key, ev).await
            };

            match found {
                Some(info) => {
                    ev.rank_info = Some(info);
                    enriched += 1;
                }
                None => counter!("enrich_misses_total").increment(1),
            }
        }
        enriched
    }

    async fn fetch(&self, key: ItemKey, ev: &Event) -> Option<RankInfo> {
        let call = self.lookup.lookup_rank(&ev.collection_id, ev.serial_number);
        let error = match tokio::time::timeout(self.lookup_timeout, call).await {
            Ok(Ok(found)) => {
                self.ranks.insert(key, found).await;
                return found;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("timed out after {:?}", self.lookup_timeout),
        };

        tracing::warn!(
            target: "ingest",
            error = %error,
            collection = %ev.collection_id,
            serial = ev.serial_number,
            "rank lookup failed, backing off"
        );
        self.failures.insert(key, ()).await;
        None
    }
}
