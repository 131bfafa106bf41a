// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to the collectible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventClass {
    Sale,
    Listing,
}

impl EventClass {
    pub const ALL: [EventClass; 2] = [EventClass::Sale, EventClass::Listing];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Sale => "sale",
            EventClass::Listing => "listing",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which upstream marketplace reported the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceFeed {
    A,
    B,
}

impl SourceFeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFeed::A => "market_a",
            SourceFeed::B => "market_b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankInfo {
    pub rank: u32,
    /// Share of the collection carrying this trait combination, 0.0..=1.0.
    pub rarity: f64,
}

/// Normalized sale or listing, the unit flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub collection_id: String,
    pub serial_number: u64,
    pub event_class: EventClass,
    pub source_feed: SourceFeed,
    pub occurred_at: DateTime<Utc>,
    /// Upstream transaction or listing id, when the feed exposes one.
    pub source_ref: Option<String>,

    pub price_minor: u64,
    pub price_currency: String,
    pub counterparty_from: String,
    pub counterparty_to: Option<String>,
    pub display_name: String,
    pub image_reference: Option<String>,
    pub rank_info: Option<RankInfo>,
    /// Untouched upstream record; only the formatter looks at it.
    pub raw_source_payload: serde_json::Value,
}

/// Coarse in-batch merge key: same serial, same class, same wall-clock minute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub collection_id: String,
    pub serial_number: u64,
    pub event_class: EventClass,
    pub minute: i64,
}

impl DedupeKey {
    /// Stable string form, persisted by the ledger so a copy reported late by
    /// the other feed is still recognised after the first one was delivered.
    pub fn ledger_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.collection_id, self.serial_number, self.event_class, self.minute
        )
    }
}

/// Fine-grained identity used by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Event {
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            collection_id: self.collection_id.clone(),
            serial_number: self.serial_number,
            event_class: self.event_class,
            minute: self.occurred_at.timestamp_millis().div_euclid(60_000),
        }
    }

    pub fn identity_id(&self) -> IdentityId {
        IdentityId(format!(
            "{}:{}:{}:{}:{}",
            self.collection_id,
            self.serial_number,
            self.event_class,
            self.occurred_at.timestamp_millis(),
            self.source_ref.as_deref().unwrap_or("-"),
        ))
    }
}

/// One upstream marketplace, normalized into `Event`s.
///
/// Implementations never fail: upstream errors are logged and yield an empty list.
#[async_trait::async_trait]
pub trait FeedAdapter: Send + Sync {
    async fn fetch(&self, limit: usize) -> Vec<Event>;
    fn feed(&self) -> SourceFeed;
}
