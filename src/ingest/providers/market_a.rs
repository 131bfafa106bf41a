// src/ingest/providers/market_a.rs
//! Feed A: activity endpoint with full metadata (rank, rarity, transaction ids).
//! Also serves per-item rank lookups for the enricher.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::ingest::enrich::RankLookup;
use crate::ingest::normalize_display_name;
use crate::ingest::types::{Event, EventClass, FeedAdapter, RankInfo, SourceFeed};

#[derive(Debug, Deserialize)]
struct ActivityPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Activity {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    collection: String,
    serial: u64,
    #[serde(default)]
    name: Option<String>,
    price: Option<u64>,
    #[serde(default)]
    currency: Option<String>,
    seller: Option<String>,
    buyer: Option<String>,
    image: Option<String>,
    rank: Option<u32>,
    rarity: Option<f64>,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct ItemRank {
    rank: Option<u32>,
    rarity: Option<f64>,
}

fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    let dt = OffsetDateTime::parse(ts, &Rfc3339).ok()?;
    let millis = i64::try_from(dt.unix_timestamp_nanos() / 1_000_000).ok()?;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

pub struct MarketAFeed {
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        base_url: String,
        token: String,
        client: reqwest::Client,
    },
}

impl MarketAFeed {
    pub fn from_fixture(body: &str) -> Self {
        Self {
            mode: Mode::Fixture(body.to_string()),
        }
    }

    pub fn from_url(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("collectible-notifier/0.1")
            .timeout(timeout)
            .build()
            .context("building market_a http client")?;
        Ok(Self {
            mode: Mode::Http {
                base_url: base_url.trim_end_matches('/').to_string(),
                token: token.to_string(),
                client,
            },
        })
    }

    /// Parse an activity page. Records that are not a completed sale or a new
    /// listing are dropped here; malformed records are skipped individually.
    pub fn parse_page(body: &str) -> Result<Vec<Event>> {
        let t0 = std::time::Instant::now();
        let page: ActivityPage = serde_json::from_str(body).context("parsing market_a activity")?;

        let mut out = Vec::with_capacity(page.items.len());
        for raw in page.items {
            let act: Activity = match serde_json::from_value(raw.clone()) {
                Ok(a) => a,
                Err(e) => {
                    tracing::debug!(target: "ingest", error = %e, "market_a: skipping malformed record");
                    continue;
                }
            };
            if let Some(ev) = normalize(act, raw) {
                out.push(ev);
            }
        }

        histogram!("ingest_parse_ms", "feed" => "market_a").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("ingest_events_total", "feed" => "market_a").increment(out.len() as u64);
        Ok(out)
    }

    async fn try_fetch(&self, limit: usize) -> Result<Vec<Event>> {
        match &self.mode {
            Mode::Fixture(body) => Self::parse_page(body),
            Mode::Http {
                base_url,
                token,
                client,
            } => {
                let body = client
                    .get(format!("{base_url}/api/activity"))
                    .query(&[("limit", limit)])
                    .bearer_auth(token)
                    .send()
                    .await
                    .context("market_a get activity")?
                    .error_for_status()
                    .context("market_a non-2xx")?
                    .text()
                    .await
                    .context("market_a .text()")?;
                Self::parse_page(&body)
            }
        }
    }
}

fn normalize(act: Activity, raw: serde_json::Value) -> Option<Event> {
    let event_class = match act.kind.to_ascii_lowercase().as_str() {
        "sale" => EventClass::Sale,
        "listing" => EventClass::Listing,
        // price changes, delists, mints: not a state change we notify about
        _ => return None,
    };
    let occurred_at = parse_rfc3339(&act.ts)?;
    let price_minor = act.price?;
    let seller = act.seller?;

    // a sale without a buyer is not a completed sale
    if event_class == EventClass::Sale && act.buyer.is_none() {
        return None;
    }

    let rank_info = match (act.rank, act.rarity) {
        (Some(rank), Some(rarity)) => Some(RankInfo { rank, rarity }),
        _ => None,
    };

    Some(Event {
        display_name: normalize_display_name(act.name.as_deref().unwrap_or(&act.collection)),
        collection_id: act.collection,
        serial_number: act.serial,
        event_class,
        source_feed: SourceFeed::A,
        occurred_at,
        source_ref: act.id,
        price_minor,
        price_currency: act.currency.unwrap_or_else(|| "TON".to_string()),
        counterparty_from: seller,
        counterparty_to: match event_class {
            EventClass::Sale => act.buyer,
            EventClass::Listing => None,
        },
        image_reference: act.image,
        rank_info,
        raw_source_payload: raw,
    })
}

#[async_trait]
impl FeedAdapter for MarketAFeed {
    async fn fetch(&self, limit: usize) -> Vec<Event> {
        match self.try_fetch(limit).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "ingest", error = ?e, feed = "market_a", "feed fetch failed");
                counter!("feed_errors_total", "feed" => "market_a").increment(1);
                Vec::new()
            }
        }
    }

    fn feed(&self) -> SourceFeed {
        SourceFeed::A
    }
}

#[async_trait]
impl RankLookup for MarketAFeed {
    async fn lookup_rank(&self, collection_id: &str, serial_number: u64) -> Result<Option<RankInfo>> {
        let body = match &self.mode {
            Mode::Fixture(body) => {
                // fixture mode answers from the activity page itself
                let events = Self::parse_page(body)?;
                return Ok(events
                    .into_iter()
                    .filter(|e| e.collection_id == collection_id && e.serial_number == serial_number)
                    .find_map(|e| e.rank_info));
            }
            Mode::Http {
                base_url,
                token,
                client,
            } => {
                let resp = client
                    .get(format!("{base_url}/api/items/{collection_id}/{serial_number}"))
                    .bearer_auth(token)
                    .send()
                    .await
                    .context("market_a get item")?;
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                resp.error_for_status()
                    .context("market_a item non-2xx")?
                    .text()
                    .await
                    .context("market_a item .text()")?
            }
        };

        let item: ItemRank = serde_json::from_str(&body).context("parsing market_a item")?;
        match (item.rank, item.rarity) {
            (Some(rank), Some(rarity)) if (0.0..=1.0).contains(&rarity) => {
                Ok(Some(RankInfo { rank, rarity }))
            }
            (Some(_), Some(rarity)) => Err(anyhow!("market_a rarity out of range: {rarity}")),
            _ => Ok(None),
        }
    }
}
