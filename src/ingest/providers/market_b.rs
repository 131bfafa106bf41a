// src/ingest/providers/market_b.rs
//! Feed B: market history endpoint. Thin records: no rank metadata, serial
//! sometimes only present inside the display name, prices as decimal strings.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;

use crate::ingest::types::{Event, EventClass, FeedAdapter, SourceFeed};
use crate::ingest::{normalize_display_name, parse_decimal_minor};

/// Minor units per major unit for feed B amounts.
const AMOUNT_DECIMALS: u32 = 9;

#[derive(Debug, Deserialize)]
struct HistoryPage {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct HistoryRecord {
    listing_id: Option<String>,
    tx_hash: Option<String>,
    collection_id: String,
    gift_name: String,
    number: Option<u64>,
    amount: Option<String>,
    currency: Option<String>,
    from_address: Option<String>,
    to_address: Option<String>,
    created_at: i64,
    photo_url: Option<String>,
}

/// Pull the serial out of names like `"Plush Pepe #1234"`.
pub fn serial_from_name(name: &str) -> Option<u64> {
    static RE_SERIAL: OnceCell<Regex> = OnceCell::new();
    let re = RE_SERIAL.get_or_init(|| Regex::new(r"#\s*(\d+)\s*$").expect("serial regex"));
    re.captures(name.trim())
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Display name with the trailing `#serial` removed.
fn strip_serial(name: &str) -> String {
    static RE_TAIL: OnceCell<Regex> = OnceCell::new();
    let re = RE_TAIL.get_or_init(|| Regex::new(r"\s*#\s*\d+\s*$").expect("serial tail regex"));
    re.replace(name.trim(), "").to_string()
}

pub struct MarketBFeed {
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        base_url: String,
        api_key: String,
        client: reqwest::Client,
    },
}

impl MarketBFeed {
    pub fn from_fixture(body: &str) -> Self {
        Self {
            mode: Mode::Fixture(body.to_string()),
        }
    }

    pub fn from_url(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("collectible-notifier/0.1")
            .timeout(timeout)
            .build()
            .context("building market_b http client")?;
        Ok(Self {
            mode: Mode::Http {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key: api_key.to_string(),
                client,
            },
        })
    }

    pub fn parse_page(body: &str) -> Result<Vec<Event>> {
        let t0 = std::time::Instant::now();
        let page: HistoryPage = serde_json::from_str(body).context("parsing market_b history")?;

        let mut out = Vec::with_capacity(page.data.len());
        for raw in page.data {
            let rec: HistoryRecord = match serde_json::from_value(raw.clone()) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(target: "ingest", error = %e, "market_b: skipping malformed record");
                    continue;
                }
            };
            if let Some(ev) = normalize(rec, raw) {
                out.push(ev);
            }
        }

        histogram!("ingest_parse_ms", "feed" => "market_b").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("ingest_events_total", "feed" => "market_b").increment(out.len() as u64);
        Ok(out)
    }

    async fn try_fetch(&self, limit: usize) -> Result<Vec<Event>> {
        match &self.mode {
            Mode::Fixture(body) => Self::parse_page(body),
            Mode::Http {
                base_url,
                api_key,
                client,
            } => {
                let body = client
                    .get(format!("{base_url}/v1/market/history"))
                    .query(&[("limit", limit)])
                    .header("X-Api-Key", api_key)
                    .send()
                    .await
                    .context("market_b get history")?
                    .error_for_status()
                    .context("market_b non-2xx")?
                    .text()
                    .await
                    .context("market_b .text()")?;
                Self::parse_page(&body)
            }
        }
    }
}

fn normalize(rec: HistoryRecord, raw: serde_json::Value) -> Option<Event> {
    // no asking price at all: not a sale, not a listing
    let price_minor = parse_decimal_minor(rec.amount.as_deref()?, AMOUNT_DECIMALS)?;
    let seller = rec.from_address.filter(|s| !s.trim().is_empty())?;
    let buyer = rec.to_address.filter(|s| !s.trim().is_empty());

    let (event_class, source_ref) = match buyer {
        Some(_) => (EventClass::Sale, rec.tx_hash.or(rec.listing_id)),
        None => (EventClass::Listing, rec.listing_id),
    };

    let serial_number = rec.number.or_else(|| serial_from_name(&rec.gift_name))?;
    let occurred_at = DateTime::<Utc>::from_timestamp_millis(rec.created_at)?;

    Some(Event {
        collection_id: rec.collection_id,
        serial_number,
        event_class,
        source_feed: SourceFeed::B,
        occurred_at,
        source_ref,
        price_minor,
        price_currency: rec.currency.unwrap_or_else(|| "TON".to_string()),
        counterparty_from: seller,
        counterparty_to: buyer,
        display_name: normalize_display_name(&strip_serial(&rec.gift_name)),
        image_reference: rec.photo_url,
        rank_info: None,
        raw_source_payload: raw,
    })
}

#[async_trait]
impl FeedAdapter for MarketBFeed {
    async fn fetch(&self, limit: usize) -> Vec<Event> {
        match self.try_fetch(limit).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "ingest", error = ?e, feed = "market_b", "feed fetch failed");
                counter!("feed_errors_total", "feed" => "market_b").increment(1);
                Vec::new()
            }
        }
    }

    fn feed(&self) -> SourceFeed {
        SourceFeed::B
    }
}
