// src/config/pipeline.rs
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::ingest::filter::FreshnessWindows;
use crate::ledger::file::DEFAULT_LEDGER_PATH;

/// When an event counts as handled after its dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerPolicy {
    /// Record after the destination loop regardless of outcomes.
    Always,
    /// Record only if at least one destination took the message (or there
    /// were no destinations at all).
    RequireDelivery,
}

impl std::str::FromStr for LedgerPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(LedgerPolicy::Always),
            "require_delivery" | "require-delivery" => Ok(LedgerPolicy::RequireDelivery),
            other => Err(anyhow!("unknown ledger policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedEndpoint {
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub tick_interval: Duration,
    pub subscription_refresh: Duration,
    pub fetch_limit: usize,
    pub windows: FreshnessWindows,
    pub delivery_delay: Duration,
    pub ledger_retention: chrono::Duration,
    pub prune_interval: Duration,
    pub http_timeout: Duration,
    pub rank_cache_ttl: Duration,
    pub ledger_policy: LedgerPolicy,
    pub ledger_path: PathBuf,
    pub bind_addr: String,

    pub feed_a: Option<FeedEndpoint>,
    pub feed_b: Option<FeedEndpoint>,
    pub bot_token: Option<String>,
    pub bot_api_base: Option<String>,
    pub bot_reaction: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            subscription_refresh: Duration::from_secs(30),
            fetch_limit: 50,
            windows: FreshnessWindows::default(),
            delivery_delay: Duration::from_millis(1000),
            ledger_retention: chrono::Duration::days(3),
            prune_interval: Duration::from_secs(3600),
            http_timeout: Duration::from_secs(12),
            rank_cache_ttl: Duration::from_secs(600),
            ledger_policy: LedgerPolicy::Always,
            ledger_path: PathBuf::from(DEFAULT_LEDGER_PATH),
            bind_addr: "0.0.0.0:8080".to_string(),
            feed_a: None,
            feed_b: None,
            bot_token: None,
            bot_api_base: None,
            bot_reaction: None,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{key}={raw}: {e}")),
        None => Ok(None),
    }
}

fn seconds(key: &str, s: i64) -> Result<chrono::Duration> {
    chrono::Duration::try_seconds(s).ok_or_else(|| anyhow!("{key}={s}: out of range"))
}

fn endpoint(url_key: &str, token_key: &str) -> Option<FeedEndpoint> {
    env_opt(url_key).map(|base_url| FeedEndpoint {
        base_url,
        token: env_opt(token_key).unwrap_or_default(),
    })
}

impl PipelineConfig {
    /// Build from environment variables; unset knobs keep their defaults.
    /// Malformed values are an error rather than a silent fallback.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(s) = env_parse::<u64>("TICK_INTERVAL_SECS")? {
            cfg.tick_interval = Duration::from_secs(s.max(1));
        }
        if let Some(s) = env_parse::<u64>("SUBSCRIPTION_REFRESH_SECS")? {
            cfg.subscription_refresh = Duration::from_secs(s);
        }
        if let Some(n) = env_parse::<usize>("FETCH_LIMIT")? {
            cfg.fetch_limit = n.clamp(1, 500);
        }
        if let Some(s) = env_parse::<i64>("SALE_WINDOW_SECS")? {
            cfg.windows.sale = seconds("SALE_WINDOW_SECS", s.max(0))?;
        }
        if let Some(s) = env_parse::<i64>("LISTING_WINDOW_SECS")? {
            cfg.windows.listing = seconds("LISTING_WINDOW_SECS", s.max(0))?;
        }
        if let Some(ms) = env_parse::<u64>("DELIVERY_DELAY_MS")? {
            cfg.delivery_delay = Duration::from_millis(ms);
        }
        if let Some(h) = env_parse::<i64>("LEDGER_RETENTION_HOURS")? {
            cfg.ledger_retention = chrono::Duration::try_hours(h.max(1))
                .ok_or_else(|| anyhow!("LEDGER_RETENTION_HOURS={h}: out of range"))?;
        }
        if let Some(s) = env_parse::<u64>("PRUNE_INTERVAL_SECS")? {
            cfg.prune_interval = Duration::from_secs(s.max(1));
        }
        if let Some(s) = env_parse::<u64>("HTTP_TIMEOUT_SECS")? {
            cfg.http_timeout = Duration::from_secs(s.max(1));
        }
        if let Some(s) = env_parse::<u64>("RANK_CACHE_TTL_SECS")? {
            cfg.rank_cache_ttl = Duration::from_secs(s);
        }
        if let Some(p) = env_parse::<LedgerPolicy>("LEDGER_POLICY")? {
            cfg.ledger_policy = p;
        }
        if let Some(p) = env_opt("LEDGER_PATH") {
            cfg.ledger_path = PathBuf::from(p);
        }
        if let Some(b) = env_opt("BIND_ADDR") {
            cfg.bind_addr = b;
        }

        cfg.feed_a = endpoint("FEED_A_URL", "FEED_A_TOKEN");
        cfg.feed_b = endpoint("FEED_B_URL", "FEED_B_TOKEN");
        cfg.bot_token = env_opt("BOT_TOKEN");
        cfg.bot_api_base = env_opt("BOT_API_BASE");
        cfg.bot_reaction = env_opt("BOT_REACTION");

        Ok(cfg)
    }

    /// Everything the binary cannot run without.
    pub fn require_endpoints(&self) -> Result<(&FeedEndpoint, &FeedEndpoint, &str)> {
        let a = self.feed_a.as_ref().context("FEED_A_URL missing")?;
        let b = self.feed_b.as_ref().context("FEED_B_URL missing")?;
        let token = self.bot_token.as_deref().context("BOT_TOKEN missing")?;
        Ok((a, b, token))
    }
}
