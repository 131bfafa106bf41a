//! # Subscriptions
//!
//! Destinations (chat channels) and the collections they track.
//!
//! - Loaded from a read-mostly store (TOML or JSON file by default).
//! - Cached in memory and refreshed on a fixed cadence by the scheduler.
//! - `resolve` is a pure filter over the cached list: a destination that does
//!   not track the collection never receives the event.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::ingest::types::EventClass;

pub const ENV_SUBSCRIPTIONS_PATH: &str = "SUBSCRIPTIONS_PATH";

/// Opaque reference to a chat channel (chat id, optionally `chat_id/thread_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelRef(pub String);

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(alias = "id")]
    pub destination_id: String,
    pub primary_channel: ChannelRef,
    /// Used only for listings.
    #[serde(default)]
    pub secondary_channel: Option<ChannelRef>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, alias = "collections")]
    pub tracked_collections: BTreeSet<String>,
}

impl Destination {
    pub fn tracks(&self, collection_id: &str) -> bool {
        self.tracked_collections.contains(collection_id)
    }

    pub fn channel_for(&self, class: EventClass) -> &ChannelRef {
        match class {
            EventClass::Sale => &self.primary_channel,
            EventClass::Listing => self.secondary_channel.as_ref().unwrap_or(&self.primary_channel),
        }
    }
}

/// One delivery target for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination_id: String,
    pub channel: ChannelRef,
}

#[async_trait::async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn load(&self) -> Result<Vec<Destination>>;
}

/// Reads destinations from a file. Lookup order when no explicit path is given:
/// 1) $SUBSCRIPTIONS_PATH
/// 2) config/subscriptions.toml
/// 3) config/subscriptions.json
#[derive(Debug, Clone, Default)]
pub struct FileSubscriptionStore {
    path: Option<PathBuf>,
}

impl FileSubscriptionStore {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn from_env() -> Self {
        Self::default()
    }

    fn resolve_path(&self) -> Result<Option<PathBuf>> {
        if let Some(p) = &self.path {
            return Ok(Some(p.clone()));
        }
        if let Ok(p) = std::env::var(ENV_SUBSCRIPTIONS_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Ok(Some(pb));
            }
            return Err(anyhow!("SUBSCRIPTIONS_PATH points to non-existent path"));
        }
        for candidate in ["config/subscriptions.toml", "config/subscriptions.json"] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Ok(Some(pb));
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl SubscriptionStore for FileSubscriptionStore {
    async fn load(&self) -> Result<Vec<Destination>> {
        match self.resolve_path()? {
            Some(path) => load_destinations_from(&path).await,
            None => Ok(Vec::new()),
        }
    }
}

pub async fn load_destinations_from(path: &Path) -> Result<Vec<Destination>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading subscriptions from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_destinations(&content, &ext)
}

pub fn parse_destinations(s: &str, hint_ext: &str) -> Result<Vec<Destination>> {
    #[derive(Deserialize)]
    struct TomlFile {
        #[serde(default)]
        destinations: Vec<Destination>,
    }

    let parsed = if hint_ext == "toml" {
        toml::from_str::<TomlFile>(s)
            .map(|f| f.destinations)
            .context("parsing subscriptions toml")?
    } else if hint_ext == "json" {
        serde_json::from_str::<Vec<Destination>>(s).context("parsing subscriptions json")?
    } else if let Ok(v) = serde_json::from_str::<Vec<Destination>>(s) {
        v
    } else {
        toml::from_str::<TomlFile>(s)
            .map(|f| f.destinations)
            .map_err(|_| anyhow!("unsupported subscriptions format"))?
    };
    Ok(clean(parsed))
}

fn clean(items: Vec<Destination>) -> Vec<Destination> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(items.len());
    for mut d in items {
        d.destination_id = d.destination_id.trim().to_string();
        if d.destination_id.is_empty() || !seen.insert(d.destination_id.clone()) {
            continue;
        }
        d.tracked_collections = d
            .tracked_collections
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        out.push(d);
    }
    out
}

/// In-memory store, handy for wiring and tests.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    inner: RwLock<Vec<Destination>>,
}

impl MemorySubscriptionStore {
    pub fn new(destinations: Vec<Destination>) -> Self {
        Self {
            inner: RwLock::new(destinations),
        }
    }

    pub fn replace(&self, destinations: Vec<Destination>) {
        *self.inner.write().expect("rwlock poisoned") = destinations;
    }
}

#[async_trait::async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn load(&self) -> Result<Vec<Destination>> {
        Ok(self.inner.read().expect("rwlock poisoned").clone())
    }
}

pub struct SubscriptionResolver {
    store: Arc<dyn SubscriptionStore>,
    /// Freshness marker: a single entry that expires after the refresh interval.
    fresh: Cache<(), Arc<Vec<Destination>>>,
    /// Last successfully loaded list; keeps serving while refreshes fail.
    last_good: RwLock<Arc<Vec<Destination>>>,
}

impl SubscriptionResolver {
    pub fn new(store: Arc<dyn SubscriptionStore>, refresh_every: Duration) -> Self {
        Self {
            store,
            fresh: Cache::builder()
                .time_to_live(refresh_every)
                .max_capacity(1)
                .build(),
            last_good: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Reload from the store unconditionally. Returns the destination count.
    pub async fn refresh(&self) -> Result<usize> {
        let fresh = Arc::new(self.store.load().await?);
        let n = fresh.len();
        *self.last_good.write().expect("rwlock poisoned") = fresh.clone();
        self.fresh.insert((), fresh).await;
        Ok(n)
    }

    /// Reload if the cached list is older than the refresh interval. On failure
    /// the stale list keeps serving.
    pub async fn refresh_if_stale(&self) {
        if self.fresh.get(&()).await.is_some() {
            return;
        }
        match self.refresh().await {
            Ok(n) => tracing::debug!(target: "pipeline", destinations = n, "subscriptions refreshed"),
            Err(e) => tracing::warn!(target: "pipeline", error = ?e, "subscription refresh failed, keeping cached list"),
        }
    }

    pub fn destinations(&self) -> Arc<Vec<Destination>> {
        self.last_good.read().expect("rwlock poisoned").clone()
    }

    pub fn resolve(&self, collection_id: &str, class: EventClass) -> Vec<Route> {
        self.destinations()
            .iter()
            .filter(|d| d.enabled && d.tracks(collection_id))
            .map(|d| Route {
                destination_id: d.destination_id.clone(),
                channel: d.channel_for(class).clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(id: &str, secondary: Option<&str>, enabled: bool, cols: &[&str]) -> Destination {
        Destination {
            destination_id: id.into(),
            primary_channel: ChannelRef(format!("{id}-main")),
            secondary_channel: secondary.map(|s| ChannelRef(s.into())),
            enabled,
            tracked_collections: cols.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn resolve_filters_and_picks_channel() {
        let store = Arc::new(MemorySubscriptionStore::new(vec![
            dest("d1", Some("d1-listings"), true, &["T1"]),
            dest("d2", None, true, &["T1", "T2"]),
            dest("d3", None, false, &["T1"]),
            dest("d4", None, true, &["T2"]),
        ]));
        let r = SubscriptionResolver::new(store, Duration::from_secs(30));
        assert!(r.resolve("T1", EventClass::Sale).is_empty());
        r.refresh().await.unwrap();

        let sales = r.resolve("T1", EventClass::Sale);
        assert_eq!(
            sales.iter().map(|x| x.channel.0.as_str()).collect::<Vec<_>>(),
            vec!["d1-main", "d2-main"]
        );

        let listings = r.resolve("T1", EventClass::Listing);
        assert_eq!(
            listings.iter().map(|x| x.channel.0.as_str()).collect::<Vec<_>>(),
            vec!["d1-listings", "d2-main"]
        );

        assert!(r.resolve("T9", EventClass::Sale).is_empty());
    }

    #[tokio::test]
    async fn stale_list_is_reloaded() {
        let store = Arc::new(MemorySubscriptionStore::new(vec![dest("d1", None, true, &["T1"])]));
        let r = SubscriptionResolver::new(store.clone(), Duration::from_millis(20));
        r.refresh_if_stale().await;
        assert_eq!(r.destinations().len(), 1);

        // still fresh: the replacement is not picked up yet
        store.replace(vec![]);
        r.refresh_if_stale().await;
        assert_eq!(r.resolve("T1", EventClass::Sale).len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        r.refresh_if_stale().await;
        assert!(r.resolve("T1", EventClass::Sale).is_empty());
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl SubscriptionStore for FailingStore {
        async fn load(&self) -> Result<Vec<Destination>> {
            Err(anyhow!("store offline"))
        }
    }

    #[tokio::test]
    async fn failed_refresh_keeps_serving_last_good_list() {
        let r = SubscriptionResolver::new(Arc::new(FailingStore), Duration::from_secs(30));
        *r.last_good.write().unwrap() = Arc::new(vec![dest("d1", None, true, &["T1"])]);
        r.refresh_if_stale().await;
        assert_eq!(r.resolve("T1", EventClass::Sale).len(), 1);
    }

    #[test]
    fn parse_toml_and_json() {
        let toml = r#"
[[destinations]]
id = " chat-1 "
primary_channel = "-1001"
secondary_channel = "-1002"
collections = [" T1 ", "", "T2"]

[[destinations]]
id = "chat-2"
primary_channel = "-2001"
enabled = false
"#;
        let v = parse_destinations(toml, "toml").unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].destination_id, "chat-1");
        assert!(v[0].tracks("T1") && v[0].tracks("T2"));
        assert_eq!(v[0].tracked_collections.len(), 2);
        assert!(!v[1].enabled);

        let json = r#"[{"destination_id":"a","primary_channel":"1","tracked_collections":["T1"]},
                       {"destination_id":"a","primary_channel":"2"}]"#;
        let vj = parse_destinations(json, "").unwrap();
        assert_eq!(vj.len(), 1);
        assert!(vj[0].enabled);
    }
}
