// src/ledger/mod.rs
//! Idempotency ledger: persisted set of delivered event identities, the dedupe
//! keys they claimed, and one watermark per event class.
//!
//! An event counts as already handled when its identity OR its dedupe key is
//! present: a copy of a delivered sale that the other feed reports a few ticks
//! later carries a different identity but the same key.
//!
//! The uniqueness of `record` is the only concurrency guard in the pipeline; a
//! duplicate insert is reported as `AlreadyExists`, never as an error.

pub mod file;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::ingest::types::{DedupeKey, EventClass, IdentityId};

pub use file::FileLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    AlreadyExists,
}

#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    async fn exists(&self, id: &IdentityId, key: &DedupeKey) -> Result<bool>;
    async fn record(&self, id: &IdentityId, key: &DedupeKey, collection_id: &str) -> Result<RecordOutcome>;
    async fn watermark(&self, class: EventClass) -> Result<Option<DateTime<Utc>>>;
    /// Callers only move watermarks forward; stores ignore attempts to lower them.
    async fn set_watermark(&self, class: EventClass, at: DateTime<Utc>) -> Result<()>;
    /// Delete entries recorded before `now - age`. Returns the number removed.
    async fn prune_older_than(&self, age: Duration) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub collection_id: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Watermarks {
    pub sale: Option<DateTime<Utc>>,
    pub listing: Option<DateTime<Utc>>,
}

impl Watermarks {
    pub fn get(&self, class: EventClass) -> Option<DateTime<Utc>> {
        match class {
            EventClass::Sale => self.sale,
            EventClass::Listing => self.listing,
        }
    }

    /// Monotonic update. Returns true if the stored value moved.
    pub fn advance(&mut self, class: EventClass, at: DateTime<Utc>) -> bool {
        let slot = match class {
            EventClass::Sale => &mut self.sale,
            EventClass::Listing => &mut self.listing,
        };
        if matches!(*slot, Some(cur) if cur >= at) {
            return false;
        }
        *slot = Some(at);
        true
    }
}

/// Serializable ledger contents shared by the in-memory and file stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    #[serde(default)]
    pub entries: HashMap<String, LedgerEntry>,
    /// Dedupe key -> identity that claimed it.
    #[serde(default)]
    pub claimed_keys: HashMap<String, String>,
    #[serde(default)]
    pub watermarks: Watermarks,
}

impl LedgerState {
    pub(crate) fn contains(&self, id: &str, key: &str) -> bool {
        self.entries.contains_key(id) || self.claimed_keys.contains_key(key)
    }

    pub(crate) fn insert(&mut self, id: &str, key: &str, collection_id: &str, now: DateTime<Utc>) -> RecordOutcome {
        if self.contains(id, key) {
            return RecordOutcome::AlreadyExists;
        }
        self.entries.insert(
            id.to_string(),
            LedgerEntry {
                collection_id: collection_id.to_string(),
                recorded_at: now,
            },
        );
        self.claimed_keys.insert(key.to_string(), id.to_string());
        RecordOutcome::Inserted
    }

    /// Undo an `insert` whose persistence failed.
    pub(crate) fn remove(&mut self, id: &str, key: &str) {
        self.entries.remove(id);
        if self.claimed_keys.get(key).is_some_and(|owner| owner == id) {
            self.claimed_keys.remove(key);
        }
    }

    pub(crate) fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.recorded_at >= cutoff);
        let entries = &self.entries;
        self.claimed_keys.retain(|_, owner| entries.contains_key(owner));
        before - self.entries.len()
    }
}

/// Non-persistent ledger; same contract as `FileLedger`.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("ledger mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl Ledger for MemoryLedger {
    async fn exists(&self, id: &IdentityId, key: &DedupeKey) -> Result<bool> {
        let s = self.state.lock().expect("ledger mutex poisoned");
        Ok(s.contains(id.as_str(), &key.ledger_key()))
    }

    async fn record(&self, id: &IdentityId, key: &DedupeKey, collection_id: &str) -> Result<RecordOutcome> {
        let mut s = self.state.lock().expect("ledger mutex poisoned");
        Ok(s.insert(id.as_str(), &key.ledger_key(), collection_id, Utc::now()))
    }

    async fn watermark(&self, class: EventClass) -> Result<Option<DateTime<Utc>>> {
        let s = self.state.lock().expect("ledger mutex poisoned");
        Ok(s.watermarks.get(class))
    }

    async fn set_watermark(&self, class: EventClass, at: DateTime<Utc>) -> Result<()> {
        let mut s = self.state.lock().expect("ledger mutex poisoned");
        s.watermarks.advance(class, at);
        Ok(())
    }

    async fn prune_older_than(&self, age: Duration) -> Result<usize> {
        let mut s = self.state.lock().expect("ledger mutex poisoned");
        Ok(s.prune(Utc::now() - age))
    }
}

/// Periodic retention sweep. Storage hygiene only; correctness rests on the
/// watermark and freshness window.
pub fn spawn_prune_task(
    ledger: Arc<dyn Ledger>,
    retention: Duration,
    every: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match ledger.prune_older_than(retention).await {
                Ok(0) => tracing::trace!(target: "ledger", "prune: nothing to do"),
                Ok(n) => tracing::info!(target: "ledger", removed = n, "pruned ledger entries"),
                Err(e) => tracing::warn!(target: "ledger", error = ?e, "ledger prune failed"),
            }
        }
    })
}
