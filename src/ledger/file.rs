// src/ledger/file.rs
//! File-backed ledger: a JSON snapshot (`ledger.json`) plus an append-only
//! journal of JSON lines (`ledger.journal`) written on every mutation.
//!
//! Opening loads the snapshot, replays the journal on top of it and compacts.
//! Compaction rewrites the snapshot (temp file + rename) and truncates the
//! journal; it also runs on prune and every `COMPACT_EVERY` journal lines.
//! Replay is idempotent, so a crash between rename and truncate is harmless.
//! A mutation whose journal line cannot be written is rolled back in memory
//! and reported as an error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{Ledger, LedgerState, RecordOutcome};
use crate::ingest::types::{DedupeKey, EventClass, IdentityId};

pub const DEFAULT_LEDGER_PATH: &str = "state/ledger.json";

const COMPACT_EVERY: usize = 1_000;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    Record {
        id: String,
        key: String,
        collection_id: String,
        recorded_at: DateTime<Utc>,
    },
    Watermark {
        class: EventClass,
        at: DateTime<Utc>,
    },
}

impl JournalOp {
    fn apply(self, state: &mut LedgerState) {
        match self {
            JournalOp::Record {
                id,
                key,
                collection_id,
                recorded_at,
            } => {
                state.insert(&id, &key, &collection_id, recorded_at);
            }
            JournalOp::Watermark { class, at } => {
                state.watermarks.advance(class, at);
            }
        }
    }
}

struct Inner {
    state: LedgerState,
    /// Lines appended since the last compaction.
    journaled: usize,
    /// A failed append may have left a partial line; compact before the next write.
    torn_tail: bool,
}

pub struct FileLedger {
    path: PathBuf,
    journal: PathBuf,
    inner: Mutex<Inner>,
}

impl FileLedger {
    /// Load the ledger from `path` and its journal; missing files start empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let journal = path.with_extension("journal");

        let mut state: LedgerState = match read_optional(&path).await? {
            Some(s) => serde_json::from_str(&s)
                .with_context(|| format!("parsing ledger {}", path.display()))?,
            None => LedgerState::default(),
        };

        let mut replayed = 0usize;
        let mut had_journal = false;
        if let Some(body) = read_optional(&journal).await? {
            had_journal = !body.is_empty();
            for (n, line) in body.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                match serde_json::from_str::<JournalOp>(line) {
                    Ok(op) => {
                        op.apply(&mut state);
                        replayed += 1;
                    }
                    Err(e) => tracing::warn!(
                        target: "ledger",
                        error = %e,
                        line = n + 1,
                        path = %journal.display(),
                        "skipping malformed journal line"
                    ),
                }
            }
        }

        tracing::info!(
            target: "ledger",
            path = %path.display(),
            entries = state.entries.len(),
            replayed,
            "ledger loaded"
        );

        let ledger = Self {
            path,
            journal,
            inner: Mutex::new(Inner {
                state,
                journaled: replayed,
                torn_tail: false,
            }),
        };
        if had_journal {
            let mut inner = ledger.inner.lock().await;
            ledger.compact(&mut inner).await?;
        }
        Ok(ledger)
    }

    async fn ensure_dir(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    /// Snapshot the in-memory state and truncate the journal.
    async fn compact(&self, inner: &mut Inner) -> Result<()> {
        self.ensure_dir().await?;
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec(&inner.state).context("serializing ledger")?;
        fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        fs::write(&self.journal, b"")
            .await
            .with_context(|| format!("truncating {}", self.journal.display()))?;
        inner.journaled = 0;
        inner.torn_tail = false;
        tracing::debug!(target: "ledger", entries = inner.state.entries.len(), "ledger compacted");
        Ok(())
    }

    /// Make `op` (already applied to `inner.state`) durable.
    async fn persist(&self, inner: &mut Inner, op: &JournalOp) -> Result<()> {
        if inner.torn_tail {
            return self.compact(inner).await;
        }
        if let Err(e) = self.append(op).await {
            inner.torn_tail = true;
            return Err(e);
        }
        inner.journaled += 1;
        if inner.journaled >= COMPACT_EVERY {
            // the line is already durable; a failed compaction only delays the next one
            if let Err(e) = self.compact(inner).await {
                tracing::warn!(target: "ledger", error = ?e, "ledger compaction failed");
            }
        }
        Ok(())
    }

    async fn append(&self, op: &JournalOp) -> Result<()> {
        self.ensure_dir().await?;
        let mut line = serde_json::to_vec(op).context("serializing journal op")?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)
            .await
            .with_context(|| format!("opening {}", self.journal.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to {}", self.journal.display()))?;
        file.flush().await?;
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

#[async_trait::async_trait]
impl Ledger for FileLedger {
    async fn exists(&self, id: &IdentityId, key: &DedupeKey) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.state.contains(id.as_str(), &key.ledger_key()))
    }

    async fn record(&self, id: &IdentityId, key: &DedupeKey, collection_id: &str) -> Result<RecordOutcome> {
        let mut inner = self.inner.lock().await;
        let key = key.ledger_key();
        let now = Utc::now();
        if inner.state.insert(id.as_str(), &key, collection_id, now) == RecordOutcome::AlreadyExists {
            return Ok(RecordOutcome::AlreadyExists);
        }
        let op = JournalOp::Record {
            id: id.as_str().to_string(),
            key: key.clone(),
            collection_id: collection_id.to_string(),
            recorded_at: now,
        };
        if let Err(e) = self.persist(&mut inner, &op).await {
            inner.state.remove(id.as_str(), &key);
            return Err(e);
        }
        Ok(RecordOutcome::Inserted)
    }

    async fn watermark(&self, class: EventClass) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().await.state.watermarks.get(class))
    }

    async fn set_watermark(&self, class: EventClass, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let prev = inner.state.watermarks.clone();
        if !inner.state.watermarks.advance(class, at) {
            return Ok(());
        }
        if let Err(e) = self.persist(&mut inner, &JournalOp::Watermark { class, at }).await {
            inner.state.watermarks = prev;
            return Err(e);
        }
        Ok(())
    }

    async fn prune_older_than(&self, age: Duration) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let before = inner.state.clone();
        let removed = inner.state.prune(Utc::now() - age);
        if removed == 0 {
            return Ok(0);
        }
        if let Err(e) = self.compact(&mut inner).await {
            inner.state = before;
            return Err(e);
        }
        Ok(removed)
    }
}
