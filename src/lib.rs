// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod ingest;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod subscriptions;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::ingest::types::{Event, EventClass, FeedAdapter, SourceFeed};
pub use crate::ledger::{Ledger, RecordOutcome};
pub use crate::notify::{Dispatcher, Notifier};
pub use crate::pipeline::{Pipeline, TickReport};
