// src/ingest/dedup.rs
use std::collections::HashSet;

use crate::ingest::types::Event;

/// Collapse reports of the same real-world event. First-seen copy wins; the
/// caller feeds A's events before B's so the survivor is deterministic.
/// Returns (kept, dropped_count).
pub fn dedupe(events: Vec<Event>) -> (Vec<Event>, usize) {
    let mut seen = HashSet::with_capacity(events.len());
    let mut kept = Vec::with_capacity(events.len());
    let mut dropped = 0usize;

    for ev in events {
        let key = ev.dedupe_key();
        if seen.contains(&key) {
            tracing::debug!(
                target: "ingest",
                collection = %ev.collection_id,
                serial = ev.serial_number,
                class = %ev.event_class,
                feed = ev.source_feed.as_str(),
                occurred_at = %ev.occurred_at,
                "dropping duplicate"
            );
            dropped += 1;
            continue;
        }
        seen.insert(key);
        kept.push(ev);
    }

    (kept, dropped)
}
