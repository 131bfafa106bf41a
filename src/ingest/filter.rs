// src/ingest/filter.rs
//! Recency & novelty: an event must be newer than the persisted watermark for
//! its class AND inside the class freshness window. Failing either one is a
//! silent drop, not an error.

use chrono::{DateTime, Duration, Utc};

use crate::ingest::types::{Event, EventClass};

#[derive(Debug, Clone, Copy)]
pub struct FreshnessWindows {
    pub sale: Duration,
    pub listing: Duration,
}

impl Default for FreshnessWindows {
    fn default() -> Self {
        Self {
            sale: Duration::minutes(5),
            listing: Duration::minutes(15),
        }
    }
}

impl FreshnessWindows {
    pub fn for_class(&self, class: EventClass) -> Duration {
        match class {
            EventClass::Sale => self.sale,
            EventClass::Listing => self.listing,
        }
    }
}

pub fn is_novel(
    ev: &Event,
    watermark: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    windows: &FreshnessWindows,
) -> bool {
    let after_watermark = watermark.map_or(true, |wm| ev.occurred_at > wm);
    // a window reaching past the representable range excludes nothing
    let fresh = now
        .checked_sub_signed(windows.for_class(ev.event_class))
        .map_or(true, |floor| ev.occurred_at > floor);
    after_watermark && fresh
}

/// Keep novel events of one class, preserving order. Returns (kept, dropped).
pub fn filter_class(
    events: Vec<Event>,
    class: EventClass,
    watermark: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    windows: &FreshnessWindows,
) -> (Vec<Event>, usize) {
    let mut dropped = 0usize;
    let kept = events
        .into_iter()
        .filter(|ev| ev.event_class == class)
        .filter(|ev| {
            let keep = is_novel(ev, watermark, now, windows);
            if !keep {
                dropped += 1;
            }
            keep
        })
        .collect();
    (kept, dropped)
}
