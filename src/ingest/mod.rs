// src/ingest/mod.rs
pub mod dedup;
pub mod enrich;
pub mod filter;
pub mod providers;
pub mod types;

use crate::ingest::types::{Event, FeedAdapter};
use metrics::{describe_counter, describe_histogram};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_events_total", "Events normalized from feeds.");
        describe_counter!("feed_errors_total", "Feed fetch/parse errors.");
        describe_counter!(
            "ingest_stale_total",
            "Events dropped by the watermark or freshness window."
        );
        describe_counter!("ingest_dedup_total", "Events merged by the dedupe key.");
        describe_counter!("enrich_misses_total", "Rank lookups without a result.");
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
    });
}

/// Normalize a display name: decode entities, strip tags, collapse whitespace.
pub fn normalize_display_name(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > 128 {
        out = out.chars().take(128).collect();
    }
    out
}

/// Convert a decimal string (`"12.5"`) into integer minor units without going
/// through floating point. Excess fractional digits are truncated.
pub fn parse_decimal_minor(s: &str, decimals: u32) -> Option<u64> {
    let s = s.trim();
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let scale = 10u64.checked_pow(decimals)?;
    let whole: u64 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };

    let mut frac = String::with_capacity(decimals as usize);
    frac.extend(frac_part.chars().take(decimals as usize));
    while frac.len() < decimals as usize {
        frac.push('0');
    }
    let frac: u64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };

    whole.checked_mul(scale)?.checked_add(frac)
}

/// Fetch both feeds concurrently. Output is always A's events followed by B's,
/// so first-seen order downstream is stable.
pub async fn fetch_all(
    feed_a: &dyn FeedAdapter,
    feed_b: &dyn FeedAdapter,
    limit: usize,
) -> (Vec<Event>, Vec<Event>) {
    ensure_metrics_described();
    tokio::join!(feed_a.fetch(limit), feed_b.fetch(limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_is_cleaned() {
        assert_eq!(normalize_display_name("  <b>Plush&nbsp;&nbsp;Pepe</b> "), "Plush Pepe");
        assert_eq!(normalize_display_name("Tom &amp; Jerry"), "Tom & Jerry");
    }

    #[test]
    fn decimal_minor_units() {
        assert_eq!(parse_decimal_minor("12.5", 9), Some(12_500_000_000));
        assert_eq!(parse_decimal_minor("600", 0), Some(600));
        assert_eq!(parse_decimal_minor(".25", 2), Some(25));
        assert_eq!(parse_decimal_minor("1.999", 2), Some(199));
        assert_eq!(parse_decimal_minor("-1", 2), None);
        assert_eq!(parse_decimal_minor("abc", 2), None);
        assert_eq!(parse_decimal_minor("", 2), None);
    }
}
