pub mod dispatch;
pub mod telegram;

use anyhow::Result;
use serde::Serialize;

use crate::ingest::types::{Event, EventClass};
use crate::subscriptions::ChannelRef;

pub use dispatch::{DispatchReport, Dispatcher};

/// Pre-built message handed to the delivery platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub text: String,
    pub image_url: Option<String>,
    pub class: EventClass,
}

/// Platform handle for a delivered message, used for the acknowledgment reaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub channel: ChannelRef,
    pub message_id: i64,
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, channel: &ChannelRef, msg: &Notification) -> Result<DeliveryReceipt>;
    /// Best-effort reaction on a delivered message.
    async fn acknowledge(&self, receipt: &DeliveryReceipt) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Render minor units as a major-unit decimal with trailing zeros trimmed.
pub fn format_price(minor: u64, decimals: u32) -> String {
    let scale = 10u64.pow(decimals);
    let whole = minor / scale;
    let frac = minor % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0width$}", frac, width = decimals as usize);
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

fn short_addr(s: &str) -> String {
    let n = s.chars().count();
    if n <= 12 {
        return s.to_string();
    }
    let head: String = s.chars().take(4).collect();
    let tail: String = s.chars().skip(n - 4).collect();
    format!("{head}…{tail}")
}

/// Build the chat message for an event.
pub fn format_notification(ev: &Event) -> Notification {
    let headline = match ev.event_class {
        EventClass::Sale => "Sold",
        EventClass::Listing => "Listed",
    };

    let mut lines = vec![
        format!("*{headline}:* {} #{}", ev.display_name, ev.serial_number),
        format!(
            "*Price:* {} {}",
            format_price(ev.price_minor, 9),
            ev.price_currency
        ),
    ];
    if let Some(r) = ev.rank_info {
        lines.push(format!("*Rank:* {} ({:.2}%)", r.rank, r.rarity * 100.0));
    }
    match &ev.counterparty_to {
        Some(to) => lines.push(format!(
            "{} → {}",
            short_addr(&ev.counterparty_from),
            short_addr(to)
        )),
        None => lines.push(format!("Seller: {}", short_addr(&ev.counterparty_from))),
    }

    Notification {
        text: lines.join("\n"),
        image_url: ev.image_reference.clone(),
        class: ev.event_class,
    }
}
