//! Fan one event out to its resolved routes.
//!
//! Per-destination failures are isolated and tallied; they never stop the loop.
//! A fixed pause between deliveries of the same event keeps us under the
//! platform's rate limits.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;

use super::{format_notification, Notifier};
use crate::ingest::types::Event;
use crate::subscriptions::Route;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub acknowledged: usize,
}

impl DispatchReport {
    /// Routes existed but none of them took the message.
    pub fn undeliverable(&self) -> bool {
        self.attempted > 0 && self.delivered == 0
    }
}

pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    delay: Duration,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, delay: Duration) -> Self {
        Self { notifier, delay }
    }

    pub async fn dispatch(&self, ev: &Event, routes: &[Route]) -> DispatchReport {
        let msg = format_notification(ev);
        let mut report = DispatchReport::default();

        for (i, route) in routes.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            report.attempted += 1;

            match self.notifier.deliver(&route.channel, &msg).await {
                Ok(receipt) => {
                    report.delivered += 1;
                    counter!("dispatch_success_total").increment(1);
                    match self.notifier.acknowledge(&receipt).await {
                        Ok(()) => report.acknowledged += 1,
                        Err(e) => tracing::debug!(
                            target: "pipeline",
                            error = %e,
                            destination = %route.destination_id,
                            "acknowledgment failed"
                        ),
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    counter!("dispatch_failure_total").increment(1);
                    tracing::warn!(
                        target: "pipeline",
                        error = ?e,
                        destination = %route.destination_id,
                        channel = %route.channel,
                        notifier = self.notifier.name(),
                        "delivery failed"
                    );
                }
            }
        }

        report
    }
}
