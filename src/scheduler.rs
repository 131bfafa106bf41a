// src/scheduler.rs
//! Fixed-cadence driver. Ticks run one at a time inside a single task; if a
//! tick overruns the interval, the missed ticks are skipped rather than run
//! concurrently. A panicking tick is caught and logged, and the loop goes on.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pipeline::{Pipeline, TickReport};

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval: Duration,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
        }
    }
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_ticks_total", "Scheduler ticks started.");
        describe_counter!(
            "pipeline_tick_panics_total",
            "Ticks that panicked and were skipped."
        );
    });
}

/// Last finished tick, shared with the status endpoint.
pub type LastTick = Arc<RwLock<Option<TickReport>>>;

/// Refresh subscriptions if stale, then run one tick in its own task so a
/// panic stays contained. Returns `None` if the tick panicked.
pub async fn tick_once(pipeline: &Arc<Pipeline>) -> Option<TickReport> {
    ensure_metrics_described();
    counter!("pipeline_ticks_total").increment(1);
    pipeline.resolver().refresh_if_stale().await;

    let p = Arc::clone(pipeline);
    match tokio::spawn(async move { p.run_tick().await }).await {
        Ok(report) => Some(report),
        Err(e) => {
            counter!("pipeline_tick_panics_total").increment(1);
            tracing::error!(target: "pipeline", error = %e, "tick panicked");
            None
        }
    }
}

pub fn spawn_scheduler(pipeline: Arc<Pipeline>, cfg: SchedulerCfg, last: LastTick) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let Some(report) = tick_once(&pipeline).await else {
                continue;
            };

            if report.processed > 0 || report.ledger_failures > 0 {
                tracing::info!(
                    target: "pipeline",
                    fetched_a = report.fetched_a,
                    fetched_b = report.fetched_b,
                    stale = report.stale,
                    duplicates = report.duplicates,
                    processed = report.processed,
                    delivered = report.deliveries_ok,
                    failed = report.deliveries_failed,
                    ledger_failures = report.ledger_failures,
                    duration_ms = report.duration_ms,
                    "tick"
                );
            } else {
                tracing::trace!(target: "pipeline", duration_ms = report.duration_ms, "idle tick");
            }

            match last.write() {
                Ok(mut slot) => *slot = Some(report),
                Err(_) => tracing::warn!(target: "pipeline", "last-tick lock poisoned"),
            }
        }
    })
}
