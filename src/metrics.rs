use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::PipelineConfig;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and publish the static pipeline settings.
    pub fn init(cfg: &PipelineConfig) -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        gauge!("pipeline_tick_interval_ms").set(cfg.tick_interval.as_millis() as f64);
        gauge!("pipeline_freshness_window_secs", "class" => "sale")
            .set(cfg.windows.sale.num_seconds() as f64);
        gauge!("pipeline_freshness_window_secs", "class" => "listing")
            .set(cfg.windows.listing.num_seconds() as f64);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
