//! Collectible notifier: binary entrypoint.
//! Wires feeds, ledger, subscriptions and delivery into the pipeline, starts the
//! scheduler and the prune sweep, and serves `/health`, `/status`, `/metrics`.

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use collectible_notifier::api::{self, AppState};
use collectible_notifier::config::PipelineConfig;
use collectible_notifier::ingest::enrich::Enricher;
use collectible_notifier::ingest::providers::{market_a::MarketAFeed, market_b::MarketBFeed};
use collectible_notifier::ingest::types::SourceFeed;
use collectible_notifier::ledger::{self, FileLedger, Ledger};
use collectible_notifier::metrics::Metrics;
use collectible_notifier::notify::{telegram::TelegramNotifier, Dispatcher};
use collectible_notifier::pipeline::Pipeline;
use collectible_notifier::scheduler::{spawn_scheduler, SchedulerCfg};
use collectible_notifier::subscriptions::{FileSubscriptionStore, SubscriptionResolver};

/// `LOG_FORMAT=json` switches to JSON lines; `RUST_LOG` overrides the filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = PipelineConfig::from_env().context("loading configuration")?;
    let (feed_a_ep, feed_b_ep, bot_token) = cfg.require_endpoints()?;
    let metrics = Metrics::init(&cfg)?;

    let feed_a = Arc::new(MarketAFeed::from_url(&feed_a_ep.base_url, &feed_a_ep.token, cfg.http_timeout)?);
    let feed_b = Arc::new(MarketBFeed::from_url(&feed_b_ep.base_url, &feed_b_ep.token, cfg.http_timeout)?);
    let enricher = Enricher::new(feed_a.clone(), SourceFeed::B, cfg.rank_cache_ttl);

    let ledger: Arc<dyn Ledger> = Arc::new(FileLedger::open(&cfg.ledger_path).await?);

    let resolver = Arc::new(SubscriptionResolver::new(
        Arc::new(FileSubscriptionStore::from_env()),
        cfg.subscription_refresh,
    ));
    match resolver.refresh().await {
        Ok(n) => tracing::info!(destinations = n, "subscriptions loaded"),
        Err(e) => tracing::warn!(error = ?e, "initial subscription load failed"),
    }

    let mut notifier = TelegramNotifier::new(bot_token.to_string()).with_timeout(cfg.http_timeout.as_secs());
    if let Some(base) = &cfg.bot_api_base {
        notifier = notifier.with_api_base(base);
    }
    if let Some(emoji) = &cfg.bot_reaction {
        notifier = notifier.with_reaction(emoji);
    }
    let dispatcher = Dispatcher::new(Arc::new(notifier), cfg.delivery_delay);

    let pipeline = Arc::new(
        Pipeline::new(feed_a, feed_b, enricher, ledger.clone(), resolver, dispatcher)
            .with_windows(cfg.windows)
            .with_fetch_limit(cfg.fetch_limit)
            .with_policy(cfg.ledger_policy),
    );

    if let Err(e) = pipeline.seed_watermarks(Utc::now()).await {
        // freshness windows still bound what the first ticks can replay
        tracing::warn!(error = ?e, "watermark seeding failed");
    }

    let last_tick = Arc::new(RwLock::new(None));
    spawn_scheduler(
        pipeline,
        SchedulerCfg {
            interval: cfg.tick_interval,
        },
        last_tick.clone(),
    );
    ledger::spawn_prune_task(ledger, cfg.ledger_retention, cfg.prune_interval);

    let app = api::create_router(AppState { last_tick }).merge(metrics.router());
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    tracing::info!(bind = %cfg.bind_addr, policy = ?cfg.ledger_policy, "collectible notifier up");
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
