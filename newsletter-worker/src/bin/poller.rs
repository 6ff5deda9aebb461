//! Newsletter feed poller.
//!
//! Runs one poll cycle over every feed and exits. An external scheduler runs
//! it periodically. Exits non-zero if any feed, item or enqueue failed, after
//! everything else was processed.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use newsletter::delivery::http_client;
use newsletter::feed::{FeedPoller, HttpFeedSource, PollerSettings};
use newsletter::queue::Publisher;
use newsletter::store::PostgresStore;
use newsletter::util::SystemClock;
use newsletter::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("poller_starting");

    let config = Config::from_env();
    let settings = PollerSettings::from_config(&config);
    info!(
        queue = %config.delivery_queue,
        concurrency = settings.concurrency,
        window_hours = config.item_window_hours,
        "config_loaded"
    );

    let pool_size = u32::try_from(settings.concurrency).unwrap_or(u32::MAX).clamp(2, 32);
    let store = Arc::new(PostgresStore::connect(&config.database_url, pool_size).await?);
    let client = http_client(config.request_timeout())?;
    let source = Arc::new(HttpFeedSource::new(client, config.request_timeout()));
    let publisher = Publisher::new(config.amqp_url.clone(), config.delivery_queue.clone());

    let poller = FeedPoller::new(
        store.clone(),
        store.clone(),
        store,
        Arc::new(publisher.clone()),
        source,
        Arc::new(SystemClock),
        settings,
    );

    let result = poller.run().await;
    publisher.close().await;

    match result {
        Ok(report) => {
            info!(
                feeds_polled = report.feeds_polled,
                items_fanned_out = report.items_fanned_out,
                tasks_enqueued = report.tasks_enqueued,
                "poller_finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "poller_failed");
            Err(e.into())
        }
    }
}
