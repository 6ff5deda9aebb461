//! Newsletter delivery worker.
//!
//! Consumes delivery tasks from the delivery queue, renders each email for its
//! subscriber and sends it through Mailgun.

mod consumer;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use newsletter::delivery::{http_client, DeliveryWorker, MailgunTransport};
use newsletter::store::PostgresStore;
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

    tracing::info!("worker_starting");

    let config = Arc::new(Config::from_env());
    tracing::info!(
        amqp_url_set = !config.amqp_url.is_empty(),
        queue = %config.delivery_queue,
        mailgun_domain = ?config.mailgun_domain,
        concurrency = config.worker_concurrency,
        "config_loaded"
    );

    let pool_size = u32::try_from(config.worker_concurrency).unwrap_or(u32::MAX).clamp(2, 32);
    let store = Arc::new(PostgresStore::connect(&config.database_url, pool_size).await?);
    let client = http_client(config.request_timeout())?;
    let transport = Arc::new(MailgunTransport::from_config(&config, client)?);

    let worker = Arc::new(DeliveryWorker::new(
        store.clone(),
        store.clone(),
        store,
        transport,
    ));

    consumer::run(config, worker).await?;

    Ok(())
}
