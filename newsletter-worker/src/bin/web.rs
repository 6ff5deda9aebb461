//! Newsletter web server.
//!
//! Serves each list's landing page and the subscribe, verify and unsubscribe
//! links on the list's own domain, plus the bounce/complaint feedback
//! webhook.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use newsletter::delivery::{http_client, MailgunTransport};
use newsletter::feedback::signature::is_signature_verification_enabled;
use newsletter::store::PostgresStore;
use newsletter::subscription::{SubscriptionService, SubscriptionSettings};
use newsletter::util::{shutdown_signal, SystemClock};
use newsletter::web::{router, AppState};
use newsletter::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        feedback_signing_configured = is_signature_verification_enabled(&config.feedback_signing_key),
        mailgun_domain = ?config.mailgun_domain,
        cooldown_minutes = config.verification_cooldown_minutes,
        "config_loaded"
    );

    let store = Arc::new(PostgresStore::connect(&config.database_url, 10).await?);
    store.migrate().await?;

    let client = http_client(config.request_timeout())?;
    let transport = Arc::new(MailgunTransport::from_config(&config, client)?);

    let subscriptions = Arc::new(SubscriptionService::new(
        store.clone(),
        transport,
        Arc::new(SystemClock),
        SubscriptionSettings::from_config(&config),
    ));

    let port = config.port;
    let state = AppState::new(config, store, subscriptions);
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("web_server_shutting_down");
        })
        .await
        .context("Server error")?;

    info!("web_server_shutdown_complete");

    Ok(())
}
