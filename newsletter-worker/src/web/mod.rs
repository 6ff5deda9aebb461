//! Web front end.
//!
//! Serves the list landing page, the subscribe/verify/unsubscribe links
//! and the feedback webhook. The list a request addresses is chosen by its
//! Host header.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    feedback_webhook, health, landing, subscribe, unsubscribe, verify, AppState, EmailQuery,
    HealthResponse, TokenQuery, WebhookResponse,
};

/// All routes with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/subscribe", get(subscribe))
        .route("/verify", get(verify))
        .route("/unsubscribe", get(unsubscribe))
        .route("/webhooks/feedback", post(feedback_webhook))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
