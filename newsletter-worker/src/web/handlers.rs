//! HTTP endpoint handlers.
//!
//! Handlers are thin translators: resolve the list from the request host,
//! call the subscription service or the bounce handler, and map the outcome
//! to a status code and a rendered page.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::feedback::signature::{
    is_signature_verification_enabled, verify_feedback_signature, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
use crate::feedback::BounceHandler;
use crate::model::List;
use crate::render::templates::{
    landing_page, message_page, PAGE_DESCRIPTION_ID, PAGE_MESSAGE_ID, PAGE_TITLE_ID,
};
use crate::render::{render_template, Substitutions, LIST_NAME_ID};
use crate::store::{resolve_list_by_domain, ListRegistry};
use crate::subscription::SubscriptionService;
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lists: Arc<dyn ListRegistry>,
    pub subscriptions: Arc<SubscriptionService>,
    pub feedback: Arc<BounceHandler>,
}

impl AppState {
    pub fn new(
        config: Config,
        lists: Arc<dyn ListRegistry>,
        subscriptions: Arc<SubscriptionService>,
    ) -> Self {
        let feedback = Arc::new(BounceHandler::new(subscriptions.clone()));
        Self {
            config: Arc::new(config),
            lists,
            subscriptions,
            feedback,
        }
    }

    async fn list_for(&self, headers: &HeaderMap) -> Result<List, Response> {
        let domain = match host_domain(headers) {
            Some(domain) => domain,
            None => {
                warn!("request_missing_host");
                return Err(page(StatusCode::BAD_REQUEST, "Bad request", "Missing Host header."));
            }
        };
        resolve_list_by_domain(self.lists.as_ref(), &domain)
            .await
            .map_err(|e| error_page(&e))
    }
}

/// Domain of the request, lowercased, without port.
pub fn host_domain(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?.trim();
    let domain = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

// =============================================================================
// Pages
// =============================================================================

fn page(status: StatusCode, title: &str, message: &str) -> Response {
    let html = render_template(
        &message_page(),
        &Substitutions::new()
            .with_text(PAGE_TITLE_ID, title)
            .with_text(PAGE_MESSAGE_ID, message),
    );
    (status, Html(html)).into_response()
}

/// Status code returned for a failed subscription operation.
pub fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::InvalidEmail(_) | Error::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        Error::UnknownToken | Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::RecentlySent { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::AlreadyVerified => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_page(err: &Error) -> Response {
    let status = error_status(err);
    let (title, message) = match err {
        Error::InvalidEmail(_) => ("Invalid email", "That email address is not valid.".to_string()),
        Error::UnknownToken => (
            "Unknown link",
            "This verification link is not valid. It may have been used for an address that has since unsubscribed.".to_string(),
        ),
        Error::NotFound { entity: "List", .. } => {
            ("Not found", "No mailing list is served on this domain.".to_string())
        }
        Error::NotFound { .. } => ("Not subscribed", "That address is not subscribed.".to_string()),
        Error::RecentlySent { retry_after_secs } => (
            "Email already sent",
            format!(
                "A verification email was sent recently. Check your inbox or try again in {} minutes.",
                (retry_after_secs + 59) / 60
            ),
        ),
        Error::AlreadyVerified => ("Already verified", "Your email address is already verified.".to_string()),
        _ => {
            error!(error = %err, "request_failed");
            ("Something went wrong", "Please try again later.".to_string())
        }
    };

    let mut response = page(status, title, &message);
    if let Error::RecentlySent { retry_after_secs } = err {
        if let Ok(value) = (*retry_after_secs).max(0).to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Subscription Pages
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct EmailQuery {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: String,
}

/// List landing page with subscribe and unsubscribe forms.
pub async fn landing(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let list = match state.list_for(&headers).await {
        Ok(list) => list,
        Err(response) => return response,
    };

    let html = render_template(
        &landing_page(),
        &Substitutions::new()
            .with_text(LIST_NAME_ID, list.name.clone())
            .with_text(PAGE_DESCRIPTION_ID, list.description.clone()),
    );
    Html(html).into_response()
}

pub async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EmailQuery>,
) -> Response {
    let list = match state.list_for(&headers).await {
        Ok(list) => list,
        Err(response) => return response,
    };

    match state.subscriptions.subscribe(&list, &query.email).await {
        Ok(subscription) if subscription.is_verified() => page(
            StatusCode::OK,
            "Already subscribed",
            "You are already subscribed to this list.",
        ),
        Ok(_) => page(
            StatusCode::OK,
            "Check your inbox",
            "We sent you an email with a link to confirm your subscription.",
        ),
        Err(e) => {
            info!(list = %list.name, error = %e, "subscribe_rejected");
            error_page(&e)
        }
    }
}

pub async fn verify(State(state): State<AppState>, Query(query): Query<TokenQuery>) -> Response {
    match state.subscriptions.verify(&query.token).await {
        Ok(_) => page(
            StatusCode::OK,
            "Subscription confirmed",
            "Your email address has been verified.",
        ),
        Err(e) => error_page(&e),
    }
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EmailQuery>,
) -> Response {
    let list = match state.list_for(&headers).await {
        Ok(list) => list,
        Err(response) => return response,
    };

    match state.subscriptions.unsubscribe(&list.name, &query.email).await {
        Ok(()) => page(
            StatusCode::OK,
            "Unsubscribed",
            "You will no longer receive emails from this list.",
        ),
        Err(e) => error_page(&e),
    }
}

// =============================================================================
// Feedback Webhook
// =============================================================================

/// Webhook response.
#[derive(Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub events: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriptions_removed: Option<usize>,
}

impl WebhookResponse {
    fn status(status: &'static str, events: usize) -> Self {
        Self {
            status,
            events,
            subscriptions_removed: None,
        }
    }
}

/// Split a webhook body into raw events.
///
/// The body is a JSON array whose elements are notifications, either as
/// objects or as JSON-encoded strings. A single object is a batch of one.
pub fn split_events(body: &[u8]) -> Result<Vec<String>, Error> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::MalformedPayload(format!("invalid JSON body: {}", e)))?;

    let elements = match value {
        Value::Array(elements) => elements,
        object @ Value::Object(_) => vec![object],
        _ => {
            return Err(Error::MalformedPayload(
                "body must be an array or an object".to_string(),
            ))
        }
    };

    Ok(elements
        .into_iter()
        .map(|element| match element {
            Value::String(raw) => raw,
            other => other.to_string(),
        })
        .collect())
}

/// Feedback webhook endpoint.
///
/// 1. Verifies the HMAC signature (if configured)
/// 2. Applies the batch
/// 3. Returns 500 if any event failed so the sender redelivers the batch
pub async fn feedback_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    info!(body_length = body.len(), "feedback_webhook_received");

    if is_signature_verification_enabled(&state.config.feedback_signing_key) {
        let signing_key = state.config.feedback_signing_key.as_deref().unwrap_or_default();
        let header_value = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        if !verify_feedback_signature(
            signing_key,
            &header_value(TIMESTAMP_HEADER),
            &body,
            &header_value(SIGNATURE_HEADER),
            state.config.feedback_signature_max_age,
        ) {
            warn!("feedback_signature_invalid");
            return (
                StatusCode::UNAUTHORIZED,
                Json(WebhookResponse::status("unauthorized", 0)),
            );
        }
    }

    let events = match split_events(&body) {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "feedback_body_malformed");
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse::status("malformed", 0)),
            );
        }
    };

    match state.feedback.handle_batch(&events).await {
        Ok(report) => (
            StatusCode::OK,
            Json(WebhookResponse {
                status: "ok",
                events: report.events,
                subscriptions_removed: Some(report.subscriptions_removed),
            }),
        ),
        Err(e) => {
            error!(error = %e, "feedback_batch_failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WebhookResponse::status("error", events.len())),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MockMailTransport;
    use crate::model::{Feed, Subscription, VerificationState};
    use crate::store::{MemoryStore, SubscriptionStore};
    use crate::subscription::SubscriptionSettings;
    use crate::util::ManualClock;
    use axum::http::HeaderValue;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        store: MemoryStore,
        transport: MockMailTransport,
        state: AppState,
    }

    fn config() -> Config {
        Config {
            database_url: String::new(),
            amqp_url: String::new(),
            delivery_queue: "test".to_string(),
            mailgun_api_key: None,
            mailgun_domain: None,
            mailgun_api_base: String::new(),
            request_timeout_ms: 1000,
            poll_concurrency: 1,
            worker_concurrency: 1,
            item_window_hours: 24,
            verification_cooldown_minutes: 15,
            port: 0,
            feedback_signing_key: None,
            feedback_signature_max_age: 300,
        }
    }

    fn fixture_with(config: Config) -> Fixture {
        let store = MemoryStore::new();
        store.insert_list(List {
            name: "news".to_string(),
            description: "Weekly news".to_string(),
            domain: "news.example.com".to_string(),
            from_address: "news@example.com".to_string(),
            reply_to_address: "news@example.com".to_string(),
            feeds: vec![Feed::new("https://example.com/feed.xml")],
        });
        let transport = MockMailTransport::new();
        let service = SubscriptionService::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            )),
            SubscriptionSettings::default(),
        );
        let state = AppState::new(config, Arc::new(store.clone()), Arc::new(service));
        Fixture {
            store,
            transport,
            state,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(config())
    }

    fn host(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static(value));
        headers
    }

    fn email(value: &str) -> Query<EmailQuery> {
        Query(EmailQuery {
            email: value.to_string(),
        })
    }

    #[test]
    fn test_host_domain_strips_port() {
        assert_eq!(
            host_domain(&host("News.Example.com:8080")).as_deref(),
            Some("news.example.com")
        );
        assert_eq!(
            host_domain(&host("news.example.com")).as_deref(),
            Some("news.example.com")
        );
        assert_eq!(host_domain(&HeaderMap::new()), None);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(error_status(&Error::InvalidEmail("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(&Error::UnknownToken), StatusCode::NOT_FOUND);
        assert_eq!(
            error_status(&Error::list_not_found("x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&Error::RecentlySent { retry_after_secs: 60 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(error_status(&Error::AlreadyVerified), StatusCode::OK);
        assert_eq!(
            error_status(&Error::Transport(anyhow::anyhow!("down"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_split_events() {
        let events = split_events(br#"["{\"a\":1}", {"b":2}]"#).unwrap();
        assert_eq!(events, vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()]);

        assert_eq!(split_events(br#"{"b":2}"#).unwrap().len(), 1);
        assert!(split_events(b"42").is_err());
        assert!(split_events(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_subscribe_then_verify_then_unsubscribe() {
        let f = fixture();

        let response = subscribe(
            State(f.state.clone()),
            host("news.example.com"),
            email(" Reader@Example.com "),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.transport.sent_to("Reader@example.com").len(), 1);

        let again = subscribe(
            State(f.state.clone()),
            host("news.example.com"),
            email("Reader@example.com"),
        )
        .await;
        assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(again.headers().contains_key(header::RETRY_AFTER));

        let token = SubscriptionStore::get(&f.store, "news", "Reader@example.com")
            .await
            .unwrap()
            .unwrap()
            .verification_token;
        let verified = verify(
            State(f.state.clone()),
            Query(TokenQuery {
                token: token.clone(),
            }),
        )
        .await;
        assert_eq!(verified.status(), StatusCode::OK);

        let twice = verify(State(f.state.clone()), Query(TokenQuery { token })).await;
        assert_eq!(twice.status(), StatusCode::OK);

        let gone = unsubscribe(
            State(f.state.clone()),
            host("news.example.com"),
            email("Reader@example.com"),
        )
        .await;
        assert_eq!(gone.status(), StatusCode::OK);

        let missing = unsubscribe(
            State(f.state.clone()),
            host("news.example.com"),
            email("Reader@example.com"),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_subscribe_rejects_invalid_email_and_unknown_host() {
        let f = fixture();

        let invalid = subscribe(
            State(f.state.clone()),
            host("news.example.com"),
            email("not-an-address"),
        )
        .await;
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let unknown = landing(State(f.state.clone()), host("other.example.com")).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let no_host = landing(State(f.state.clone()), HeaderMap::new()).await;
        assert_eq!(no_host.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_verify_unknown_token() {
        let f = fixture();
        let response = verify(
            State(f.state.clone()),
            Query(TokenQuery {
                token: "nope".to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_feedback_webhook_removes_bounced_address() {
        let f = fixture();
        f.store.insert_subscription(Subscription {
            list: "news".to_string(),
            email: "x@example.com".to_string(),
            verification_token: "tok".to_string(),
            verification: VerificationState::Verified,
            last_sent_verification: Utc::now(),
        });

        let body = serde_json::json!([{
            "notificationType": "Bounce",
            "mail": { "destination": ["x@example.com"] },
            "bounce": { "bounceType": "Permanent" },
        }])
        .to_string();

        let response = feedback_webhook(State(f.state.clone()), HeaderMap::new(), Bytes::from(body))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(f.store.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_feedback_webhook_partial_failure_is_500() {
        let f = fixture();
        let body = Bytes::from_static(br#"["{broken", {"notificationType":"Delivery"}]"#);

        let response = feedback_webhook(State(f.state.clone()), HeaderMap::new(), body)
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_feedback_webhook_requires_signature_when_configured() {
        let mut config = config();
        config.feedback_signing_key = Some("secret".to_string());
        let f = fixture_with(config);
        let body = Bytes::from_static(b"[]");

        let unsigned = feedback_webhook(State(f.state.clone()), HeaderMap::new(), body.clone())
            .await
            .into_response();
        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            .to_string();
        let signature =
            crate::feedback::signature::sign("secret", &timestamp, &body).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(&timestamp).unwrap());
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());

        let signed = feedback_webhook(State(f.state.clone()), headers, body)
            .await
            .into_response();
        assert_eq!(signed.status(), StatusCode::OK);
    }
}
