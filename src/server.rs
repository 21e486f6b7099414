use crate::cache::TranslationCache;
use crate::config::Config;
use crate::db::{self, HandlerResponse};
use crate::dispatch::{validate_batch_size, BatchResult, Dispatcher, ItemResult};
use crate::error::{FieldError, RouterError};
use crate::event::{normalize, EventRecord, Platform};
use crate::ratelimit::{LimitScope, RateLimiter};
use crate::security::constant_time_compare;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared state for all handlers. Cheap to clone; everything heavy sits
/// behind an Arc.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<TranslationCache>,
    pub pool: Option<PgPool>,
}

/// Build the HTTP surface. `/health` is open; the router endpoints sit
/// behind the optional API-key gate.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/events", post(post_event))
        .route("/events/batch", post(post_batch))
        .route("/responses", post(post_response))
        .route("/limits/reset", post(post_limits_reset))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .nest("/api/v1/router", api)
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, RouterError> {
    if let Some(expected) = &state.config.api_key {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_compare(provided, expected) {
            return Err(RouterError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

fn json_body(
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<serde_json::Value, RouterError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(RouterError::invalid_field(
            "body",
            rejection.body_text(),
            "malformed",
        )),
    }
}

// ==================== Handlers ====================

/// `POST /api/v1/router/events` - run one event through the pipeline.
async fn post_event(
    State(state): State<AppState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<ItemResult>, RouterError> {
    let raw = json_body(payload)?;
    let event = normalize(raw).map_err(RouterError::validation)?;
    let result = state.dispatcher.dispatch_one(event).await;
    Ok(Json(result))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchRequest {
    events: Vec<serde_json::Value>,
}

/// `POST /api/v1/router/events/batch` - run 1..=100 events concurrently.
///
/// Admission is all-or-nothing: a bad batch size or any invalid event
/// rejects the whole call before processing starts.
async fn post_batch(
    State(state): State<AppState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<BatchResult>, RouterError> {
    let raw = json_body(payload)?;
    let request: BatchRequest = serde_json::from_value(raw)
        .map_err(|e| RouterError::invalid_field("events", e.to_string(), "schema"))?;

    validate_batch_size(request.events.len()).map_err(RouterError::validation)?;
    let events = normalize_batch(request.events).map_err(RouterError::validation)?;

    let batch = state
        .dispatcher
        .dispatch_batch(events)
        .await
        .map_err(RouterError::validation)?;
    Ok(Json(batch))
}

/// Normalize every raw event, reporting each violation under its
/// `events[i].` prefix so a caller can fix the whole batch at once.
fn normalize_batch(raw_events: Vec<serde_json::Value>) -> Result<Vec<EventRecord>, Vec<FieldError>> {
    let mut events = Vec::with_capacity(raw_events.len());
    let mut errors = Vec::new();

    for (index, raw) in raw_events.into_iter().enumerate() {
        match normalize(raw) {
            Ok(event) => events.push(event),
            Err(event_errors) => {
                errors.extend(event_errors.into_iter().map(|e| FieldError {
                    field: format!("events[{}].{}", index, e.field),
                    ..e
                }));
            }
        }
    }

    if errors.is_empty() {
        Ok(events)
    } else {
        Err(errors)
    }
}

/// `POST /api/v1/router/responses` - inbound channel for downstream
/// handlers to post results back.
async fn post_response(
    State(state): State<AppState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<serde_json::Value>, RouterError> {
    let raw = json_body(payload)?;
    let response: HandlerResponse = serde_json::from_value(raw)
        .map_err(|e| RouterError::invalid_field("response", e.to_string(), "schema"))?;

    let mut errors = Vec::new();
    for (field, value) in [
        ("event_id", &response.event_id),
        ("response", &response.response),
        ("channel_id", &response.channel_id),
    ] {
        if value.trim().is_empty() {
            errors.push(FieldError::new(field, format!("{} must not be blank", field), "blank"));
        }
    }
    if Platform::from_name(response.platform.trim()).is_none() {
        errors.push(FieldError::new(
            "platform",
            format!("unknown platform '{}'", response.platform),
            "invalid",
        ));
    }
    if !errors.is_empty() {
        return Err(RouterError::validation(errors));
    }

    match &state.pool {
        Some(pool) => db::insert_handler_response(pool, &response)
            .await
            .map_err(RouterError::Internal)?,
        None => {
            // No durable store configured: acknowledge but leave a trace
            warn!(
                "Handler response for event {} received without a database; not persisted",
                response.event_id
            );
        }
    }

    Ok(Json(json!({"status": "success"})))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ResetRequest {
    scope: LimitScope,
    community_id: String,
    #[serde(default)]
    user_id: Option<String>,
}

/// `POST /api/v1/router/limits/reset` - manual remediation: clear all
/// limit-type counters for an identifier immediately.
async fn post_limits_reset(
    State(state): State<AppState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<serde_json::Value>, RouterError> {
    let raw = json_body(payload)?;
    let request: ResetRequest = serde_json::from_value(raw)
        .map_err(|e| RouterError::invalid_field("reset", e.to_string(), "schema"))?;

    if request.community_id.trim().is_empty() {
        return Err(RouterError::invalid_field(
            "community_id",
            "community_id must not be blank",
            "blank",
        ));
    }
    if request.scope == LimitScope::User
        && request.user_id.as_deref().map(str::trim).unwrap_or("").is_empty()
    {
        return Err(RouterError::invalid_field(
            "user_id",
            "user_id is required for user-scope resets",
            "required",
        ));
    }

    state
        .limiter
        .reset(request.scope, &request.community_id, request.user_id.as_deref())
        .await;

    Ok(Json(json!({"status": "success"})))
}

/// `GET /health` - liveness plus cache effectiveness.
async fn get_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "cache": state.cache.stats(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
