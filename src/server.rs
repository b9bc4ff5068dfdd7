use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::dispatcher::{Dispatcher, Submission};
use crate::message::Message;

const TOKEN_HEADER: &str = "x-api-token";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub token: Arc<str>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, token: impl Into<Arc<str>>) -> Self {
        Self {
            dispatcher,
            token: token.into(),
        }
    }
}

/// HTTP intake: token-authenticated `POST /api/v1/notify` plus an open
/// `GET /api/v1/health`. Requests running past `request_timeout` get a 408.
pub fn router(state: AppState, request_timeout: Option<Duration>) -> Router {
    let protected = Router::new()
        .route("/notify", post(notify))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    let v1 = Router::new()
        .route("/health", get(health))
        .merge(protected);

    let mut app = Router::new().nest("/api/v1", v1);
    if let Some(timeout) = request_timeout {
        app = app.layer(TimeoutLayer::new(timeout));
    }
    app.layer(TraceLayer::new_for_http()).with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn require_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) else {
        warn!("Missing API token");
        return error_response(StatusCode::UNAUTHORIZED, "Missing API token");
    };
    if token.is_empty() {
        warn!("Missing API token");
        return error_response(StatusCode::UNAUTHORIZED, "Missing API token");
    }

    if !bool::from(token.as_bytes().ct_eq(state.token.as_bytes())) {
        warn!("Invalid API token");
        return error_response(StatusCode::UNAUTHORIZED, "Invalid API token");
    }

    next.run(request).await
}

async fn notify(State(state): State<AppState>, body: Bytes) -> Response {
    let message = match Message::parse(&body) {
        Ok(message) => message,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    // Callers are not told about queue drops; they show up in the health stats.
    if let Submission::Dropped(reason) = state.dispatcher.submit(message) {
        debug!(reason = ?reason, "Accepted message was dropped");
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Message accepted" })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "queue": state.dispatcher.stats(),
    }))
}
