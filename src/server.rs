//! Annotation HTTP API.
//!
//! Exposes the annotation collection and base-URL discovery as a small JSON
//! API for the in-page toolbar.
//!
//! # Endpoints
//!
//! All paths sit under the configured prefix (default `/api`).
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/annotations` | Full collection, insertion order |
//! | `POST`   | `/annotations` | Event envelope; only `annotation.add` mutates |
//! | `PATCH`  | `/annotations` | `{id, sourceLocation?, comment?}` partial update |
//! | `DELETE` | `/annotations?id=...` | Remove by id (falls back to `{id}` body) |
//! | `GET`    | `/config` | `{apiUrl}`: tunnel URL or local address |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Annotation not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//! A body that is not valid UTF-8 JSON is reported as `internal` (500); an
//! empty body as `bad_request`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted on every response, and
//! `OPTIONS` preflights are answered directly. The toolbar may be served
//! from a different origin than the API, and this server is only meant for
//! local, trusted development.

use std::fmt;
use std::sync::Arc;

use agentation_core::event::AnnotationEvent;
use agentation_core::models::{caller_id, Annotation, AnnotationPatch};
use agentation_core::store::{AnnotationStore, Removal};
use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::{Config, TUNNEL_TOKEN_ENV};
use crate::json_store::JsonFileStore;
use crate::tunnel::{provider_from_config, EndpointPublisher, TunnelProvider};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AnnotationStore>,
    pub publisher: Arc<EndpointPublisher>,
}

/// Starts the annotation server.
///
/// Binds to `[server].bind`, opens the store at `[store].path`, starts the
/// tunnel (when a credential is configured) once the listener is bound, and
/// serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    let store = JsonFileStore::open(&config.store.path).await?;
    info!(path = %store.path().display(), "annotation store ready");

    let tunnel = provider_from_config(&config.tunnel, std::env::var(TUNNEL_TOKEN_ENV).ok());
    serve(listener, config, Arc::new(store), tunnel).await
}

/// Serves on an already-bound listener with an injected store and tunnel.
pub async fn serve(
    listener: TcpListener,
    config: &Config,
    store: Arc<dyn AnnotationStore>,
    tunnel: Option<Arc<dyn TunnelProvider>>,
) -> anyhow::Result<()> {
    let bound = listener.local_addr()?;
    let advertised_port = config
        .server
        .port()
        .filter(|p| *p != 0)
        .unwrap_or(bound.port());
    let publisher = Arc::new(EndpointPublisher::new(advertised_port));

    // The listener is accepting connections from here on.
    if let Some(provider) = tunnel {
        publisher.start(provider, bound.port());
    }

    let app = router(
        AppState { store, publisher },
        &config.server.prefix,
    );

    info!(
        "annotation API listening on http://{}{}/annotations",
        bound, config.server.prefix
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/// Builds the router with every route nested under `prefix`.
pub fn router(state: AppState, prefix: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route(
            "/annotations",
            get(handle_list)
                .post(handle_create)
                .patch(handle_update)
                .delete(handle_delete),
        )
        .route("/config", get(handle_config))
        .route("/health", get(handle_health));

    let app = if prefix.is_empty() || prefix == "/" {
        api
    } else {
        Router::new().nest(prefix, api)
    };

    app.layer(axum::middleware::from_fn(log_request))
        .layer(cors)
        .with_state(state)
}

async fn log_request(
    method: Method,
    uri: Uri,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    info!(method = %method, path = %uri.path(), "request");
    next.run(req).await
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Logs `err` with its context chain and returns a generic 500.
fn internal(message: &str, err: anyhow::Error) -> AppError {
    error!(error = %format!("{:#}", err), "{}", message);
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.to_string(),
    }
}

/// Parses a non-empty JSON body.
fn parse_body(body: &[u8], failure: &str) -> Result<Value, AppError> {
    let text = body_text(body, failure)?;
    if text.trim().is_empty() {
        return Err(bad_request("Empty body"));
    }
    serde_json::from_str(text).map_err(|e| malformed(failure, e))
}

fn body_text<'a>(body: &'a [u8], failure: &str) -> Result<&'a str, AppError> {
    std::str::from_utf8(body).map_err(|e| malformed(failure, format!("invalid UTF-8: {}", e)))
}

/// A 500 carrying the parse error, so the caller can see what was wrong.
fn malformed(failure: &str, err: impl fmt::Display) -> AppError {
    error!(error = %err, "{}: malformed JSON body", failure);
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("{}: malformed JSON body: {}", failure, err),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /config ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    api_url: String,
}

/// Handler for `GET /config`. Never fails.
async fn handle_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        api_url: state.publisher.base_url(),
    })
}

// ============ GET /annotations ============

async fn handle_list(State(state): State<AppState>) -> Result<Json<Vec<Annotation>>, AppError> {
    let records = state
        .store
        .list()
        .await
        .map_err(|e| internal("Failed to read database", e))?;
    Ok(Json(records))
}

// ============ POST /annotations ============

/// Handler for `POST /annotations`.
///
/// Only `annotation.add` envelopes reach the store; any other event is
/// acknowledged with `{ "ignored": true }`.
async fn handle_create(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    const FAILURE: &str = "Failed to save annotation";
    let envelope = parse_body(&body, FAILURE)?;

    match AnnotationEvent::from_envelope(&envelope) {
        AnnotationEvent::Ignored(kind) => {
            info!(event = kind.as_str(), "ignoring non-add event");
            Ok(Json(serde_json::json!({ "ignored": true })))
        }
        AnnotationEvent::Add(annotation) => {
            let stored = state
                .store
                .append(annotation)
                .await
                .map_err(|e| internal(FAILURE, e))?;
            info!(id = %stored.id, "created annotation from event");
            let value = serde_json::to_value(&stored).map_err(|e| internal(FAILURE, e.into()))?;
            Ok(Json(value))
        }
    }
}

// ============ PATCH /annotations ============

async fn handle_update(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Annotation>, AppError> {
    const FAILURE: &str = "Failed to update annotation";
    let payload = parse_body(&body, FAILURE)?;
    let id = caller_id(payload.get("id")).ok_or_else(|| not_found("Annotation not found"))?;
    let patch = AnnotationPatch::from_payload(&payload);

    match state.store.update(&id, &patch).await {
        Ok(Some(updated)) => {
            info!(id = %id, "updated annotation");
            Ok(Json(updated))
        }
        Ok(None) => Err(not_found("Annotation not found")),
        Err(e) => Err(internal(FAILURE, e)),
    }
}

// ============ DELETE /annotations ============

#[derive(Deserialize)]
struct DeleteQuery {
    id: Option<String>,
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
}

/// Handler for `DELETE /annotations`.
///
/// The id comes from the `id` query parameter, or else from a JSON body.
async fn handle_delete(
    State(state): State<AppState>,
    Query(query): Query<DeleteQuery>,
    body: Bytes,
) -> Result<Json<DeleteResponse>, AppError> {
    const FAILURE: &str = "Failed to delete annotation";
    let id = match query.id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            let text = body_text(&body, FAILURE)?;
            let payload: Value = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(text).map_err(|e| malformed(FAILURE, e))?
            };
            caller_id(payload.get("id")).ok_or_else(|| bad_request("Missing ID"))?
        }
    };

    match state.store.remove(&id).await {
        Ok(Removal::Removed) => {
            info!(id = %id, "deleted annotation");
            Ok(Json(DeleteResponse { success: true }))
        }
        Ok(Removal::NotFound) => Err(not_found("Annotation not found")),
        Err(e) => Err(internal(FAILURE, e)),
    }
}
