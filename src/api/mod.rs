use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::AppError;
use crate::middleware::metrics;
use crate::AppState;

pub mod handlers;
pub mod scan;

/// Admin bodies are small JSON documents; bulk rule requests are the largest.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the admin API router.
/// All routes are relative; `build_app` mounts this under `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/tokens", post(handlers::create_token))
        .route("/tokens/batch", post(handlers::create_token_batch))
        .route("/tokens/lookup/:value", get(handlers::lookup_token))
        .route("/tokens/:id", get(handlers::get_token))
        .route("/tokens/:id/history", get(handlers::get_token_history))
        .route("/tokens/:id/redirect", put(handlers::set_token_redirect))
        .route("/tokens/:id/revoke", post(handlers::revoke_token))
        .route("/tokens/:id/associate", post(handlers::associate_token))
        .route(
            "/tokens/:id/eligibility/:batch_id",
            get(handlers::check_eligibility),
        )
        .route(
            "/entities/:entity_type/:entity_id/tokens",
            get(handlers::list_entity_tokens),
        )
        .route(
            "/entities/:entity_type/:entity_id/revoke",
            post(handlers::revoke_entity_tokens),
        )
        .route(
            "/batches/:id/eligible-tokens",
            get(handlers::list_eligible_tokens),
        )
        .route(
            "/rules",
            get(handlers::list_rules).post(handlers::create_rule),
        )
        .route("/rules/bulk", post(handlers::bulk_create_rules))
        .route(
            "/rules/fallback",
            get(handlers::get_fallback_rule)
                .put(handlers::set_fallback_rule)
                .delete(handlers::clear_fallback_rule),
        )
        .route("/rules/:id", get(handlers::get_rule))
        .route("/rules/:id/deactivate", post(handlers::deactivate_rule))
        .layer(middleware::from_fn_with_state(state, admin_auth))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .fallback(fallback_404)
}

/// Full application: public scan and probe routes plus the admin API.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/qr/:token", get(scan::scan))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .nest("/api/v1", api_router(state.clone()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Middleware: validates `X-Admin-Key` (or `Authorization: Bearer`) against
/// the configured admin key in constant time.
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided_key = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim);

    match provided_key {
        Some(k) if bool::from(k.as_bytes().ct_eq(state.config.admin_key.as_bytes())) => {
            Ok(next.run(req).await)
        }
        Some(_) => {
            // never log the provided key
            tracing::warn!(path = %req.uri().path(), "admin API: invalid key");
            Err(AppError::Unauthorized)
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "admin API: missing admin key");
            Err(AppError::Unauthorized)
        }
    }
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    match &state.db {
        Some(db) => match db.ping().await {
            Ok(()) => Ok("ok"),
            Err(e) => {
                tracing::warn!("readiness: database unreachable: {}", e);
                Err(StatusCode::SERVICE_UNAVAILABLE)
            }
        },
        None => Ok("ok"),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

/// Middleware: injects a unique X-Request-Id into every response so clients
/// can correlate errors with logs.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: hardening headers on every response.
async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    // scans must never be served from a cache: status can change at any time
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.remove(header::SERVER);

    resp
}
