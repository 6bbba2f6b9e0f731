//! Public scan endpoint. Unauthenticated; never leaks internal identifiers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
};

use crate::errors::AppError;
use crate::service::resolver::{ScanStatus, NOT_FOUND_MESSAGE};
use crate::AppState;

/// GET /qr/:token: 302 to the effective redirect, 410 for revoked or expired
/// labels, 404 otherwise.
pub async fn scan(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let resolution = state.service.resolver.resolve(&token).await?;

    let response = match (resolution.status, resolution.effective_redirect) {
        (ScanStatus::Active, Some(redirect)) => {
            (StatusCode::FOUND, [(header::LOCATION, redirect.url)]).into_response()
        }
        (ScanStatus::Revoked | ScanStatus::Expired, _) => {
            let message = resolution.message.unwrap_or_default();
            (StatusCode::GONE, Html(page("Label unavailable", &message))).into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Html(page("Not found", NOT_FOUND_MESSAGE)),
        )
            .into_response(),
    };
    Ok(response)
}

fn page(title: &str, message: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{}</title></head>\
         <body><h1>{}</h1><p>{}</p></body></html>",
        escape_html(title),
        escape_html(title),
        escape_html(message)
    )
}

/// Revocation reasons are operator-entered text.
fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
