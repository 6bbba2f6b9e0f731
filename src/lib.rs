//! qrlink: printed-label token lifecycle, scan resolution, redirect rules and
//! token-to-batch association behind a small axum service.
//!
//! The binary in `main.rs` wires Postgres-backed collaborators; tests build
//! the same router over the in-memory ones.

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod registry;
pub mod service;
pub mod store;

use std::sync::Arc;

use service::QrService;
use store::postgres::PgStore;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub service: QrService,
    pub config: config::Config,
    /// Present when running against Postgres; used by `/readyz`.
    pub db: Option<PgStore>,
}

impl AppState {
    pub fn new(service: QrService, config: config::Config, db: Option<PgStore>) -> Arc<Self> {
        Arc::new(Self {
            service,
            config,
            db,
        })
    }
}

pub use api::build_app;
