//! Prometheus metrics for qrlink.
//!
//! Exposes a standard `/metrics` endpoint that Prometheus can scrape.
//! Counters live in the global default registry and are registered once.

use once_cell::sync::Lazy;
use prometheus::{opts, register_counter_vec, register_int_counter, CounterVec, Encoder, IntCounter, TextEncoder};

pub struct Metrics {
    scans_total: CounterVec,
    redirects_total: CounterVec,
    tokens_created_total: IntCounter,
    tokens_revoked_total: IntCounter,
    rule_skips_total: IntCounter,
}

static METRICS: Lazy<Option<Metrics>> = Lazy::new(|| match Metrics::register() {
    Ok(m) => Some(m),
    Err(e) => {
        tracing::error!("failed to register prometheus metrics: {}", e);
        None
    }
});

impl Metrics {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            scans_total: register_counter_vec!(
                opts!("qrlink_scans_total", "Public scans by resolution status"),
                &["status"]
            )?,
            redirects_total: register_counter_vec!(
                opts!("qrlink_redirects_total", "Effective redirects by precedence source"),
                &["source"]
            )?,
            tokens_created_total: register_int_counter!(
                "qrlink_tokens_created_total",
                "Tokens created by the label rendering workflow"
            )?,
            tokens_revoked_total: register_int_counter!(
                "qrlink_tokens_revoked_total",
                "Tokens transitioned to REVOKED"
            )?,
            rule_skips_total: register_int_counter!(
                "qrlink_rule_skips_total",
                "Bulk rule creations skipped because an active rule existed"
            )?,
        })
    }
}

pub fn record_scan(status: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.scans_total.with_label_values(&[status]).inc();
    }
}

pub fn record_redirect(source: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.redirects_total.with_label_values(&[source]).inc();
    }
}

pub fn record_tokens_created(n: u64) {
    if let Some(m) = METRICS.as_ref() {
        m.tokens_created_total.inc_by(n);
    }
}

pub fn record_tokens_revoked(n: u64) {
    if let Some(m) = METRICS.as_ref() {
        m.tokens_revoked_total.inc_by(n);
    }
}

pub fn record_rule_skips(n: u64) {
    if let Some(m) = METRICS.as_ref() {
        m.rule_skips_total.inc_by(n);
    }
}

/// Encode all registered metrics as Prometheus text format.
/// Called by the `/metrics` HTTP handler.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

// ── Tests ─────────────────────────────────────────────────────
