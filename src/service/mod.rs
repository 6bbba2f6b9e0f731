//! Token lifecycle, scan resolution, redirect rules and association.
//!
//! `QrService` wires the four components over one store, one entity registry
//! and one audit sink. Components are cheap to clone and share their
//! collaborators through `Arc`.

pub mod association;
pub mod generator;
pub mod lifecycle;
pub mod resolver;
pub mod rules;

use std::sync::Arc;

use crate::cache::RuleCache;
use crate::errors::AppError;
use crate::middleware::audit::AuditSink;
use crate::registry::EntityRegistry;
use crate::store::TokenStore;

pub use association::AssociationManager;
pub use lifecycle::TokenLifecycle;
pub use resolver::ResolutionResolver;
pub use rules::RedirectRuleEngine;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub public_base_url: String,
    pub rule_cache_ttl_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:8080".into(),
            rule_cache_ttl_secs: 0,
        }
    }
}

#[derive(Clone)]
pub struct QrService {
    pub lifecycle: TokenLifecycle,
    pub rules: RedirectRuleEngine,
    pub resolver: ResolutionResolver,
    pub association: AssociationManager,
    store: Arc<dyn TokenStore>,
}

impl QrService {
    pub fn new(
        store: Arc<dyn TokenStore>,
        registry: Arc<dyn EntityRegistry>,
        audit: Arc<dyn AuditSink>,
        config: ServiceConfig,
    ) -> Self {
        let cache = RuleCache::new(config.rule_cache_ttl_secs);
        let rules = RedirectRuleEngine::new(store.clone(), registry.clone(), audit.clone(), cache);
        Self {
            lifecycle: TokenLifecycle::new(store.clone(), registry.clone(), audit.clone()),
            resolver: ResolutionResolver::new(
                store.clone(),
                rules.clone(),
                audit.clone(),
                config.public_base_url,
            ),
            association: AssociationManager::new(store.clone(), registry, audit),
            rules,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }
}

/// Redirect targets must be absolute http(s) URLs with a host.
pub(crate) fn validate_redirect_url(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    let url = url::Url::parse(trimmed)
        .map_err(|_| AppError::invalid(format!("invalid redirect URL '{}'", trimmed)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AppError::invalid("redirect URL must use http or https"));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(AppError::invalid("redirect URL must have a host"));
    }
    Ok(trimmed.to_string())
}

/// Trimmed, non-empty reason text.
pub(crate) fn require_reason(reason: &str, what: &str) -> Result<String, AppError> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid(format!("a reason is required to {}", what)));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn optional_text(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_url_validation() {
        assert!(validate_redirect_url("https://example.com/recall").is_ok());
        assert_eq!(
            validate_redirect_url("  http://example.com ").unwrap(),
            "http://example.com"
        );
        assert_eq!(validate_redirect_url("javascript:alert(1)").unwrap_err().code(), "invalid_input");
        assert!(validate_redirect_url("ftp://example.com").is_err());
        assert!(validate_redirect_url("/relative/path").is_err());
    }

    #[test]
    fn test_require_reason() {
        assert_eq!(require_reason(" recall ", "revoke").unwrap(), "recall");
        assert_eq!(require_reason("  ", "revoke").unwrap_err().code(), "invalid_input");
    }
}
