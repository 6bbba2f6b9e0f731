//! Scan-time state machine and the effective-redirect precedence chain.
//!
//! `resolve_token` is the primitive: format check, lookup, lazy expiry and the
//! status branch, with the scan counter as its only write. `effective_redirect`
//! is read-only. `resolve` composes both and writes one combined audit entry
//! per scan.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::generator;
use super::rules::RedirectRuleEngine;
use crate::errors::AppError;
use crate::middleware::audit::AuditSink;
use crate::middleware::metrics;
use crate::models::audit::{AuditAction, AuditEvent};
use crate::models::token::{EntityType, Token, TokenStatus};
use crate::store::TokenStore;

pub const REVOKED_MESSAGE: &str = "This label has been revoked.";
pub const EXPIRED_MESSAGE: &str = "This label has expired.";
pub const NOT_FOUND_MESSAGE: &str = "Label not found.";

/// Actor recorded on scan audit entries.
const SCAN_ACTOR: &str = "public";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Active,
    Revoked,
    Expired,
    NotFound,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Active => "active",
            ScanStatus::Revoked => "revoked",
            ScanStatus::Expired => "expired",
            ScanStatus::NotFound => "not_found",
        }
    }
}

impl From<TokenStatus> for ScanStatus {
    fn from(s: TokenStatus) -> Self {
        match s {
            TokenStatus::Active => ScanStatus::Active,
            TokenStatus::Revoked => ScanStatus::Revoked,
            TokenStatus::Expired => ScanStatus::Expired,
        }
    }
}

/// Result of the scan primitive. `token` reflects the state after the scan
/// (incremented counter for ACTIVE), and is `None` only for NOT_FOUND.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    pub token: Option<Token>,
}

impl ScanOutcome {
    fn not_found() -> Self {
        Self {
            status: ScanStatus::NotFound,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RedirectSource {
    Token,
    Group,
    Default,
}

impl RedirectSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectSource::Token => "token",
            RedirectSource::Group => "group",
            RedirectSource::Default => "default",
        }
    }
}

/// Which kind of DEFAULT produced the URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultVariant {
    Fallback,
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveRedirect {
    pub url: String,
    pub source: RedirectSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<DefaultVariant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<Uuid>,
}

/// What a scan resolves to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub status: ScanStatus,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub effective_redirect: Option<EffectiveRedirect>,
    /// User-facing text for anything but ACTIVE.
    pub message: Option<String>,
    pub scan_count: Option<i64>,
}

/// Format check, lookup and lazy expiry, shared by public scans and
/// operator lookups. Never touches `scan_count`.
pub(crate) async fn find_by_raw(
    store: &dyn TokenStore,
    raw: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<Token>> {
    let candidate = generator::extract_candidate(raw);
    if !generator::is_valid_format(candidate) {
        tracing::debug!("rejected malformed token before lookup");
        return Ok(None);
    }

    let Some(mut token) = store.get_token_by_value(candidate).await? else {
        return Ok(None);
    };

    if token.status == TokenStatus::Active && token.is_past_expiry(now) {
        if store.expire_token(token.id, now).await? {
            tracing::info!(token_id = %token.id, "token expired on lookup");
            token.status = TokenStatus::Expired;
        } else if let Some(current) = store.get_token(token.id).await? {
            // another request moved it first; report what it landed on
            token = current;
        }
    }
    Ok(Some(token))
}

#[derive(Clone)]
pub struct ResolutionResolver {
    store: Arc<dyn TokenStore>,
    rules: RedirectRuleEngine,
    audit: Arc<dyn AuditSink>,
    public_base_url: String,
}

impl ResolutionResolver {
    pub fn new(
        store: Arc<dyn TokenStore>,
        rules: RedirectRuleEngine,
        audit: Arc<dyn AuditSink>,
        public_base_url: String,
    ) -> Self {
        Self {
            store,
            rules,
            audit,
            public_base_url,
        }
    }

    /// The scan primitive. Does not audit; see [`Self::resolve`].
    pub async fn resolve_token(&self, raw: &str, now: DateTime<Utc>) -> Result<ScanOutcome, AppError> {
        let Some(token) = find_by_raw(self.store.as_ref(), raw, now).await? else {
            return Ok(ScanOutcome::not_found());
        };

        match token.status {
            TokenStatus::Revoked | TokenStatus::Expired => Ok(ScanOutcome {
                status: token.status.into(),
                token: Some(token),
            }),
            TokenStatus::Active => match self.store.record_scan(token.id, now).await? {
                Some(updated) => Ok(ScanOutcome {
                    status: ScanStatus::Active,
                    token: Some(updated),
                }),
                None => {
                    // lost a race with revoke or expiry between read and write
                    let current = self.store.get_token(token.id).await?.unwrap_or(token);
                    Ok(ScanOutcome {
                        status: current.status.into(),
                        token: Some(current),
                    })
                }
            },
        }
    }

    /// Highest-precedence redirect for `token` at `at`. Read-only.
    pub async fn effective_redirect(
        &self,
        token: &Token,
        at: DateTime<Utc>,
    ) -> Result<EffectiveRedirect, AppError> {
        if let Some(url) = &token.redirect_url {
            return Ok(EffectiveRedirect {
                url: url.clone(),
                source: RedirectSource::Token,
                variant: None,
                rule_id: None,
            });
        }

        if let Some(rule) = self.rules.find_active_rule(&token.entity(), at).await? {
            return Ok(EffectiveRedirect {
                url: rule.redirect_url,
                source: RedirectSource::Group,
                variant: None,
                rule_id: Some(rule.id),
            });
        }

        if let Some(rule) = self.rules.fallback_rule(at).await? {
            return Ok(EffectiveRedirect {
                url: rule.redirect_url,
                source: RedirectSource::Default,
                variant: Some(DefaultVariant::Fallback),
                rule_id: Some(rule.id),
            });
        }

        Ok(EffectiveRedirect {
            url: token
                .entity_type
                .canonical_url(&self.public_base_url, &token.entity_id),
            source: RedirectSource::Default,
            variant: Some(DefaultVariant::Computed),
            rule_id: None,
        })
    }

    pub async fn resolve(&self, raw: &str) -> Result<Resolution, AppError> {
        self.resolve_at(raw, Utc::now()).await
    }

    /// Full public scan: primitive, redirect choice, one audit entry, metrics.
    pub async fn resolve_at(&self, raw: &str, now: DateTime<Utc>) -> Result<Resolution, AppError> {
        let outcome = self.resolve_token(raw, now).await?;
        metrics::record_scan(outcome.status.as_str());

        let Some(token) = outcome.token else {
            return Ok(Resolution {
                status: ScanStatus::NotFound,
                entity_type: None,
                entity_id: None,
                effective_redirect: None,
                message: Some(NOT_FOUND_MESSAGE.to_string()),
                scan_count: None,
            });
        };

        let (redirect, message) = match outcome.status {
            ScanStatus::Active => {
                let redirect = self.effective_redirect(&token, now).await?;
                metrics::record_redirect(redirect.source.as_str());
                (Some(redirect), None)
            }
            ScanStatus::Revoked => (
                None,
                Some(
                    token
                        .revoked_reason
                        .clone()
                        .filter(|r| !r.trim().is_empty())
                        .unwrap_or_else(|| REVOKED_MESSAGE.to_string()),
                ),
            ),
            ScanStatus::Expired | ScanStatus::NotFound => (None, Some(EXPIRED_MESSAGE.to_string())),
        };

        tracing::debug!(
            token_id = %token.id,
            status = outcome.status.as_str(),
            source = redirect.as_ref().map(|r| r.source.as_str()).unwrap_or("none"),
            "scan resolved"
        );

        self.audit.log(
            AuditEvent::new(
                AuditAction::TokenScanned,
                SCAN_ACTOR,
                format!("Scan of {} ({})", token.value, outcome.status.as_str()),
            )
            .on(token.entity_type, &token.entity_id)
            .with_metadata(json!({
                "token_id": token.id,
                "status": outcome.status,
                "scan_count": token.scan_count,
                "redirect_url": redirect.as_ref().map(|r| &r.url),
                "redirect_source": redirect.as_ref().map(|r| r.source),
                "rule_id": redirect.as_ref().and_then(|r| r.rule_id),
            }))
            .with_tags(&["scan"]),
        );

        Ok(Resolution {
            status: outcome.status,
            entity_type: Some(token.entity_type),
            entity_id: Some(token.entity_id),
            effective_redirect: redirect,
            message,
            scan_count: Some(token.scan_count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RuleCache;
    use crate::middleware::audit::MemoryAuditSink;
    use crate::middleware::rbac::Actor;
    use crate::models::token::EntityRef;
    use crate::registry::memory::StaticRegistry;
    use crate::service::lifecycle::{TokenLifecycle, TokenSpec};
    use crate::service::rules::RuleSpec;
    use crate::store::memory::MemoryStore;
    use chrono::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditSink>,
        lifecycle: TokenLifecycle,
        rules: RedirectRuleEngine,
        resolver: ResolutionResolver,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(StaticRegistry::new());
        registry.add_product("SKU-1", "Widget").add_batch("B1", "SKU-1", "Lot 1");
        let audit = Arc::new(MemoryAuditSink::new());
        let rules = RedirectRuleEngine::new(store.clone(), registry.clone(), audit.clone(), RuleCache::new(30));
        Harness {
            lifecycle: TokenLifecycle::new(store.clone(), registry, audit.clone()),
            resolver: ResolutionResolver::new(
                store.clone(),
                rules.clone(),
                audit.clone(),
                "https://labels.example.com".into(),
            ),
            rules,
            store,
            audit,
        }
    }

    #[tokio::test]
    async fn test_scan_then_revoke() {
        let h = harness();
        let actor = Actor::editor("printer");
        let token = h
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::product("SKU-1")), &actor)
            .await
            .unwrap();

        for _ in 0..3 {
            let r = h.resolver.resolve(&token.value).await.unwrap();
            assert_eq!(r.status, ScanStatus::Active);
        }
        let after = h.lifecycle.get_token(token.id).await.unwrap();
        assert_eq!(after.scan_count, 3);
        assert_eq!(after.status, TokenStatus::Active);

        h.lifecycle.revoke_token(token.id, "recall", &actor).await.unwrap();
        let r = h.resolver.resolve(&token.value).await.unwrap();
        assert_eq!(r.status, ScanStatus::Revoked);
        assert_eq!(r.message.as_deref(), Some("recall"));
        assert!(r.effective_redirect.is_none());
        assert_eq!(h.lifecycle.get_token(token.id).await.unwrap().scan_count, 3);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_values_are_not_found() {
        let h = harness();
        for raw in ["", "hello", "qr_short", "qr_ABCDEFGHIJKLMNOPQRSTU9"] {
            let r = h.resolver.resolve(raw).await.unwrap();
            assert_eq!(r.status, ScanStatus::NotFound);
            assert_eq!(r.message.as_deref(), Some(NOT_FOUND_MESSAGE));
            assert!(r.entity_id.is_none());
        }
        assert!(h.audit.events().is_empty());
    }

    #[tokio::test]
    async fn test_printed_url_resolves_like_bare_value() {
        let h = harness();
        let token = h
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::product("SKU-1")), &Actor::editor("p"))
            .await
            .unwrap();
        let r = h
            .resolver
            .resolve(&format!("https://labels.example.com/qr/{}?src=box", token.value))
            .await
            .unwrap();
        assert_eq!(r.status, ScanStatus::Active);
        assert_eq!(r.scan_count, Some(1));
    }

    #[tokio::test]
    async fn test_expired_scans_never_count() {
        let h = harness();
        let token = h
            .lifecycle
            .create_token(
                TokenSpec::new(EntityRef::product("SKU-1")).expiring_at(Utc::now() + Duration::days(30)),
                &Actor::editor("p"),
            )
            .await
            .unwrap();
        h.resolver.resolve(&token.value).await.unwrap();
        assert!(h.store.force_expiry(token.id, Utc::now() - Duration::seconds(1)).await);

        for _ in 0..3 {
            let r = h.resolver.resolve(&token.value).await.unwrap();
            assert_eq!(r.status, ScanStatus::Expired);
            assert_eq!(r.message.as_deref(), Some(EXPIRED_MESSAGE));
        }
        let stored = h.lifecycle.get_token(token.id).await.unwrap();
        assert_eq!(stored.status, TokenStatus::Expired);
        assert_eq!(stored.scan_count, 1);
    }

    #[tokio::test]
    async fn test_expiry_is_evaluated_against_scan_time() {
        let h = harness();
        let expires = Utc::now() + Duration::hours(1);
        let token = h
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::product("SKU-1")).expiring_at(expires), &Actor::editor("p"))
            .await
            .unwrap();
        let outcome = h.resolver.resolve_token(&token.value, expires).await.unwrap();
        assert_eq!(outcome.status, ScanStatus::Expired);
        assert_eq!(outcome.token.map(|t| t.scan_count), Some(0));
    }

    #[tokio::test]
    async fn test_token_override_beats_group_rule() {
        let h = harness();
        let actor = Actor::editor("ops");
        let token = h
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::product("SKU-1")), &actor)
            .await
            .unwrap();
        h.rules
            .create_rule(&EntityRef::product("SKU-1"), &RuleSpec::new("https://example.com/group"), &actor)
            .await
            .unwrap();

        let r = h.resolver.resolve(&token.value).await.unwrap();
        let redirect = r.effective_redirect.unwrap();
        assert_eq!(redirect.source, RedirectSource::Group);
        assert_eq!(redirect.url, "https://example.com/group");

        h.lifecycle
            .set_token_redirect(token.id, Some("https://example.com/mine"), &actor)
            .await
            .unwrap();
        let r = h.resolver.resolve(&token.value).await.unwrap();
        let redirect = r.effective_redirect.unwrap();
        assert_eq!(redirect.source, RedirectSource::Token);
        assert_eq!(redirect.url, "https://example.com/mine");
    }

    #[tokio::test]
    async fn test_future_rule_falls_through_to_default() {
        let h = harness();
        let actor = Actor::admin("ops");
        let token = h
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::batch("B1")), &actor)
            .await
            .unwrap();
        let later = RuleSpec::new("https://example.com/later").with_window(Some(Utc::now() + Duration::days(1)), None);
        h.rules.create_rule(&EntityRef::batch("B1"), &later, &actor).await.unwrap();

        let redirect = h.resolver.resolve(&token.value).await.unwrap().effective_redirect.unwrap();
        assert_eq!(redirect.source, RedirectSource::Default);
        assert_eq!(redirect.variant, Some(DefaultVariant::Computed));
        assert_eq!(redirect.url, "https://labels.example.com/batches/B1");

        h.rules
            .set_fallback_rule(&RuleSpec::new("https://example.com/fallback"), &actor)
            .await
            .unwrap();
        let redirect = h.resolver.resolve(&token.value).await.unwrap().effective_redirect.unwrap();
        assert_eq!(redirect.source, RedirectSource::Default);
        assert_eq!(redirect.variant, Some(DefaultVariant::Fallback));
        assert_eq!(redirect.url, "https://example.com/fallback");
    }

    #[tokio::test]
    async fn test_one_combined_audit_entry_per_scan() {
        let h = harness();
        let token = h
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::product("SKU-1")), &Actor::editor("p"))
            .await
            .unwrap();
        let before = h.audit.events().len();

        h.resolver.resolve(&token.value).await.unwrap();
        let events = h.audit.events();
        assert_eq!(events.len(), before + 1);
        let scan = events.last().unwrap();
        assert_eq!(scan.action, AuditAction::TokenScanned);
        assert_eq!(scan.actor, "public");
        assert_eq!(scan.metadata["redirect_source"], "DEFAULT");
        assert_eq!(scan.metadata["scan_count"], 1);
    }
}
