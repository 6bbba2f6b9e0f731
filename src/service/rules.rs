//! Scoped, time-windowed redirect rules and the single system fallback.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use super::{optional_text, validate_redirect_url};
use crate::cache::{RuleCache, FALLBACK_KEY};
use crate::errors::AppError;
use crate::middleware::audit::AuditSink;
use crate::middleware::metrics;
use crate::middleware::rbac::{Actor, Permission};
use crate::models::audit::{AuditAction, AuditEvent};
use crate::models::rule::{
    BulkCreateResult, BulkItemError, NewRule, RedirectRule, RuleWindow, SkippedItem,
};
use crate::models::token::{EntityRef, EntityType, Page};
use crate::registry::EntityRegistry;
use crate::store::{InsertRuleOutcome, RuleFilter, TokenStore};

pub const MAX_BULK_ENTITIES: usize = 1000;

/// Shared parameters of a rule request.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub redirect_url: String,
    pub reason: Option<String>,
    pub window: RuleWindow,
}

impl RuleSpec {
    pub fn new(redirect_url: impl Into<String>) -> Self {
        Self {
            redirect_url: redirect_url.into(),
            reason: None,
            window: RuleWindow::default(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_window(mut self, starts_at: Option<DateTime<Utc>>, ends_at: Option<DateTime<Utc>>) -> Self {
        self.window = RuleWindow { starts_at, ends_at };
        self
    }

    fn validated(&self) -> Result<RuleSpec, AppError> {
        if !self.window.is_well_formed() {
            return Err(AppError::invalid("ends_at must be after starts_at"));
        }
        Ok(RuleSpec {
            redirect_url: validate_redirect_url(&self.redirect_url)?,
            reason: optional_text(self.reason.clone()),
            window: self.window,
        })
    }
}

#[derive(Clone)]
pub struct RedirectRuleEngine {
    store: Arc<dyn TokenStore>,
    registry: Arc<dyn EntityRegistry>,
    audit: Arc<dyn AuditSink>,
    cache: RuleCache,
}

impl RedirectRuleEngine {
    pub fn new(
        store: Arc<dyn TokenStore>,
        registry: Arc<dyn EntityRegistry>,
        audit: Arc<dyn AuditSink>,
        cache: RuleCache,
    ) -> Self {
        Self {
            store,
            registry,
            audit,
            cache,
        }
    }

    pub fn cache(&self) -> &RuleCache {
        &self.cache
    }

    async fn active_rules(&self, entity: &EntityRef) -> anyhow::Result<Vec<RedirectRule>> {
        let key = RuleCache::scope_key(entity);
        if let Some(rules) = self.cache.get(&key) {
            return Ok(rules);
        }
        let rules = self.store.active_rules_for(entity).await?;
        self.cache.set(&key, rules.clone());
        Ok(rules)
    }

    /// The ACTIVE rule for `entity` whose window contains `at`.
    ///
    /// Should a write race ever leave two ACTIVE rules on one entity, the most
    /// recently created one wins instead of failing the read.
    pub async fn find_active_rule(
        &self,
        entity: &EntityRef,
        at: DateTime<Utc>,
    ) -> Result<Option<RedirectRule>, AppError> {
        let rules = self.active_rules(entity).await?;
        if rules.len() > 1 {
            tracing::warn!(
                entity = %entity,
                count = rules.len(),
                "multiple active redirect rules; using the newest"
            );
        }
        // newest first
        Ok(rules.into_iter().find(|r| r.is_effective_at(at)))
    }

    /// The designated fallback regardless of its window. Admin view; scans use
    /// [`RedirectRuleEngine::fallback_rule`].
    pub async fn configured_fallback(&self) -> Result<Option<RedirectRule>, AppError> {
        Ok(self.store.get_fallback_rule().await?)
    }

    /// The system fallback, if one is configured and effective at `at`.
    pub async fn fallback_rule(&self, at: DateTime<Utc>) -> Result<Option<RedirectRule>, AppError> {
        let rules = match self.cache.get(FALLBACK_KEY) {
            Some(r) => r,
            None => {
                let r: Vec<_> = self.store.get_fallback_rule().await?.into_iter().collect();
                self.cache.set(FALLBACK_KEY, r.clone());
                r
            }
        };
        Ok(rules.into_iter().find(|r| r.is_effective_at(at)))
    }

    /// Create one scoped rule. A scope that already holds an ACTIVE rule is a
    /// CONFLICT here; the bulk variant turns the same condition into a skip.
    pub async fn create_rule(
        &self,
        entity: &EntityRef,
        spec: &RuleSpec,
        actor: &Actor,
    ) -> Result<RedirectRule, AppError> {
        actor.require(Permission::Write)?;
        let spec = spec.validated()?;
        if !self.registry.exists(entity).await? {
            return Err(AppError::not_found(format!("entity {} not found", entity)));
        }

        match self.insert_scoped(entity, &spec, actor).await? {
            InsertRuleOutcome::Created(rule) => {
                self.audit.log(
                    AuditEvent::new(
                        AuditAction::RuleCreated,
                        &actor.id,
                        format!("Redirect rule for {} -> {}", entity, rule.redirect_url),
                    )
                    .on(entity.entity_type, &entity.entity_id)
                    .with_metadata(json!({ "rule_id": rule.id, "reason": rule.reason }))
                    .with_tags(&["redirect", "rule"]),
                );
                Ok(rule)
            }
            InsertRuleOutcome::ActiveExists(existing) => Err(AppError::conflict(format!(
                "{} already has an active redirect rule{}",
                entity,
                existing.map(|id| format!(" ({})", id)).unwrap_or_default()
            ))),
        }
    }

    async fn insert_scoped(
        &self,
        entity: &EntityRef,
        spec: &RuleSpec,
        actor: &Actor,
    ) -> anyhow::Result<InsertRuleOutcome> {
        let outcome = self
            .store
            .insert_rule(&NewRule {
                scope: Some(entity.clone()),
                redirect_url: spec.redirect_url.clone(),
                reason: spec.reason.clone(),
                window: spec.window,
                is_fallback: false,
                created_by: actor.id.clone(),
            })
            .await?;
        if let InsertRuleOutcome::Created(rule) = &outcome {
            self.cache.invalidate_rule(rule);
            tracing::info!(rule_id = %rule.id, entity = %entity, actor = %actor.id, "redirect rule created");
        }
        Ok(outcome)
    }

    /// Create one rule per entity. Entities already holding an ACTIVE rule are
    /// skipped; other per-entity failures land in `errors`. Attempts are
    /// independent, so partial success is a normal result.
    pub async fn bulk_create_rules(
        &self,
        scope_type: EntityType,
        entity_ids: &[String],
        spec: &RuleSpec,
        actor: &Actor,
    ) -> Result<BulkCreateResult, AppError> {
        actor.require(Permission::Write)?;
        let spec = spec.validated()?;
        if entity_ids.is_empty() {
            return Err(AppError::invalid("at least one entity id is required"));
        }
        if entity_ids.len() > MAX_BULK_ENTITIES {
            return Err(AppError::invalid(format!(
                "at most {} entities per bulk request",
                MAX_BULK_ENTITIES
            )));
        }

        let mut result = BulkCreateResult::default();
        let mut seen = HashSet::new();

        for raw_id in entity_ids {
            let id = raw_id.trim();
            if !seen.insert(id.to_string()) {
                continue;
            }
            if id.is_empty() {
                result.errors.push(BulkItemError {
                    entity_id: raw_id.clone(),
                    code: "invalid_input".into(),
                    message: "entity id must not be empty".into(),
                });
                continue;
            }
            let entity = EntityRef::new(scope_type, id);

            match self.bulk_attempt(&entity, &spec, actor).await {
                Ok(InsertRuleOutcome::Created(rule)) => result.created_rules.push(rule),
                Ok(InsertRuleOutcome::ActiveExists(existing)) => {
                    result.skipped_items.push(SkippedItem {
                        entity_id: id.to_string(),
                        existing_rule_id: existing,
                        reason: "entity already has an active redirect rule".into(),
                    });
                }
                Err(e) => {
                    if matches!(e, AppError::Database(_) | AppError::Internal(_)) {
                        tracing::error!(entity = %entity, "bulk rule create failed: {}", e);
                    }
                    result.errors.push(BulkItemError {
                        entity_id: id.to_string(),
                        code: e.code().to_string(),
                        message: e.public_message(),
                    });
                }
            }
        }

        result.created = result.created_rules.len();
        result.skipped = result.skipped_items.len();
        metrics::record_rule_skips(result.skipped as u64);

        tracing::info!(
            scope = %scope_type,
            created = result.created,
            skipped = result.skipped,
            errors = result.errors.len(),
            actor = %actor.id,
            "bulk redirect rule request finished"
        );
        if result.created > 0 {
            self.audit.log(
                AuditEvent::new(
                    AuditAction::RulesBulkCreated,
                    &actor.id,
                    format!(
                        "Bulk redirect to {}: {} created, {} skipped, {} failed",
                        spec.redirect_url,
                        result.created,
                        result.skipped,
                        result.errors.len()
                    ),
                )
                .with_metadata(json!({
                    "scope_type": scope_type,
                    "redirect_url": spec.redirect_url,
                    "reason": spec.reason,
                    "created": result.created_rules.iter().map(|r| &r.entity_id).collect::<Vec<_>>(),
                    "skipped": result.skipped_items.iter().map(|s| &s.entity_id).collect::<Vec<_>>(),
                }))
                .with_tags(&["redirect", "rule", "bulk"]),
            );
        }
        Ok(result)
    }

    async fn bulk_attempt(
        &self,
        entity: &EntityRef,
        spec: &RuleSpec,
        actor: &Actor,
    ) -> Result<InsertRuleOutcome, AppError> {
        if !self.registry.exists(entity).await? {
            return Err(AppError::not_found(format!("entity {} not found", entity)));
        }
        Ok(self.insert_scoped(entity, spec, actor).await?)
    }

    /// Retract a rule. Rules are never deleted.
    pub async fn deactivate_rule(&self, id: Uuid, actor: &Actor) -> Result<RedirectRule, AppError> {
        actor.require(Permission::Write)?;

        let Some(existing) = self.store.get_rule(id).await? else {
            return Err(AppError::not_found(format!("redirect rule {} not found", id)));
        };
        // Retiring the fallback through here is the same change as clearing it.
        if existing.is_fallback {
            actor.require(Permission::Privileged)?;
        }

        let Some(rule) = self.store.deactivate_rule(id, &actor.id, Utc::now()).await? else {
            return Err(AppError::conflict("redirect rule is already inactive"));
        };
        if existing.is_fallback {
            self.cache.invalidate(FALLBACK_KEY);
        } else {
            self.cache.invalidate_rule(&rule);
        }

        tracing::info!(rule_id = %id, actor = %actor.id, fallback = existing.is_fallback, "redirect rule deactivated");
        let action = if existing.is_fallback {
            AuditAction::FallbackRuleCleared
        } else {
            AuditAction::RuleDeactivated
        };
        let mut event = AuditEvent::new(
            action,
            &actor.id,
            format!("Deactivated redirect rule {}", id),
        )
        .with_metadata(json!({ "rule_id": rule.id, "redirect_url": rule.redirect_url }))
        .with_tags(&["redirect", "rule"]);
        if let Some(scope) = rule.scope() {
            event = event.on(scope.entity_type, scope.entity_id);
        }
        self.audit.log(event);
        Ok(rule)
    }

    /// Designate a new system fallback, retiring the previous one atomically.
    pub async fn set_fallback_rule(&self, spec: &RuleSpec, actor: &Actor) -> Result<RedirectRule, AppError> {
        actor.require(Permission::Privileged)?;
        let spec = spec.validated()?;

        let rule = self
            .store
            .replace_fallback_rule(&NewRule {
                scope: None,
                redirect_url: spec.redirect_url.clone(),
                reason: spec.reason.clone(),
                window: spec.window,
                is_fallback: true,
                created_by: actor.id.clone(),
            })
            .await?;
        self.cache.invalidate(FALLBACK_KEY);

        tracing::info!(rule_id = %rule.id, url = %rule.redirect_url, actor = %actor.id, "fallback rule set");
        self.audit.log(
            AuditEvent::new(
                AuditAction::FallbackRuleSet,
                &actor.id,
                format!("Fallback redirect set to {}", rule.redirect_url),
            )
            .with_metadata(json!({ "rule_id": rule.id, "reason": rule.reason }))
            .with_tags(&["redirect", "fallback"]),
        );
        Ok(rule)
    }

    pub async fn clear_fallback_rule(&self, actor: &Actor) -> Result<Option<RedirectRule>, AppError> {
        actor.require(Permission::Privileged)?;
        let cleared = self.store.clear_fallback_rule(&actor.id, Utc::now()).await?;
        self.cache.invalidate(FALLBACK_KEY);

        if let Some(rule) = &cleared {
            tracing::info!(rule_id = %rule.id, actor = %actor.id, "fallback rule cleared");
            self.audit.log(
                AuditEvent::new(AuditAction::FallbackRuleCleared, &actor.id, "Fallback redirect cleared")
                    .with_metadata(json!({ "rule_id": rule.id }))
                    .with_tags(&["redirect", "fallback"]),
            );
        }
        Ok(cleared)
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<RedirectRule, AppError> {
        self.store
            .get_rule(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("redirect rule {} not found", id)))
    }

    pub async fn list_rules(&self, filter: &RuleFilter, page: Page) -> Result<Vec<RedirectRule>, AppError> {
        Ok(self.store.list_rules(filter, page).await?)
    }
}
