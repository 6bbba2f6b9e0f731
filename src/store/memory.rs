//! In-process `TokenStore` used by tests and `serve --memory`.
//!
//! All state sits behind one mutex, so each trait method observes and mutates
//! a consistent snapshot. That gives the same atomicity the Postgres store
//! gets from conditional UPDATEs and transactions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AssociateOutcome, AssociationChange, InsertRuleOutcome, RevokeOutcome, RuleFilter, TokenStore,
};
use crate::models::rule::{NewRule, RedirectRule};
use crate::models::token::{
    AssociationHistoryEntry, EntityRef, EntityType, NewToken, Page, Token, TokenStatus,
};

#[derive(Default)]
struct Inner {
    tokens: Vec<Token>,
    by_id: HashMap<Uuid, usize>,
    by_value: HashMap<String, usize>,
    history: HashMap<Uuid, Vec<AssociationHistoryEntry>>,
    rules: Vec<RedirectRule>,
}

impl Inner {
    fn token_mut(&mut self, id: Uuid) -> Option<&mut Token> {
        let idx = *self.by_id.get(&id)?;
        self.tokens.get_mut(idx)
    }

    fn token(&self, id: Uuid) -> Option<&Token> {
        self.by_id.get(&id).and_then(|i| self.tokens.get(*i))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens, for tests and debugging.
    pub async fn token_count(&self) -> usize {
        self.inner.lock().await.tokens.len()
    }

    /// Total rules stored, active or not.
    pub async fn rule_count(&self) -> usize {
        self.inner.lock().await.rules.len()
    }

    /// Backdate a token's expiry. Test helper for exercising lazy expiry
    /// without waiting on the clock.
    pub async fn force_expiry(&self, id: Uuid, expires_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.token_mut(id) {
            Some(t) => {
                t.expires_at = Some(expires_at);
                true
            }
            None => false,
        }
    }
}

fn paginate<T: Clone>(items: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    items
        .skip(page.offset() as usize)
        .take(page.limit() as usize)
        .collect()
}

fn materialize(rule: &NewRule, now: DateTime<Utc>) -> RedirectRule {
    RedirectRule {
        id: Uuid::new_v4(),
        entity_type: rule.scope.as_ref().map(|s| s.entity_type),
        entity_id: rule.scope.as_ref().map(|s| s.entity_id.clone()),
        redirect_url: rule.redirect_url.clone(),
        reason: rule.reason.clone(),
        starts_at: rule.window.starts_at,
        ends_at: rule.window.ends_at,
        active: true,
        is_fallback: rule.is_fallback,
        created_by: rule.created_by.clone(),
        created_at: now,
        deactivated_at: None,
        deactivated_by: None,
    }
}

fn rule_in_scope(rule: &RedirectRule, entity: &EntityRef) -> bool {
    rule.entity_type == Some(entity.entity_type) && rule.entity_id.as_deref() == Some(&entity.entity_id)
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_tokens(&self, tokens: &[NewToken]) -> anyhow::Result<Vec<Token>> {
        let mut inner = self.inner.lock().await;

        // validate the whole run before writing anything
        let mut seen = std::collections::HashSet::new();
        for t in tokens {
            if inner.by_value.contains_key(&t.value) || !seen.insert(t.value.as_str()) {
                anyhow::bail!("duplicate token value {}", t.value);
            }
        }

        let mut created = Vec::with_capacity(tokens.len());
        for t in tokens {
            let token = Token {
                id: Uuid::new_v4(),
                value: t.value.clone(),
                entity_type: t.entity.entity_type,
                entity_id: t.entity.entity_id.clone(),
                version_id: t.version_id.clone(),
                status: TokenStatus::Active,
                redirect_url: None,
                scan_count: 0,
                last_scanned_at: None,
                printed_at: t.printed_at,
                expires_at: t.expires_at,
                revoked_at: None,
                revoked_reason: None,
                created_by: t.created_by.clone(),
            };
            let idx = inner.tokens.len();
            inner.by_id.insert(token.id, idx);
            inner.by_value.insert(token.value.clone(), idx);
            inner.tokens.push(token.clone());
            created.push(token);
        }
        Ok(created)
    }

    async fn get_token(&self, id: Uuid) -> anyhow::Result<Option<Token>> {
        Ok(self.inner.lock().await.token(id).cloned())
    }

    async fn get_token_by_value(&self, value: &str) -> anyhow::Result<Option<Token>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_value
            .get(value)
            .and_then(|i| inner.tokens.get(*i))
            .cloned())
    }

    async fn list_tokens_for_entity(
        &self,
        entity: &EntityRef,
        page: Page,
    ) -> anyhow::Result<Vec<Token>> {
        let inner = self.inner.lock().await;
        let matching = inner
            .tokens
            .iter()
            .rev()
            .filter(|t| t.entity_type == entity.entity_type && t.entity_id == entity.entity_id)
            .cloned();
        Ok(paginate(matching, page))
    }

    async fn list_tokens_by_type(
        &self,
        entity_type: EntityType,
        entity_id: Option<&str>,
        status: Option<TokenStatus>,
        page: Page,
    ) -> anyhow::Result<Vec<Token>> {
        let inner = self.inner.lock().await;
        let matching = inner
            .tokens
            .iter()
            .rev()
            .filter(|t| t.entity_type == entity_type)
            .filter(|t| entity_id.map(|id| t.entity_id == id).unwrap_or(true))
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .cloned();
        Ok(paginate(matching, page))
    }

    async fn record_scan(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<Option<Token>> {
        let mut inner = self.inner.lock().await;
        match inner.token_mut(id) {
            Some(t) if t.status == TokenStatus::Active => {
                t.scan_count += 1;
                t.last_scanned_at = Some(at);
                Ok(Some(t.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn expire_token(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.token_mut(id) {
            Some(t) if t.status == TokenStatus::Active && t.is_past_expiry(at) => {
                t.status = TokenStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_due_tokens(&self, at: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut n = 0;
        for t in inner.tokens.iter_mut() {
            if t.status == TokenStatus::Active && t.is_past_expiry(at) {
                t.status = TokenStatus::Expired;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn revoke_token(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<RevokeOutcome> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.token_mut(id) {
            None => RevokeOutcome::NotFound,
            Some(t) if t.status != TokenStatus::Active => RevokeOutcome::NotActive(t.clone()),
            Some(t) => {
                t.status = TokenStatus::Revoked;
                t.revoked_at = Some(at);
                t.revoked_reason = Some(reason.to_string());
                RevokeOutcome::Revoked(t.clone())
            }
        })
    }

    async fn revoke_tokens_for_entity(
        &self,
        entity: &EntityRef,
        reason: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut n = 0;
        for t in inner.tokens.iter_mut().filter(|t| {
            t.status == TokenStatus::Active
                && t.entity_type == entity.entity_type
                && t.entity_id == entity.entity_id
        }) {
            t.status = TokenStatus::Revoked;
            t.revoked_at = Some(at);
            t.revoked_reason = Some(reason.to_string());
            n += 1;
        }
        Ok(n)
    }

    async fn set_token_redirect(
        &self,
        id: Uuid,
        redirect_url: Option<&str>,
    ) -> anyhow::Result<Option<Token>> {
        let mut inner = self.inner.lock().await;
        match inner.token_mut(id) {
            Some(t) if t.status == TokenStatus::Active => {
                t.redirect_url = redirect_url.map(String::from);
                Ok(Some(t.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn associate_token(
        &self,
        change: &AssociationChange,
    ) -> anyhow::Result<AssociateOutcome> {
        let mut inner = self.inner.lock().await;
        let token = match inner.token_mut(change.token_id) {
            None => return Ok(AssociateOutcome::NotFound),
            Some(t) => t,
        };
        if token.status != TokenStatus::Active || token.entity() != change.expected {
            return Ok(AssociateOutcome::Stale);
        }
        token.entity_type = change.target.entity_type;
        token.entity_id = change.target.entity_id.clone();
        let updated = token.clone();

        let entries = inner.history.entry(change.token_id).or_default();
        let entry = AssociationHistoryEntry {
            token_id: change.token_id,
            seq: entries.len() as i32 + 1,
            timestamp: change.at,
            previous_entity_type: change.expected.entity_type,
            previous_entity_id: change.expected.entity_id.clone(),
            new_entity_type: change.target.entity_type,
            new_entity_id: change.target.entity_id.clone(),
            actor: change.actor.clone(),
            reason: change.reason.clone(),
            admin_override: change.admin_override,
        };
        entries.push(entry.clone());
        Ok(AssociateOutcome::Associated(updated, entry))
    }

    async fn token_history(&self, id: Uuid) -> anyhow::Result<Vec<AssociationHistoryEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.history.get(&id).cloned().unwrap_or_default())
    }

    async fn insert_rule(&self, rule: &NewRule) -> anyhow::Result<InsertRuleOutcome> {
        let scope = rule
            .scope
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("scoped rule insert without a scope"))?;
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .rules
            .iter()
            .find(|r| r.active && rule_in_scope(r, scope))
        {
            return Ok(InsertRuleOutcome::ActiveExists(Some(existing.id)));
        }
        let created = materialize(rule, Utc::now());
        inner.rules.push(created.clone());
        Ok(InsertRuleOutcome::Created(created))
    }

    async fn get_rule(&self, id: Uuid) -> anyhow::Result<Option<RedirectRule>> {
        let inner = self.inner.lock().await;
        Ok(inner.rules.iter().find(|r| r.id == id).cloned())
    }

    async fn active_rules_for(&self, entity: &EntityRef) -> anyhow::Result<Vec<RedirectRule>> {
        let inner = self.inner.lock().await;
        let mut rules: Vec<_> = inner
            .rules
            .iter()
            .filter(|r| r.active && rule_in_scope(r, entity))
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rules)
    }

    async fn list_rules(
        &self,
        filter: &RuleFilter,
        page: Page,
    ) -> anyhow::Result<Vec<RedirectRule>> {
        let inner = self.inner.lock().await;
        let matching = inner
            .rules
            .iter()
            .rev()
            .filter(|r| !filter.active_only || r.active)
            .filter(|r| !filter.fallback_only || r.is_fallback)
            .filter(|r| filter.scope.as_ref().map(|s| rule_in_scope(r, s)).unwrap_or(true))
            .cloned();
        Ok(paginate(matching, page))
    }

    async fn deactivate_rule(
        &self,
        id: Uuid,
        actor: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<RedirectRule>> {
        let mut inner = self.inner.lock().await;
        match inner.rules.iter_mut().find(|r| r.id == id && r.active) {
            Some(r) => {
                r.active = false;
                r.is_fallback = false;
                r.deactivated_at = Some(at);
                r.deactivated_by = Some(actor.to_string());
                Ok(Some(r.clone()))
            }
            None => Ok(None),
        }
    }

    async fn get_fallback_rule(&self) -> anyhow::Result<Option<RedirectRule>> {
        let inner = self.inner.lock().await;
        Ok(inner.rules.iter().find(|r| r.is_fallback).cloned())
    }

    async fn replace_fallback_rule(&self, rule: &NewRule) -> anyhow::Result<RedirectRule> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        for r in inner.rules.iter_mut().filter(|r| r.is_fallback) {
            r.is_fallback = false;
            r.active = false;
            r.deactivated_at = Some(now);
            r.deactivated_by = Some(rule.created_by.clone());
        }
        let created = materialize(rule, now);
        inner.rules.push(created.clone());
        Ok(created)
    }

    async fn clear_fallback_rule(
        &self,
        actor: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<RedirectRule>> {
        let mut inner = self.inner.lock().await;
        match inner.rules.iter_mut().find(|r| r.is_fallback) {
            Some(r) => {
                r.is_fallback = false;
                r.active = false;
                r.deactivated_at = Some(at);
                r.deactivated_by = Some(actor.to_string());
                Ok(Some(r.clone()))
            }
            None => Ok(None),
        }
    }
}
