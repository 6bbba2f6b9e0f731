pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::rule::{NewRule, RedirectRule};
use crate::models::token::{
    AssociationHistoryEntry, EntityRef, EntityType, NewToken, Page, Token, TokenStatus,
};

/// Outcome of a conditional ACTIVE → REVOKED transition.
#[derive(Debug, Clone)]
pub enum RevokeOutcome {
    Revoked(Token),
    /// Token exists but was not ACTIVE; nothing was written.
    NotActive(Token),
    NotFound,
}

/// Outcome of a conditional entity-pointer move.
#[derive(Debug, Clone)]
pub enum AssociateOutcome {
    Associated(Token, AssociationHistoryEntry),
    /// Token changed (status or entity) since the caller read it.
    Stale,
    NotFound,
}

/// Outcome of a rule insert guarded by the one-active-rule-per-entity constraint.
#[derive(Debug, Clone)]
pub enum InsertRuleOutcome {
    Created(RedirectRule),
    ActiveExists(Option<Uuid>),
}

/// Filter for rule listings.
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub scope: Option<EntityRef>,
    pub active_only: bool,
    pub fallback_only: bool,
}

/// A pending association write.
#[derive(Debug, Clone)]
pub struct AssociationChange {
    pub token_id: Uuid,
    pub expected: EntityRef,
    pub target: EntityRef,
    pub actor: String,
    pub reason: Option<String>,
    pub admin_override: bool,
    pub at: DateTime<Utc>,
}

/// Persistence for tokens and redirect rules.
///
/// Every state-changing method is a single conditional write: callers never
/// load-modify-save, so concurrent scans and admin actions cannot lose updates.
#[async_trait]
pub trait TokenStore: Send + Sync {
    // -- Tokens --

    /// Insert all tokens or none.
    async fn insert_tokens(&self, tokens: &[NewToken]) -> anyhow::Result<Vec<Token>>;

    async fn get_token(&self, id: Uuid) -> anyhow::Result<Option<Token>>;

    async fn get_token_by_value(&self, value: &str) -> anyhow::Result<Option<Token>>;

    async fn list_tokens_for_entity(
        &self,
        entity: &EntityRef,
        page: Page,
    ) -> anyhow::Result<Vec<Token>>;

    /// Tokens of one entity type, optionally narrowed to one entity id and/or status.
    async fn list_tokens_by_type(
        &self,
        entity_type: EntityType,
        entity_id: Option<&str>,
        status: Option<TokenStatus>,
        page: Page,
    ) -> anyhow::Result<Vec<Token>>;

    /// Increment `scan_count` and stamp `last_scanned_at` iff the token is
    /// ACTIVE. Returns the updated row, or `None` when nothing was written.
    async fn record_scan(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<Option<Token>>;

    /// ACTIVE → EXPIRED iff still ACTIVE and `expires_at <= at`.
    /// Returns whether this call performed the transition.
    async fn expire_token(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<bool>;

    /// Applies `expire_token` to every overdue ACTIVE token.
    async fn expire_due_tokens(&self, at: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn revoke_token(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<RevokeOutcome>;

    /// Revoke every ACTIVE token of the entity; returns the count transitioned.
    async fn revoke_tokens_for_entity(
        &self,
        entity: &EntityRef,
        reason: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Set or clear the per-token override iff the token is ACTIVE.
    async fn set_token_redirect(
        &self,
        id: Uuid,
        redirect_url: Option<&str>,
    ) -> anyhow::Result<Option<Token>>;

    /// Move the entity pointer iff the token is ACTIVE and still points at
    /// `change.expected`, appending one history entry in the same unit.
    async fn associate_token(&self, change: &AssociationChange)
        -> anyhow::Result<AssociateOutcome>;

    async fn token_history(&self, id: Uuid) -> anyhow::Result<Vec<AssociationHistoryEntry>>;

    // -- Redirect rules --

    /// Insert a scoped rule unless the scope already holds an ACTIVE rule.
    async fn insert_rule(&self, rule: &NewRule) -> anyhow::Result<InsertRuleOutcome>;

    async fn get_rule(&self, id: Uuid) -> anyhow::Result<Option<RedirectRule>>;

    /// ACTIVE scoped rules for an entity, newest first.
    async fn active_rules_for(&self, entity: &EntityRef) -> anyhow::Result<Vec<RedirectRule>>;

    async fn list_rules(&self, filter: &RuleFilter, page: Page)
        -> anyhow::Result<Vec<RedirectRule>>;

    /// `active = false` and `is_fallback = false`; returns `None` if the
    /// rule does not exist or was already inactive.
    async fn deactivate_rule(
        &self,
        id: Uuid,
        actor: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<RedirectRule>>;

    async fn get_fallback_rule(&self) -> anyhow::Result<Option<RedirectRule>>;

    /// Retire any current fallback and insert `rule` as the new one, atomically.
    async fn replace_fallback_rule(&self, rule: &NewRule) -> anyhow::Result<RedirectRule>;

    /// Retire the current fallback, if any.
    async fn clear_fallback_rule(
        &self,
        actor: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<RedirectRule>>;
}
