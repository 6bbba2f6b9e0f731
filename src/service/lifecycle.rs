//! Token creation and revocation.
//!
//! Creation is reserved for the label rendering workflow: a token exists only
//! because a label carrying it was printed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use super::{generator, optional_text, require_reason, validate_redirect_url};
use crate::errors::AppError;
use crate::middleware::audit::AuditSink;
use crate::middleware::metrics;
use crate::middleware::rbac::{Actor, Permission};
use crate::models::audit::{AuditAction, AuditEvent};
use crate::models::token::{
    AssociationHistoryEntry, EntityRef, NewToken, Page, Token, TokenDetail, TokenStatus,
};
use crate::registry::EntityRegistry;
use crate::store::{RevokeOutcome, TokenStore};

pub const MAX_BATCH_QUANTITY: u32 = 1000;

/// What a print run is for.
#[derive(Debug, Clone)]
pub struct TokenSpec {
    pub entity: EntityRef,
    pub version_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSpec {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            version_id: None,
            expires_at: None,
        }
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

#[derive(Clone)]
pub struct TokenLifecycle {
    store: Arc<dyn TokenStore>,
    registry: Arc<dyn EntityRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl TokenLifecycle {
    pub fn new(
        store: Arc<dyn TokenStore>,
        registry: Arc<dyn EntityRegistry>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            registry,
            audit,
        }
    }

    /// Validate the spec and confirm the target entity exists.
    async fn prepare(&self, spec: &TokenSpec, actor: &Actor, now: DateTime<Utc>) -> Result<(), AppError> {
        actor.require(Permission::Write)?;

        if spec.entity.entity_id.trim().is_empty() {
            return Err(AppError::invalid("entity id must not be empty"));
        }
        if let Some(expires_at) = spec.expires_at {
            if expires_at <= now {
                return Err(AppError::invalid("expires_at must be in the future"));
            }
        }
        if !self.registry.exists(&spec.entity).await? {
            return Err(AppError::not_found(format!("entity {} not found", spec.entity)));
        }
        Ok(())
    }

    fn new_tokens(&self, spec: &TokenSpec, quantity: usize, actor: &Actor, now: DateTime<Utc>) -> Vec<NewToken> {
        let mut values = HashSet::with_capacity(quantity);
        while values.len() < quantity {
            values.insert(generator::generate());
        }
        values
            .into_iter()
            .map(|value| NewToken {
                value,
                entity: spec.entity.clone(),
                version_id: optional_text(spec.version_id.clone()),
                expires_at: spec.expires_at,
                printed_at: now,
                created_by: actor.id.clone(),
            })
            .collect()
    }

    /// Persist one ACTIVE token for an existing entity.
    pub async fn create_token(&self, spec: TokenSpec, actor: &Actor) -> Result<Token, AppError> {
        let now = Utc::now();
        self.prepare(&spec, actor, now).await?;

        let new = self.new_tokens(&spec, 1, actor, now);
        let token = self
            .store
            .insert_tokens(&new)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("token insert returned no row"))?;

        tracing::info!(token_id = %token.id, entity = %spec.entity, actor = %actor.id, "token created");
        metrics::record_tokens_created(1);
        self.audit.log(
            AuditEvent::new(
                AuditAction::TokenCreated,
                &actor.id,
                format!("Created token {} for {}", token.value, spec.entity),
            )
            .on(spec.entity.entity_type, &spec.entity.entity_id)
            .with_metadata(json!({
                "token_id": token.id,
                "version_id": token.version_id,
                "expires_at": token.expires_at,
            }))
            .with_tags(&["token", "print"]),
        );
        Ok(token)
    }

    /// Persist `quantity` tokens from one print run, all or nothing.
    pub async fn create_token_batch(
        &self,
        spec: TokenSpec,
        quantity: u32,
        actor: &Actor,
    ) -> Result<Vec<Token>, AppError> {
        if quantity == 0 || quantity > MAX_BATCH_QUANTITY {
            return Err(AppError::invalid(format!(
                "quantity must be between 1 and {}",
                MAX_BATCH_QUANTITY
            )));
        }
        let now = Utc::now();
        self.prepare(&spec, actor, now).await?;

        let new = self.new_tokens(&spec, quantity as usize, actor, now);
        let tokens = self.store.insert_tokens(&new).await?;

        tracing::info!(
            entity = %spec.entity,
            quantity,
            actor = %actor.id,
            "token batch created"
        );
        metrics::record_tokens_created(tokens.len() as u64);
        // one summary entry for the whole run
        self.audit.log(
            AuditEvent::new(
                AuditAction::TokenBatchCreated,
                &actor.id,
                format!("Created {} tokens for {}", tokens.len(), spec.entity),
            )
            .on(spec.entity.entity_type, &spec.entity.entity_id)
            .with_metadata(json!({
                "quantity": tokens.len(),
                "version_id": spec.version_id,
                "expires_at": spec.expires_at,
                "first_token_id": tokens.first().map(|t| t.id),
                "last_token_id": tokens.last().map(|t| t.id),
            }))
            .with_tags(&["token", "print", "batch"]),
        );
        Ok(tokens)
    }

    pub async fn revoke_token(&self, id: Uuid, reason: &str, actor: &Actor) -> Result<Token, AppError> {
        actor.require(Permission::Write)?;
        let reason = require_reason(reason, "revoke a token")?;

        match self.store.revoke_token(id, &reason, Utc::now()).await? {
            RevokeOutcome::NotFound => Err(AppError::not_found(format!("token {} not found", id))),
            RevokeOutcome::NotActive(token) => {
                tracing::warn!(token_id = %id, status = token.status.as_str(), "revoke rejected: token not active");
                Err(AppError::conflict(match token.status {
                    TokenStatus::Revoked => "token is already revoked",
                    _ => "token is expired and cannot be revoked",
                }))
            }
            RevokeOutcome::Revoked(token) => {
                tracing::info!(token_id = %id, actor = %actor.id, reason = %reason, "token revoked");
                metrics::record_tokens_revoked(1);
                self.audit.log(
                    AuditEvent::new(
                        AuditAction::TokenRevoked,
                        &actor.id,
                        format!("Revoked token {}: {}", token.value, reason),
                    )
                    .on(token.entity_type, &token.entity_id)
                    .with_metadata(json!({ "token_id": token.id, "reason": reason }))
                    .with_tags(&["token", "revocation"]),
                );
                Ok(token)
            }
        }
    }

    /// Revoke every ACTIVE token of an entity. Returns how many changed.
    pub async fn revoke_tokens_by_entity(
        &self,
        entity: &EntityRef,
        reason: &str,
        actor: &Actor,
    ) -> Result<u64, AppError> {
        actor.require(Permission::Write)?;
        let reason = require_reason(reason, "revoke tokens")?;

        let count = self
            .store
            .revoke_tokens_for_entity(entity, &reason, Utc::now())
            .await?;

        if count > 0 {
            tracing::info!(entity = %entity, count, actor = %actor.id, "tokens revoked for entity");
            metrics::record_tokens_revoked(count);
            self.audit.log(
                AuditEvent::new(
                    AuditAction::TokensRevokedByEntity,
                    &actor.id,
                    format!("Revoked {} tokens for {}: {}", count, entity, reason),
                )
                .on(entity.entity_type, &entity.entity_id)
                .with_metadata(json!({ "count": count, "reason": reason }))
                .with_tags(&["token", "revocation", "bulk"]),
            );
        }
        Ok(count)
    }

    /// Set (or clear with `None`) the per-token redirect override.
    pub async fn set_token_redirect(
        &self,
        id: Uuid,
        redirect_url: Option<&str>,
        actor: &Actor,
    ) -> Result<Token, AppError> {
        actor.require(Permission::Write)?;
        let url = redirect_url.map(validate_redirect_url).transpose()?;

        let Some(token) = self.store.set_token_redirect(id, url.as_deref()).await? else {
            return Err(match self.store.get_token(id).await? {
                Some(_) => AppError::conflict("only ACTIVE tokens can be redirected"),
                None => AppError::not_found(format!("token {} not found", id)),
            });
        };

        tracing::info!(token_id = %id, redirect = ?url, actor = %actor.id, "token redirect changed");
        self.audit.log(
            AuditEvent::new(
                AuditAction::TokenRedirectChanged,
                &actor.id,
                match &url {
                    Some(u) => format!("Token {} now redirects to {}", token.value, u),
                    None => format!("Token {} redirect override cleared", token.value),
                },
            )
            .on(token.entity_type, &token.entity_id)
            .with_metadata(json!({ "token_id": token.id, "redirect_url": url }))
            .with_tags(&["token", "redirect"]),
        );
        Ok(token)
    }

    pub async fn get_token(&self, id: Uuid) -> Result<Token, AppError> {
        self.store
            .get_token(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("token {} not found", id)))
    }

    pub async fn get_token_detail(&self, id: Uuid) -> Result<TokenDetail, AppError> {
        let token = self.get_token(id).await?;
        let history = self.store.token_history(id).await?;
        let entity_display_name = self.registry.display_name(&token.entity()).await?;
        Ok(TokenDetail {
            token,
            entity_display_name,
            association_history: history,
        })
    }

    pub async fn get_token_history(&self, id: Uuid) -> Result<Vec<AssociationHistoryEntry>, AppError> {
        // distinguish "no history" from "no token"
        self.get_token(id).await?;
        Ok(self.store.token_history(id).await?)
    }

    pub async fn list_tokens_for_entity(&self, entity: &EntityRef, page: Page) -> Result<Vec<Token>, AppError> {
        Ok(self.store.list_tokens_for_entity(entity, page).await?)
    }
}
