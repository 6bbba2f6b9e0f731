use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::token::EntityType;

/// What happened. Stored as the `action` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    TokenCreated,
    TokenBatchCreated,
    TokenRevoked,
    TokensRevokedByEntity,
    TokenRedirectChanged,
    TokenAssociated,
    TokenScanned,
    RulesBulkCreated,
    RuleCreated,
    RuleDeactivated,
    FallbackRuleSet,
    FallbackRuleCleared,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::TokenCreated => "token_created",
            AuditAction::TokenBatchCreated => "token_batch_created",
            AuditAction::TokenRevoked => "token_revoked",
            AuditAction::TokensRevokedByEntity => "tokens_revoked_by_entity",
            AuditAction::TokenRedirectChanged => "token_redirect_changed",
            AuditAction::TokenAssociated => "token_associated",
            AuditAction::TokenScanned => "token_scanned",
            AuditAction::RulesBulkCreated => "rules_bulk_created",
            AuditAction::RuleCreated => "rule_created",
            AuditAction::RuleDeactivated => "rule_deactivated",
            AuditAction::FallbackRuleSet => "fallback_rule_set",
            AuditAction::FallbackRuleCleared => "fallback_rule_cleared",
        }
    }
}

/// One append-only audit row. `entity_type` is `None` for system-wide events
/// such as fallback changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub action: AuditAction,
    pub actor: String,
    pub summary: String,
    pub metadata: serde_json::Value,
    pub tags: Vec<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, actor: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            entity_type: None,
            entity_id: None,
            action,
            actor: actor.into(),
            summary: summary.into(),
            metadata: serde_json::Value::Null,
            tags: Vec::new(),
        }
    }

    pub fn on(mut self, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type);
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}
