use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::token::{EntityRef, EntityType};

/// Admin override that sends every scan of an entity to `redirect_url`.
/// The system fallback has no scope and `is_fallback = true`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RedirectRule {
    pub id: Uuid,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub redirect_url: String,
    pub reason: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub is_fallback: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivated_by: Option<String>,
}

impl RedirectRule {
    pub fn scope(&self) -> Option<EntityRef> {
        match (self.entity_type, &self.entity_id) {
            (Some(t), Some(id)) => Some(EntityRef::new(t, id.clone())),
            _ => None,
        }
    }

    pub fn window(&self) -> RuleWindow {
        RuleWindow {
            starts_at: self.starts_at,
            ends_at: self.ends_at,
        }
    }

    /// Active and inside its window at `at`.
    pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
        self.active && self.window().contains(at)
    }
}

/// Optional validity window. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleWindow {
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl RuleWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let started = self.starts_at.map(|s| s <= at).unwrap_or(true);
        let not_ended = self.ends_at.map(|e| at <= e).unwrap_or(true);
        started && not_ended
    }

    /// An end before (or equal to) the start can never contain anything useful.
    pub fn is_well_formed(&self) -> bool {
        match (self.starts_at, self.ends_at) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        }
    }
}

/// Insert shape for a rule.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub scope: Option<EntityRef>,
    pub redirect_url: String,
    pub reason: Option<String>,
    pub window: RuleWindow,
    pub is_fallback: bool,
    pub created_by: String,
}

/// Result of one per-entity attempt inside a bulk create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SkippedItem {
    pub entity_id: String,
    pub existing_rule_id: Option<Uuid>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemError {
    pub entity_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCreateResult {
    pub created: usize,
    pub skipped: usize,
    pub created_rules: Vec<RedirectRule>,
    pub skipped_items: Vec<SkippedItem>,
    pub errors: Vec<BulkItemError>,
}
