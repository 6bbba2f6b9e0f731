use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of object a token or redirect rule points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum EntityType {
    Product,
    Batch,
    Inventory,
    Custom,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::Batch => "batch",
            EntityType::Inventory => "inventory",
            EntityType::Custom => "custom",
        }
    }

    /// Path segment of the canonical landing page for this kind of entity.
    pub fn canonical_segment(&self) -> &'static str {
        match self {
            EntityType::Product => "products",
            EntityType::Batch => "batches",
            EntityType::Inventory => "inventory",
            EntityType::Custom => "entities",
        }
    }

    /// Canonical landing URL used when nothing more specific applies.
    pub fn canonical_url(&self, base_url: &str, entity_id: &str) -> String {
        let base = base_url.trim_end_matches('/');
        let mut encoded = url::form_urlencoded::byte_serialize(entity_id.as_bytes())
            .collect::<String>();
        // form encoding turns spaces into '+', which is not a path escape
        encoded = encoded.replace('+', "%20");
        format!("{}/{}/{}", base, self.canonical_segment(), encoded)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "product" | "products" => Ok(EntityType::Product),
            "batch" | "batches" => Ok(EntityType::Batch),
            "inventory" => Ok(EntityType::Inventory),
            "custom" => Ok(EntityType::Custom),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

/// A typed pointer at an entity owned by another subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    pub fn product(id: impl Into<String>) -> Self {
        Self::new(EntityType::Product, id)
    }

    pub fn batch(id: impl Into<String>) -> Self {
        Self::new(EntityType::Batch, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum TokenStatus {
    Active,
    Revoked,
    Expired,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Active => "active",
            TokenStatus::Revoked => "revoked",
            TokenStatus::Expired => "expired",
        }
    }

    /// REVOKED and EXPIRED have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TokenStatus::Active)
    }
}

/// The identity of one physical printed label.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Token {
    pub id: Uuid,
    pub value: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub version_id: Option<String>,
    pub status: TokenStatus,
    pub redirect_url: Option<String>,
    pub scan_count: i64,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub printed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub created_by: String,
}

impl Token {
    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.entity_type, self.entity_id.clone())
    }

    /// True when an expiry is set and `now` has reached it.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

/// Insert shape for a freshly printed token.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub value: String,
    pub entity: EntityRef,
    pub version_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub printed_at: DateTime<Utc>,
    pub created_by: String,
}

/// Immutable record of one entity-pointer move. Never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssociationHistoryEntry {
    pub token_id: Uuid,
    pub seq: i32,
    pub timestamp: DateTime<Utc>,
    pub previous_entity_type: EntityType,
    pub previous_entity_id: String,
    pub new_entity_type: EntityType,
    pub new_entity_id: String,
    pub actor: String,
    pub reason: Option<String>,
    pub admin_override: bool,
}

/// Everything an operator screen needs about one token.
#[derive(Debug, Clone, Serialize)]
pub struct TokenDetail {
    #[serde(flatten)]
    pub token: Token,
    pub entity_display_name: Option<String>,
    pub association_history: Vec<AssociationHistoryEntry>,
}

/// 1-based page request, clamped to sane bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub const MAX_PER_PAGE: u32 = 200;

    pub fn new(page: Option<u32>, per_page: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(50).clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.per_page as i64
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.per_page as i64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}
