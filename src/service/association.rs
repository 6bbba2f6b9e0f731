//! Re-pointing printed tokens at batches, and the eligibility policy that
//! guards it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::optional_text;
use super::resolver::find_by_raw;
use crate::errors::AppError;
use crate::middleware::audit::AuditSink;
use crate::middleware::rbac::{Actor, Permission};
use crate::models::audit::{AuditAction, AuditEvent};
use crate::models::token::{
    AssociationHistoryEntry, EntityRef, EntityType, Page, Token, TokenStatus,
};
use crate::registry::EntityRegistry;
use crate::store::{AssociateOutcome, AssociationChange, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EligibilityReason {
    Eligible,
    NotActive,
    AlreadyAssociated,
    ProductMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Eligibility {
    pub is_eligible: bool,
    pub eligibility_reason: EligibilityReason,
    pub requires_admin_override: bool,
}

impl Eligibility {
    fn eligible() -> Self {
        Self {
            is_eligible: true,
            eligibility_reason: EligibilityReason::Eligible,
            requires_admin_override: false,
        }
    }

    fn blocked(reason: EligibilityReason) -> Self {
        Self {
            is_eligible: false,
            eligibility_reason: reason,
            requires_admin_override: false,
        }
    }
}

/// Side-effect-free eligibility of moving `token` onto `target_batch_id`.
///
/// `token_product` is the token's implied product: its own id when
/// PRODUCT-typed, its batch's product when BATCH-typed, `None` otherwise.
/// A token without an implied product never matches.
pub fn evaluate(
    token: &Token,
    token_product: Option<&str>,
    target_batch_id: &str,
    target_product: &str,
    now: DateTime<Utc>,
) -> Eligibility {
    if token.status != TokenStatus::Active || token.is_past_expiry(now) {
        return Eligibility::blocked(EligibilityReason::NotActive);
    }
    if token.entity_type == EntityType::Batch && token.entity_id == target_batch_id {
        return Eligibility::blocked(EligibilityReason::AlreadyAssociated);
    }
    if token_product == Some(target_product) {
        return Eligibility::eligible();
    }
    Eligibility {
        is_eligible: false,
        eligibility_reason: EligibilityReason::ProductMismatch,
        requires_admin_override: true,
    }
}

/// A token annotated for an association picker.
#[derive(Debug, Clone, Serialize)]
pub struct EligibleToken {
    #[serde(flatten)]
    pub token: Token,
    #[serde(flatten)]
    pub eligibility: Eligibility,
}

#[derive(Debug, Clone, Serialize)]
pub struct EligibleTokenPage {
    pub batch_id: String,
    pub product_id: String,
    pub include_other_products: bool,
    pub page: u32,
    pub per_page: u32,
    pub tokens: Vec<EligibleToken>,
}

/// Operator lookup of a scanned value. Does not count as a scan.
#[derive(Debug, Clone, Serialize)]
pub struct TokenLookup {
    pub token: Token,
    pub entity_display_name: Option<String>,
    pub eligibility: Option<Eligibility>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssociationReceipt {
    pub token: Token,
    pub history_entry: AssociationHistoryEntry,
}

#[derive(Clone)]
pub struct AssociationManager {
    store: Arc<dyn TokenStore>,
    registry: Arc<dyn EntityRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl AssociationManager {
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

    async fn implied_product(&self, token: &Token) -> anyhow::Result<Option<String>> {
        match token.entity_type {
            EntityType::Product => Ok(Some(token.entity_id.clone())),
            EntityType::Batch => self.registry.batch_product(&token.entity_id).await,
            EntityType::Inventory | EntityType::Custom => Ok(None),
        }
    }

    async fn target_product(&self, batch_id: &str) -> Result<String, AppError> {
        self.registry
            .batch_product(batch_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("batch {} not found", batch_id)))
    }

    async fn eligibility_for(
        &self,
        token: &Token,
        target_batch_id: &str,
        target_product: &str,
        now: DateTime<Utc>,
    ) -> Result<Eligibility, AppError> {
        let implied = self.implied_product(token).await?;
        Ok(evaluate(token, implied.as_deref(), target_batch_id, target_product, now))
    }

    /// Preview only. `associate` evaluates again at commit time.
    pub async fn check_eligibility(
        &self,
        token_id: Uuid,
        target_batch_id: &str,
    ) -> Result<Eligibility, AppError> {
        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("token {} not found", token_id)))?;
        let product = self.target_product(target_batch_id).await?;
        self.eligibility_for(&token, target_batch_id, &product, Utc::now()).await
    }

    /// Point an ACTIVE token at `target_batch_id`, appending one history entry.
    pub async fn associate(
        &self,
        token_id: Uuid,
        target_batch_id: &str,
        actor: &Actor,
        reason: Option<&str>,
        admin_override: bool,
    ) -> Result<AssociationReceipt, AppError> {
        actor.require(Permission::Write)?;
        if admin_override && !actor.is_privileged() {
            return Err(AppError::forbidden("admin override requires elevated privilege"));
        }
        let reason = optional_text(reason.map(str::to_string));

        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("token {} not found", token_id)))?;
        let target_product = self.target_product(target_batch_id).await?;
        let now = Utc::now();

        let eligibility = self
            .eligibility_for(&token, target_batch_id, &target_product, now)
            .await?;
        let override_used = match eligibility.eligibility_reason {
            EligibilityReason::Eligible => false,
            EligibilityReason::NotActive => {
                return Err(AppError::conflict(format!(
                    "token is {} and cannot be associated",
                    token.status.as_str()
                )))
            }
            EligibilityReason::AlreadyAssociated => {
                return Err(AppError::conflict(format!(
                    "token is already associated with batch {}",
                    target_batch_id
                )))
            }
            EligibilityReason::ProductMismatch if admin_override => {
                if reason.is_none() {
                    return Err(AppError::invalid(
                        "a reason is required for a cross-product association",
                    ));
                }
                true
            }
            EligibilityReason::ProductMismatch => {
                tracing::warn!(
                    token_id = %token.id,
                    target_batch = target_batch_id,
                    actor = %actor.id,
                    "cross-product association refused"
                );
                return Err(AppError::forbidden(
                    "token belongs to a different product; admin override required",
                ));
            }
        };

        let change = AssociationChange {
            token_id,
            expected: token.entity(),
            target: EntityRef::batch(target_batch_id),
            actor: actor.id.clone(),
            reason: reason.clone(),
            admin_override: override_used,
            at: now,
        };

        let (updated, entry) = match self.store.associate_token(&change).await? {
            AssociateOutcome::Associated(t, e) => (t, e),
            AssociateOutcome::Stale => {
                return Err(AppError::conflict(
                    "token changed while associating; reload and retry",
                ))
            }
            AssociateOutcome::NotFound => {
                return Err(AppError::not_found(format!("token {} not found", token_id)))
            }
        };

        tracing::info!(
            token_id = %token_id,
            from = %change.expected,
            to = %change.target,
            admin_override = override_used,
            actor = %actor.id,
            "token associated"
        );
        self.audit.log(
            AuditEvent::new(
                AuditAction::TokenAssociated,
                &actor.id,
                format!("Token {} moved from {} to batch {}", updated.value, change.expected, target_batch_id),
            )
            .on(EntityType::Batch, target_batch_id)
            .with_metadata(json!({
                "token_id": token_id,
                "previous_entity_type": change.expected.entity_type,
                "previous_entity_id": change.expected.entity_id,
                "reason": reason,
                "admin_override": override_used,
                "seq": entry.seq,
            }))
            .with_tags(if override_used {
                &["association", "admin_override"][..]
            } else {
                &["association"][..]
            }),
        );

        Ok(AssociationReceipt {
            token: updated,
            history_entry: entry,
        })
    }

    /// ACTIVE PRODUCT tokens that could be bound to `batch_id`.
    ///
    /// Only the batch's own product is listed unless the actor is privileged
    /// and asks for other products too; the flag is ignored otherwise.
    pub async fn list_eligible_tokens(
        &self,
        batch_id: &str,
        actor: &Actor,
        include_other_products: bool,
        page: Page,
    ) -> Result<EligibleTokenPage, AppError> {
        actor.require(Permission::Read)?;
        let product = self.target_product(batch_id).await?;
        let cross = include_other_products && actor.is_privileged();

        let product_filter = if cross { None } else { Some(product.as_str()) };
        let tokens = self
            .store
            .list_tokens_by_type(EntityType::Product, product_filter, Some(TokenStatus::Active), page)
            .await?;

        let now = Utc::now();
        let tokens = tokens
            .into_iter()
            .map(|token| {
                let eligibility = evaluate(&token, Some(token.entity_id.as_str()), batch_id, &product, now);
                EligibleToken { token, eligibility }
            })
            .collect();

        Ok(EligibleTokenPage {
            batch_id: batch_id.to_string(),
            product_id: product,
            include_other_products: cross,
            page: page.page,
            per_page: page.per_page,
            tokens,
        })
    }

    /// Look a scanned value up for association work, with optional
    /// eligibility against `target_batch_id`. Applies lazy expiry but never
    /// counts a scan.
    pub async fn lookup_token(
        &self,
        raw: &str,
        target_batch_id: Option<&str>,
        actor: &Actor,
    ) -> Result<TokenLookup, AppError> {
        actor.require(Permission::Read)?;
        let now = Utc::now();
        let token = find_by_raw(self.store.as_ref(), raw, now)
            .await?
            .ok_or_else(|| AppError::not_found("token not found"))?;

        let eligibility = match target_batch_id {
            Some(batch_id) => {
                let product = self.target_product(batch_id).await?;
                Some(self.eligibility_for(&token, batch_id, &product, now).await?)
            }
            None => None,
        };
        let entity_display_name = self.registry.display_name(&token.entity()).await?;

        Ok(TokenLookup {
            token,
            entity_display_name,
            eligibility,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::audit::MemoryAuditSink;
    use crate::registry::memory::StaticRegistry;
    use crate::service::lifecycle::{TokenLifecycle, TokenSpec};
    use crate::store::memory::MemoryStore;

    struct Harness {
        audit: Arc<MemoryAuditSink>,
        lifecycle: TokenLifecycle,
        manager: AssociationManager,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(StaticRegistry::new());
        registry
            .add_product("P1", "Widget")
            .add_product("P2", "Gadget")
            .add_batch("B1", "P1", "Widget lot 1")
            .add_batch("B1b", "P1", "Widget lot 2")
            .add_batch("B2", "P2", "Gadget lot 1");
        let audit = Arc::new(MemoryAuditSink::new());
        Harness {
            lifecycle: TokenLifecycle::new(store.clone(), registry.clone(), audit.clone()),
            manager: AssociationManager::new(store, registry, audit.clone()),
            audit,
        }
    }

    async fn product_token(h: &Harness, product: &str) -> Token {
        h.lifecycle
            .create_token(TokenSpec::new(EntityRef::product(product)), &Actor::editor("printer"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cross_product_needs_privileged_override() {
        let h = harness();
        let token = product_token(&h, "P1").await;

        let err = h
            .manager
            .associate(token.id, "B2", &Actor::editor("ops"), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let err = h
            .manager
            .associate(token.id, "B2", &Actor::editor("ops"), Some("relabel"), true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");

        let err = h
            .manager
            .associate(token.id, "B2", &Actor::admin("root"), None, true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_input");

        let receipt = h
            .manager
            .associate(token.id, "B2", &Actor::admin("root"), Some("relabel"), true)
            .await
            .unwrap();
        assert_eq!(receipt.token.entity_type, EntityType::Batch);
        assert_eq!(receipt.token.entity_id, "B2");
        assert!(receipt.history_entry.admin_override);

        let history = h.lifecycle.get_token_history(token.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].previous_entity_id, "P1");
        assert_eq!(history[0].new_entity_id, "B2");
    }

    #[tokio::test]
    async fn test_same_product_association_and_audit() {
        let h = harness();
        let token = product_token(&h, "P1").await;

        let preview = h.manager.check_eligibility(token.id, "B1").await.unwrap();
        assert!(preview.is_eligible);

        let receipt = h
            .manager
            .associate(token.id, "B1", &Actor::editor("ops"), None, false)
            .await
            .unwrap();
        assert_eq!(receipt.history_entry.seq, 1);
        assert!(!receipt.history_entry.admin_override);
        assert_eq!(receipt.token.status, TokenStatus::Active);

        let event = h
            .audit
            .events()
            .into_iter()
            .find(|e| e.action == AuditAction::TokenAssociated)
            .unwrap();
        assert_eq!(event.entity_type, Some(EntityType::Batch));
        assert_eq!(event.entity_id.as_deref(), Some("B1"));

        // batch tokens carry their batch's product
        let again = h
            .manager
            .associate(token.id, "B1b", &Actor::editor("ops"), None, false)
            .await
            .unwrap();
        assert_eq!(again.history_entry.seq, 2);
    }

    #[tokio::test]
    async fn test_already_at_target_and_inactive_conflict() {
        let h = harness();
        let actor = Actor::editor("ops");
        let token = product_token(&h, "P1").await;
        h.manager.associate(token.id, "B1", &actor, None, false).await.unwrap();

        let err = h.manager.associate(token.id, "B1", &actor, None, false).await.unwrap_err();
        assert_eq!(err.code(), "conflict");

        let other = product_token(&h, "P1").await;
        h.lifecycle.revoke_token(other.id, "damaged", &actor).await.unwrap();
        let err = h.manager.associate(other.id, "B1", &actor, None, false).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
        let preview = h.manager.check_eligibility(other.id, "B1").await.unwrap();
        assert_eq!(preview.eligibility_reason, EligibilityReason::NotActive);

        let err = h.manager.associate(token.id, "NOPE", &actor, None, false).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_eligible_listing_respects_privilege() {
        let h = harness();
        product_token(&h, "P1").await;
        product_token(&h, "P1").await;
        product_token(&h, "P2").await;

        let editor = h
            .manager
            .list_eligible_tokens("B1", &Actor::editor("ops"), true, Page::default())
            .await
            .unwrap();
        assert!(!editor.include_other_products);
        assert_eq!(editor.tokens.len(), 2);
        assert!(editor.tokens.iter().all(|t| t.eligibility.is_eligible));

        let admin = h
            .manager
            .list_eligible_tokens("B1", &Actor::admin("root"), true, Page::default())
            .await
            .unwrap();
        assert!(admin.include_other_products);
        assert_eq!(admin.tokens.len(), 3);
        let foreign: Vec<_> = admin.tokens.iter().filter(|t| !t.eligibility.is_eligible).collect();
        assert_eq!(foreign.len(), 1);
        assert!(foreign[0].eligibility.requires_admin_override);
        assert_eq!(foreign[0].eligibility.eligibility_reason, EligibilityReason::ProductMismatch);
    }

    #[tokio::test]
    async fn test_lookup_never_counts_a_scan() {
        let h = harness();
        let token = product_token(&h, "P1").await;
        let viewer = Actor::viewer("floor");

        let found = h.manager.lookup_token(&token.value, Some("B2"), &viewer).await.unwrap();
        assert_eq!(found.token.id, token.id);
        assert_eq!(found.entity_display_name.as_deref(), Some("Widget"));
        assert_eq!(
            found.eligibility.map(|e| e.eligibility_reason),
            Some(EligibilityReason::ProductMismatch)
        );
        h.manager.lookup_token(&token.value, None, &viewer).await.unwrap();
        assert_eq!(h.lifecycle.get_token(token.id).await.unwrap().scan_count, 0);

        let err = h.manager.lookup_token("qr_nope", None, &viewer).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_tokens_without_a_product_never_match() {
        let now = Utc::now();
        let token = Token {
            id: Uuid::new_v4(),
            value: "qr_ABCDEFGHIJKLMNOPQRSTU9".into(),
            entity_type: EntityType::Inventory,
            entity_id: "I1".into(),
            version_id: None,
            status: TokenStatus::Active,
            redirect_url: None,
            scan_count: 0,
            last_scanned_at: None,
            printed_at: now,
            expires_at: None,
            revoked_at: None,
            revoked_reason: None,
            created_by: "t".into(),
        };
        let e = evaluate(&token, None, "B1", "P1", now);
        assert!(!e.is_eligible);
        assert!(e.requires_admin_override);
    }
}
