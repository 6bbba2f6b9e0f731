use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::middleware::rbac::{Actor, Permission};
use crate::models::rule::{BulkCreateResult, RedirectRule};
use crate::models::token::{
    AssociationHistoryEntry, EntityRef, EntityType, Page, Token, TokenDetail,
};
use crate::service::association::{AssociationReceipt, Eligibility, EligibleTokenPage, TokenLookup};
use crate::service::lifecycle::TokenSpec;
use crate::service::rules::RuleSpec;
use crate::store::RuleFilter;
use crate::AppState;

/// `Path` whose rejections render as the JSON error body.
#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(AppError))]
pub struct ApiPath<T>(pub T);

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTokenRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub version_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CreateTokenRequest {
    fn into_spec(self) -> TokenSpec {
        TokenSpec {
            entity: EntityRef::new(self.entity_type, self.entity_id),
            version_id: self.version_id,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Deserialize)]
pub struct CreateBatchRequest {
    #[serde(flatten)]
    pub token: CreateTokenRequest,
    pub quantity: u32,
}

#[derive(Serialize)]
pub struct BatchResponse {
    pub count: usize,
    pub tokens: Vec<Token>,
}

#[derive(Deserialize)]
pub struct RevokeRequest {
    pub reason: String,
}

#[derive(Serialize)]
pub struct RevokeEntityResponse {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub revoked: u64,
}

#[derive(Deserialize)]
pub struct SetRedirectRequest {
    pub redirect_url: Option<String>,
}

#[derive(Deserialize)]
pub struct AssociateRequest {
    pub batch_id: String,
    pub reason: Option<String>,
    #[serde(default)]
    pub admin_override: bool,
}

#[derive(Deserialize)]
pub struct LookupParams {
    pub batch_id: Option<String>,
}

#[derive(Deserialize)]
pub struct PageParams {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl PageParams {
    fn page(&self) -> Page {
        Page::new(self.page, self.per_page)
    }
}

#[derive(Deserialize)]
pub struct EligibleParams {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    #[serde(default)]
    pub include_other_products: bool,
}

#[derive(Deserialize)]
pub struct RuleListParams {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    #[serde(default)]
    pub active_only: bool,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Deserialize)]
pub struct RuleRequest {
    pub redirect_url: String,
    pub reason: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl RuleRequest {
    fn spec(&self) -> RuleSpec {
        let spec = RuleSpec::new(self.redirect_url.clone()).with_window(self.starts_at, self.ends_at);
        match &self.reason {
            Some(r) => spec.with_reason(r.clone()),
            None => spec,
        }
    }
}

#[derive(Deserialize)]
pub struct CreateRuleRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(flatten)]
    pub rule: RuleRequest,
}

#[derive(Deserialize)]
pub struct BulkRuleRequest {
    pub scope_type: EntityType,
    pub entity_ids: Vec<String>,
    #[serde(flatten)]
    pub rule: RuleRequest,
}

#[derive(Serialize)]
pub struct ClearFallbackResponse {
    pub cleared: Option<RedirectRule>,
}

fn parse_entity(entity_type: &str, entity_id: String) -> Result<EntityRef, AppError> {
    let entity_type = entity_type.parse::<EntityType>().map_err(AppError::invalid)?;
    Ok(EntityRef::new(entity_type, entity_id))
}

// ── Tokens ───────────────────────────────────────────────────

/// POST /api/v1/tokens: create one token for a freshly rendered label
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<Token>), AppError> {
    let token = state
        .service
        .lifecycle
        .create_token(payload.into_spec(), &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(token)))
}

/// POST /api/v1/tokens/batch: one print run, all or nothing
pub async fn create_token_batch(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<CreateBatchRequest>,
) -> Result<(StatusCode, Json<BatchResponse>), AppError> {
    let tokens = state
        .service
        .lifecycle
        .create_token_batch(payload.token.into_spec(), payload.quantity, &actor)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(BatchResponse {
            count: tokens.len(),
            tokens,
        }),
    ))
}

/// GET /api/v1/tokens/:id
pub async fn get_token(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<TokenDetail>, AppError> {
    actor.require(Permission::Read)?;
    Ok(Json(state.service.lifecycle.get_token_detail(id).await?))
}

/// GET /api/v1/tokens/:id/history
pub async fn get_token_history(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<Vec<AssociationHistoryEntry>>, AppError> {
    actor.require(Permission::Read)?;
    Ok(Json(state.service.lifecycle.get_token_history(id).await?))
}

/// PUT /api/v1/tokens/:id/redirect: set or clear the per-token override
pub async fn set_token_redirect(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    Json(payload): Json<SetRedirectRequest>,
) -> Result<Json<Token>, AppError> {
    let token = state
        .service
        .lifecycle
        .set_token_redirect(id, payload.redirect_url.as_deref(), &actor)
        .await?;
    Ok(Json(token))
}

/// POST /api/v1/tokens/:id/revoke
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    Json(payload): Json<RevokeRequest>,
) -> Result<Json<Token>, AppError> {
    let token = state
        .service
        .lifecycle
        .revoke_token(id, &payload.reason, &actor)
        .await?;
    Ok(Json(token))
}

/// POST /api/v1/tokens/:id/associate: bind a printed token to a batch
pub async fn associate_token(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    Json(payload): Json<AssociateRequest>,
) -> Result<Json<AssociationReceipt>, AppError> {
    let receipt = state
        .service
        .association
        .associate(
            id,
            &payload.batch_id,
            &actor,
            payload.reason.as_deref(),
            payload.admin_override,
        )
        .await?;
    Ok(Json(receipt))
}

/// GET /api/v1/tokens/:id/eligibility/:batch_id: preview only
pub async fn check_eligibility(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath((id, batch_id)): ApiPath<(Uuid, String)>,
) -> Result<Json<Eligibility>, AppError> {
    actor.require(Permission::Read)?;
    Ok(Json(
        state.service.association.check_eligibility(id, &batch_id).await?,
    ))
}

/// GET /api/v1/tokens/lookup/:value: operator lookup, never counts as a scan
pub async fn lookup_token(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath(value): ApiPath<String>,
    Query(params): Query<LookupParams>,
) -> Result<Json<TokenLookup>, AppError> {
    let found = state
        .service
        .association
        .lookup_token(&value, params.batch_id.as_deref(), &actor)
        .await?;
    Ok(Json(found))
}

// ── Entities ─────────────────────────────────────────────────

/// GET /api/v1/entities/:type/:id/tokens
pub async fn list_entity_tokens(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath((entity_type, entity_id)): ApiPath<(String, String)>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<Token>>, AppError> {
    actor.require(Permission::Read)?;
    let entity = parse_entity(&entity_type, entity_id)?;
    Ok(Json(
        state
            .service
            .lifecycle
            .list_tokens_for_entity(&entity, params.page())
            .await?,
    ))
}

/// POST /api/v1/entities/:type/:id/revoke: revoke every ACTIVE token of an entity
pub async fn revoke_entity_tokens(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath((entity_type, entity_id)): ApiPath<(String, String)>,
    Json(payload): Json<RevokeRequest>,
) -> Result<Json<RevokeEntityResponse>, AppError> {
    let entity = parse_entity(&entity_type, entity_id)?;
    let revoked = state
        .service
        .lifecycle
        .revoke_tokens_by_entity(&entity, &payload.reason, &actor)
        .await?;
    Ok(Json(RevokeEntityResponse {
        entity_type: entity.entity_type,
        entity_id: entity.entity_id,
        revoked,
    }))
}

/// GET /api/v1/batches/:id/eligible-tokens
pub async fn list_eligible_tokens(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath(batch_id): ApiPath<String>,
    Query(params): Query<EligibleParams>,
) -> Result<Json<EligibleTokenPage>, AppError> {
    let page = Page::new(params.page, params.per_page);
    let listing = state
        .service
        .association
        .list_eligible_tokens(&batch_id, &actor, params.include_other_products, page)
        .await?;
    Ok(Json(listing))
}

// ── Redirect rules ───────────────────────────────────────────

/// GET /api/v1/rules
pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(params): Query<RuleListParams>,
) -> Result<Json<Vec<RedirectRule>>, AppError> {
    actor.require(Permission::Read)?;
    let scope = match (params.entity_type, params.entity_id) {
        (Some(t), Some(id)) => Some(EntityRef::new(t, id)),
        (None, None) => None,
        _ => {
            return Err(AppError::invalid(
                "entity_type and entity_id must be given together",
            ))
        }
    };
    let filter = RuleFilter {
        scope,
        active_only: params.active_only,
        fallback_only: false,
    };
    let page = Page::new(params.page, params.per_page);
    Ok(Json(state.service.rules.list_rules(&filter, page).await?))
}

/// POST /api/v1/rules: one scoped rule; CONFLICT if one is already active
pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<CreateRuleRequest>,
) -> Result<(StatusCode, Json<RedirectRule>), AppError> {
    let entity = EntityRef::new(payload.entity_type, payload.entity_id.clone());
    let rule = state
        .service
        .rules
        .create_rule(&entity, &payload.rule.spec(), &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// POST /api/v1/rules/bulk: per-entity attempts; skips are not errors
pub async fn bulk_create_rules(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<BulkRuleRequest>,
) -> Result<Json<BulkCreateResult>, AppError> {
    let result = state
        .service
        .rules
        .bulk_create_rules(
            payload.scope_type,
            &payload.entity_ids,
            &payload.rule.spec(),
            &actor,
        )
        .await?;
    Ok(Json(result))
}

/// GET /api/v1/rules/:id
pub async fn get_rule(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<RedirectRule>, AppError> {
    actor.require(Permission::Read)?;
    Ok(Json(state.service.rules.get_rule(id).await?))
}

/// POST /api/v1/rules/:id/deactivate
pub async fn deactivate_rule(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<RedirectRule>, AppError> {
    Ok(Json(state.service.rules.deactivate_rule(id, &actor).await?))
}

/// GET /api/v1/rules/fallback
pub async fn get_fallback_rule(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<RedirectRule>, AppError> {
    actor.require(Permission::Read)?;
    state
        .service
        .rules
        .configured_fallback()
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found("no fallback redirect configured"))
}

/// PUT /api/v1/rules/fallback: swap the system fallback
pub async fn set_fallback_rule(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<RuleRequest>,
) -> Result<Json<RedirectRule>, AppError> {
    Ok(Json(
        state
            .service
            .rules
            .set_fallback_rule(&payload.spec(), &actor)
            .await?,
    ))
}

/// DELETE /api/v1/rules/fallback
pub async fn clear_fallback_rule(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<ClearFallbackResponse>, AppError> {
    let cleared = state.service.rules.clear_fallback_rule(&actor).await?;
    Ok(Json(ClearFallbackResponse { cleared }))
}
