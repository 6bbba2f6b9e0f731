use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    AssociateOutcome, AssociationChange, InsertRuleOutcome, RevokeOutcome, RuleFilter, TokenStore,
};
use crate::models::rule::{NewRule, RedirectRule};
use crate::models::token::{
    AssociationHistoryEntry, EntityRef, EntityType, NewToken, Page, Token, TokenStatus,
};

const TOKEN_COLUMNS: &str = "id, value, entity_type, entity_id, version_id, status, redirect_url, \
     scan_count, last_scanned_at, printed_at, expires_at, revoked_at, revoked_reason, created_by";

const RULE_COLUMNS: &str = "id, entity_type, entity_id, redirect_url, reason, starts_at, ends_at, \
     active, is_fallback, created_by, created_at, deactivated_at, deactivated_by";

const HISTORY_COLUMNS: &str = "token_id, seq, timestamp, previous_entity_type, previous_entity_id, \
     new_entity_type, new_entity_id, actor, reason, admin_override";

/// Key for the advisory lock that serializes fallback swaps.
const FALLBACK_LOCK_KEY: i64 = 0x71_72_6c_6e_6b_66_62; // "qrlnkfb"

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PgStore {
    // -- Token Operations --

    async fn insert_tokens(&self, tokens: &[NewToken]) -> anyhow::Result<Vec<Token>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            r#"INSERT INTO tokens (value, entity_type, entity_id, version_id, status, printed_at, expires_at, created_by)
               VALUES ($1, $2, $3, $4, 'active', $5, $6, $7)
               RETURNING {}"#,
            TOKEN_COLUMNS
        );

        let mut created = Vec::with_capacity(tokens.len());
        for t in tokens {
            let row = sqlx::query_as::<_, Token>(&sql)
                .bind(&t.value)
                .bind(t.entity.entity_type)
                .bind(&t.entity.entity_id)
                .bind(&t.version_id)
                .bind(t.printed_at)
                .bind(t.expires_at)
                .bind(&t.created_by)
                .fetch_one(&mut *tx)
                .await?;
            created.push(row);
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_token(&self, id: Uuid) -> anyhow::Result<Option<Token>> {
        let row = sqlx::query_as::<_, Token>(&format!(
            "SELECT {} FROM tokens WHERE id = $1",
            TOKEN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_token_by_value(&self, value: &str) -> anyhow::Result<Option<Token>> {
        let row = sqlx::query_as::<_, Token>(&format!(
            "SELECT {} FROM tokens WHERE value = $1",
            TOKEN_COLUMNS
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_tokens_for_entity(
        &self,
        entity: &EntityRef,
        page: Page,
    ) -> anyhow::Result<Vec<Token>> {
        let rows = sqlx::query_as::<_, Token>(&format!(
            r#"SELECT {} FROM tokens
               WHERE entity_type = $1 AND entity_id = $2
               ORDER BY printed_at DESC, id
               LIMIT $3 OFFSET $4"#,
            TOKEN_COLUMNS
        ))
        .bind(entity.entity_type)
        .bind(&entity.entity_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_tokens_by_type(
        &self,
        entity_type: EntityType,
        entity_id: Option<&str>,
        status: Option<TokenStatus>,
        page: Page,
    ) -> anyhow::Result<Vec<Token>> {
        let rows = sqlx::query_as::<_, Token>(&format!(
            r#"SELECT {} FROM tokens
               WHERE entity_type = $1
                 AND ($2::TEXT IS NULL OR entity_id = $2)
                 AND ($3::VARCHAR IS NULL OR status = $3)
               ORDER BY printed_at DESC, id
               LIMIT $4 OFFSET $5"#,
            TOKEN_COLUMNS
        ))
        .bind(entity_type)
        .bind(entity_id)
        .bind(status)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_scan(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<Option<Token>> {
        let row = sqlx::query_as::<_, Token>(&format!(
            r#"UPDATE tokens
               SET scan_count = scan_count + 1, last_scanned_at = $2
               WHERE id = $1 AND status = 'active'
               RETURNING {}"#,
            TOKEN_COLUMNS
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn expire_token(&self, id: Uuid, at: DateTime<Utc>) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE tokens SET status = 'expired'
               WHERE id = $1 AND status = 'active'
                 AND expires_at IS NOT NULL AND expires_at <= $2"#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_due_tokens(&self, at: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"UPDATE tokens SET status = 'expired'
               WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= $1"#,
        )
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_token(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<RevokeOutcome> {
        let revoked = sqlx::query_as::<_, Token>(&format!(
            r#"UPDATE tokens
               SET status = 'revoked', revoked_at = $2, revoked_reason = $3
               WHERE id = $1 AND status = 'active'
               RETURNING {}"#,
            TOKEN_COLUMNS
        ))
        .bind(id)
        .bind(at)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(token) = revoked {
            return Ok(RevokeOutcome::Revoked(token));
        }
        Ok(match self.get_token(id).await? {
            Some(token) => RevokeOutcome::NotActive(token),
            None => RevokeOutcome::NotFound,
        })
    }

    async fn revoke_tokens_for_entity(
        &self,
        entity: &EntityRef,
        reason: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"UPDATE tokens
               SET status = 'revoked', revoked_at = $3, revoked_reason = $4
               WHERE entity_type = $1 AND entity_id = $2 AND status = 'active'"#,
        )
        .bind(entity.entity_type)
        .bind(&entity.entity_id)
        .bind(at)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn set_token_redirect(
        &self,
        id: Uuid,
        redirect_url: Option<&str>,
    ) -> anyhow::Result<Option<Token>> {
        let row = sqlx::query_as::<_, Token>(&format!(
            r#"UPDATE tokens SET redirect_url = $2
               WHERE id = $1 AND status = 'active'
               RETURNING {}"#,
            TOKEN_COLUMNS
        ))
        .bind(id)
        .bind(redirect_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn associate_token(
        &self,
        change: &AssociationChange,
    ) -> anyhow::Result<AssociateOutcome> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Token>(&format!(
            r#"UPDATE tokens
               SET entity_type = $2, entity_id = $3
               WHERE id = $1 AND status = 'active'
                 AND entity_type = $4 AND entity_id = $5
               RETURNING {}"#,
            TOKEN_COLUMNS
        ))
        .bind(change.token_id)
        .bind(change.target.entity_type)
        .bind(&change.target.entity_id)
        .bind(change.expected.entity_type)
        .bind(&change.expected.entity_id)
        .fetch_optional(&mut *tx)
        .await?;

        let token = match updated {
            Some(t) => t,
            None => {
                tx.rollback().await?;
                return Ok(match self.get_token(change.token_id).await? {
                    Some(_) => AssociateOutcome::Stale,
                    None => AssociateOutcome::NotFound,
                });
            }
        };

        // the row lock taken by the UPDATE above serializes seq allocation per token
        let entry = sqlx::query_as::<_, AssociationHistoryEntry>(&format!(
            r#"INSERT INTO token_associations
                   (token_id, seq, timestamp, previous_entity_type, previous_entity_id,
                    new_entity_type, new_entity_id, actor, reason, admin_override)
               SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4, $5, $6, $7, $8, $9
               FROM token_associations WHERE token_id = $1
               RETURNING {}"#,
            HISTORY_COLUMNS
        ))
        .bind(change.token_id)
        .bind(change.at)
        .bind(change.expected.entity_type)
        .bind(&change.expected.entity_id)
        .bind(change.target.entity_type)
        .bind(&change.target.entity_id)
        .bind(&change.actor)
        .bind(&change.reason)
        .bind(change.admin_override)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AssociateOutcome::Associated(token, entry))
    }

    async fn token_history(&self, id: Uuid) -> anyhow::Result<Vec<AssociationHistoryEntry>> {
        let rows = sqlx::query_as::<_, AssociationHistoryEntry>(&format!(
            "SELECT {} FROM token_associations WHERE token_id = $1 ORDER BY seq ASC",
            HISTORY_COLUMNS
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Redirect Rule Operations --

    async fn insert_rule(&self, rule: &NewRule) -> anyhow::Result<InsertRuleOutcome> {
        let scope = rule
            .scope
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("scoped rule insert without a scope"))?;

        // Optimistic insert; the partial unique index decides the race.
        let created = sqlx::query_as::<_, RedirectRule>(&format!(
            r#"INSERT INTO redirect_rules
                   (entity_type, entity_id, redirect_url, reason, starts_at, ends_at, active, is_fallback, created_by)
               VALUES ($1, $2, $3, $4, $5, $6, true, false, $7)
               ON CONFLICT (entity_type, entity_id) WHERE active DO NOTHING
               RETURNING {}"#,
            RULE_COLUMNS
        ))
        .bind(scope.entity_type)
        .bind(&scope.entity_id)
        .bind(&rule.redirect_url)
        .bind(&rule.reason)
        .bind(rule.window.starts_at)
        .bind(rule.window.ends_at)
        .bind(&rule.created_by)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(r) = created {
            return Ok(InsertRuleOutcome::Created(r));
        }

        // Conflict -> report the rule that won
        let existing = sqlx::query_scalar::<_, Uuid>(
            r#"SELECT id FROM redirect_rules
               WHERE entity_type = $1 AND entity_id = $2 AND active
               ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(scope.entity_type)
        .bind(&scope.entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(InsertRuleOutcome::ActiveExists(existing))
    }

    async fn get_rule(&self, id: Uuid) -> anyhow::Result<Option<RedirectRule>> {
        let row = sqlx::query_as::<_, RedirectRule>(&format!(
            "SELECT {} FROM redirect_rules WHERE id = $1",
            RULE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn active_rules_for(&self, entity: &EntityRef) -> anyhow::Result<Vec<RedirectRule>> {
        let rows = sqlx::query_as::<_, RedirectRule>(&format!(
            r#"SELECT {} FROM redirect_rules
               WHERE entity_type = $1 AND entity_id = $2 AND active
               ORDER BY created_at DESC"#,
            RULE_COLUMNS
        ))
        .bind(entity.entity_type)
        .bind(&entity.entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_rules(
        &self,
        filter: &RuleFilter,
        page: Page,
    ) -> anyhow::Result<Vec<RedirectRule>> {
        let rows = sqlx::query_as::<_, RedirectRule>(&format!(
            r#"SELECT {} FROM redirect_rules
               WHERE ($1::VARCHAR IS NULL OR entity_type = $1)
                 AND ($2::TEXT IS NULL OR entity_id = $2)
                 AND (NOT $3 OR active)
                 AND (NOT $4 OR is_fallback)
               ORDER BY created_at DESC
               LIMIT $5 OFFSET $6"#,
            RULE_COLUMNS
        ))
        .bind(filter.scope.as_ref().map(|s| s.entity_type))
        .bind(filter.scope.as_ref().map(|s| s.entity_id.as_str()))
        .bind(filter.active_only)
        .bind(filter.fallback_only)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn deactivate_rule(
        &self,
        id: Uuid,
        actor: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<RedirectRule>> {
        let row = sqlx::query_as::<_, RedirectRule>(&format!(
            r#"UPDATE redirect_rules
               SET active = false, is_fallback = false, deactivated_at = $2, deactivated_by = $3
               WHERE id = $1 AND active
               RETURNING {}"#,
            RULE_COLUMNS
        ))
        .bind(id)
        .bind(at)
        .bind(actor)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_fallback_rule(&self) -> anyhow::Result<Option<RedirectRule>> {
        let row = sqlx::query_as::<_, RedirectRule>(&format!(
            "SELECT {} FROM redirect_rules WHERE is_fallback LIMIT 1",
            RULE_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn replace_fallback_rule(&self, rule: &NewRule) -> anyhow::Result<RedirectRule> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(FALLBACK_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"UPDATE redirect_rules
               SET is_fallback = false, active = false, deactivated_at = NOW(), deactivated_by = $1
               WHERE is_fallback"#,
        )
        .bind(&rule.created_by)
        .execute(&mut *tx)
        .await?;

        let created = sqlx::query_as::<_, RedirectRule>(&format!(
            r#"INSERT INTO redirect_rules
                   (entity_type, entity_id, redirect_url, reason, starts_at, ends_at, active, is_fallback, created_by)
               VALUES (NULL, NULL, $1, $2, $3, $4, true, true, $5)
               RETURNING {}"#,
            RULE_COLUMNS
        ))
        .bind(&rule.redirect_url)
        .bind(&rule.reason)
        .bind(rule.window.starts_at)
        .bind(rule.window.ends_at)
        .bind(&rule.created_by)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn clear_fallback_rule(
        &self,
        actor: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<RedirectRule>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(FALLBACK_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, RedirectRule>(&format!(
            r#"UPDATE redirect_rules
               SET is_fallback = false, active = false, deactivated_at = $1, deactivated_by = $2
               WHERE is_fallback
               RETURNING {}"#,
            RULE_COLUMNS
        ))
        .bind(at)
        .bind(actor)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }
}
