use async_trait::async_trait;
use sqlx::PgPool;

use super::EntityRegistry;
use crate::models::token::{EntityRef, EntityType};

/// Reads the catalog tables owned by the inventory and production services
/// that share this database. Read-only.
#[derive(Clone)]
pub struct PgEntityRegistry {
    pool: PgPool,
}

impl PgEntityRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// `(table, display column)` per entity kind. Custom entities have no table.
fn catalog(entity_type: EntityType) -> Option<(&'static str, &'static str)> {
    match entity_type {
        EntityType::Product => Some(("products", "name")),
        EntityType::Batch => Some(("batches", "batch_number")),
        EntityType::Inventory => Some(("inventory_items", "name")),
        EntityType::Custom => None,
    }
}

#[async_trait]
impl EntityRegistry for PgEntityRegistry {
    async fn exists(&self, entity: &EntityRef) -> anyhow::Result<bool> {
        let Some((table, _)) = catalog(entity.entity_type) else {
            return Ok(!entity.entity_id.trim().is_empty());
        };
        let exists = sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id::TEXT = $1)",
            table
        ))
        .bind(&entity.entity_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn display_name(&self, entity: &EntityRef) -> anyhow::Result<Option<String>> {
        let Some((table, column)) = catalog(entity.entity_type) else {
            return Ok(Some(entity.entity_id.clone()));
        };
        let name = sqlx::query_scalar::<_, String>(&format!(
            "SELECT {}::TEXT FROM {} WHERE id::TEXT = $1",
            column, table
        ))
        .bind(&entity.entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(name)
    }

    async fn batch_product(&self, batch_id: &str) -> anyhow::Result<Option<String>> {
        let product = sqlx::query_scalar::<_, String>(
            "SELECT product_id::TEXT FROM batches WHERE id::TEXT = $1",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }
}
