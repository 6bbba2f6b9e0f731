use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::EntityRegistry;
use crate::models::token::{EntityRef, EntityType};

/// Registry seeded in code. Used by tests and `serve --memory`.
#[derive(Default)]
pub struct StaticRegistry {
    names: RwLock<HashMap<EntityRef, String>>,
    batch_products: RwLock<HashMap<String, String>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&self, id: &str, name: &str) -> &Self {
        if let Ok(mut names) = self.names.write() {
            names.insert(EntityRef::product(id), name.to_string());
        }
        self
    }

    pub fn add_batch(&self, id: &str, product_id: &str, name: &str) -> &Self {
        if let Ok(mut names) = self.names.write() {
            names.insert(EntityRef::batch(id), name.to_string());
        }
        if let Ok(mut batches) = self.batch_products.write() {
            batches.insert(id.to_string(), product_id.to_string());
        }
        self
    }

    pub fn add_inventory(&self, id: &str, name: &str) -> &Self {
        if let Ok(mut names) = self.names.write() {
            names.insert(EntityRef::new(EntityType::Inventory, id), name.to_string());
        }
        self
    }
}

#[async_trait]
impl EntityRegistry for StaticRegistry {
    async fn exists(&self, entity: &EntityRef) -> anyhow::Result<bool> {
        match entity.entity_type {
            EntityType::Custom => Ok(!entity.entity_id.trim().is_empty()),
            _ => Ok(self
                .names
                .read()
                .map_err(|_| anyhow::anyhow!("registry lock poisoned"))?
                .contains_key(entity)),
        }
    }

    async fn display_name(&self, entity: &EntityRef) -> anyhow::Result<Option<String>> {
        match entity.entity_type {
            EntityType::Custom => Ok(Some(entity.entity_id.clone())),
            _ => Ok(self
                .names
                .read()
                .map_err(|_| anyhow::anyhow!("registry lock poisoned"))?
                .get(entity)
                .cloned()),
        }
    }

    async fn batch_product(&self, batch_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .batch_products
            .read()
            .map_err(|_| anyhow::anyhow!("registry lock poisoned"))?
            .get(batch_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_entities_resolve() {
        let reg = StaticRegistry::new();
        reg.add_product("P1", "Widget").add_batch("B1", "P1", "Lot 42");

        assert!(reg.exists(&EntityRef::product("P1")).await.unwrap());
        assert!(!reg.exists(&EntityRef::product("P2")).await.unwrap());
        assert_eq!(reg.batch_product("B1").await.unwrap().as_deref(), Some("P1"));
        assert_eq!(
            reg.display_name(&EntityRef::batch("B1")).await.unwrap().as_deref(),
            Some("Lot 42")
        );
    }

    #[tokio::test]
    async fn test_custom_entities_need_only_an_id() {
        let reg = StaticRegistry::new();
        assert!(reg.exists(&EntityRef::new(EntityType::Custom, "campaign-7")).await.unwrap());
        assert!(!reg.exists(&EntityRef::new(EntityType::Custom, " ")).await.unwrap());
    }
}
