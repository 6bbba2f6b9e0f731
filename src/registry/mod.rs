//! Entity existence oracle.
//!
//! Products, batches and inventory rows are owned by other subsystems. This
//! module only asks whether they exist, what to call them, and which product
//! a batch belongs to.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::models::token::EntityRef;

#[async_trait]
pub trait EntityRegistry: Send + Sync {
    async fn exists(&self, entity: &EntityRef) -> anyhow::Result<bool>;

    /// Human-readable label, if the entity exists.
    async fn display_name(&self, entity: &EntityRef) -> anyhow::Result<Option<String>>;

    /// Product id of a batch, or `None` if the batch does not exist.
    async fn batch_product(&self, batch_id: &str) -> anyhow::Result<Option<String>>;
}
