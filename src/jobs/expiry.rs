//! Background job: sweep overdue tokens to EXPIRED.
//!
//! Scans already expire tokens lazily; the sweep makes reports and listings
//! agree without waiting for a scan. It uses the same conditional
//! ACTIVE → EXPIRED write, so it can race scans safely. Each tick also drops
//! stale rule-cache entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::RuleCache;
use crate::store::TokenStore;

/// Spawn the sweep. `period_secs == 0` disables it and returns `None`.
pub fn spawn(
    store: Arc<dyn TokenStore>,
    cache: RuleCache,
    period_secs: u64,
) -> Option<JoinHandle<()>> {
    if period_secs == 0 {
        tracing::info!("expiry sweep disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(period_secs));
        loop {
            interval.tick().await;
            if let Err(e) = run_once(store.as_ref(), &cache).await {
                tracing::error!("expiry sweep failed: {}", e);
            }
        }
    }))
}

/// One sweep pass. Returns how many tokens were expired.
pub async fn run_once(store: &dyn TokenStore, cache: &RuleCache) -> anyhow::Result<u64> {
    let expired = store.expire_due_tokens(Utc::now()).await?;
    if expired > 0 {
        tracing::info!(tokens = expired, "expired overdue tokens");
    }

    let evicted = cache.evict_expired();
    if evicted > 0 {
        tracing::debug!(entries = evicted, "evicted stale rule cache entries");
    }
    Ok(expired)
}
