use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::rule::RedirectRule;
use crate::models::token::EntityRef;

pub const FALLBACK_KEY: &str = "rules:fallback";

/// Entry stored in the local DashMap with an expiry timestamp.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    rules: Vec<RedirectRule>,
    pub(crate) expires_at: Instant,
}

/// In-process cache of redirect rule lookups on the scan hot path.
///
/// PG is the source of truth. Entries honour a TTL, are checked on read and
/// evicted lazily; writes made through this process invalidate their keys
/// immediately. Other replicas converge within one TTL.
#[derive(Clone)]
pub struct RuleCache {
    pub(crate) local: Arc<DashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl RuleCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn scope_key(entity: &EntityRef) -> String {
        format!("rules:{}:{}", entity.entity_type, entity.entity_id)
    }

    pub fn get(&self, key: &str) -> Option<Vec<RedirectRule>> {
        if !self.is_enabled() {
            return None;
        }
        if let Some(entry) = self.local.get(key) {
            if Instant::now() < entry.expires_at {
                return Some(entry.rules.clone());
            }
            // expired; drop the ref before removing
            drop(entry);
            self.local.remove(key);
        }
        None
    }

    pub fn set(&self, key: &str, rules: Vec<RedirectRule>) {
        if !self.is_enabled() {
            return;
        }
        self.local.insert(
            key.to_string(),
            CacheEntry {
                rules,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.local.remove(key);
    }

    /// Invalidate the cache entry a rule would have been read through.
    pub fn invalidate_rule(&self, rule: &RedirectRule) {
        match rule.scope() {
            Some(scope) => self.invalidate(&Self::scope_key(&scope)),
            None => self.invalidate(FALLBACK_KEY),
        }
    }

    /// Remove all locally-expired entries.  Call this periodically from a
    /// background task to bound memory usage.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        self.local.retain(|_, entry| entry.expires_at > now);
        before - self.local.len()
    }

    /// Current number of entries in the local cache (for metrics / debugging).
    pub fn local_len(&self) -> usize {
        self.local.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_cache_never_stores() {
        let cache = RuleCache::disabled();
        cache.set("k", vec![]);
        assert!(cache.get("k").is_none());
        assert_eq!(cache.local_len(), 0);
    }

    #[test]
    fn test_set_get_invalidate() {
        let cache = RuleCache::new(60);
        let key = RuleCache::scope_key(&EntityRef::batch("B1"));
        assert_eq!(key, "rules:batch:B1");
        cache.set(&key, vec![]);
        assert_eq!(cache.get(&key).map(|r| r.len()), Some(0));
        cache.invalidate(&key);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_evict_expired_drops_stale_entries() {
        let cache = RuleCache::new(60);
        cache.set("fresh", vec![]);
        cache.local.insert(
            "stale".into(),
            CacheEntry {
                rules: vec![],
                expires_at: Instant::now() - Duration::from_secs(1),
            },
        );
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.local_len(), 1);
    }
}
