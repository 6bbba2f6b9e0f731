//! End-to-end service behaviour over the in-memory collaborators:
//! print, scan, revoke, expire, rules and association working together.

use std::sync::Arc;

use chrono::{Duration, Utc};

use qrlink::middleware::audit::MemoryAuditSink;
use qrlink::middleware::rbac::Actor;
use qrlink::models::audit::AuditAction;
use qrlink::models::token::{EntityRef, EntityType, TokenStatus};
use qrlink::registry::memory::StaticRegistry;
use qrlink::service::lifecycle::TokenSpec;
use qrlink::service::resolver::{RedirectSource, ScanStatus};
use qrlink::service::rules::RuleSpec;
use qrlink::service::{QrService, ServiceConfig};
use qrlink::store::memory::MemoryStore;

struct Fixture {
    service: QrService,
    store: Arc<MemoryStore>,
    audit: Arc<MemoryAuditSink>,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(StaticRegistry::new());
    registry
        .add_product("SKU-1", "Widget")
        .add_product("SKU-2", "Gadget")
        .add_batch("LOT-1", "SKU-1", "Widget lot 1")
        .add_batch("LOT-2", "SKU-2", "Gadget lot 1")
        .add_batch("LOT-3", "SKU-1", "Widget lot 2")
        .add_batch("LOT-4", "SKU-1", "Widget lot 3")
        .add_batch("LOT-5", "SKU-1", "Widget lot 4");
    let audit = Arc::new(MemoryAuditSink::new());
    let service = QrService::new(
        store.clone(),
        registry,
        audit.clone(),
        ServiceConfig {
            public_base_url: "https://labels.example.com".into(),
            rule_cache_ttl_secs: 15,
        },
    );
    Fixture {
        service,
        store,
        audit,
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_print_scan_revoke_scan() {
        let f = fixture();
        let printer = Actor::editor("label-renderer");

        let token = f
            .service
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::product("SKU-1")), &printer)
            .await
            .unwrap();
        assert_eq!(token.status, TokenStatus::Active);
        assert_eq!(token.scan_count, 0);

        for expected in 1..=3 {
            let r = f.service.resolver.resolve(&token.value).await.unwrap();
            assert_eq!(r.status, ScanStatus::Active);
            assert_eq!(r.scan_count, Some(expected));
            assert_eq!(r.entity_type, Some(EntityType::Product));
            assert_eq!(r.entity_id.as_deref(), Some("SKU-1"));
        }

        f.service
            .lifecycle
            .revoke_token(token.id, "recall", &Actor::admin("qa"))
            .await
            .unwrap();

        let r = f.service.resolver.resolve(&token.value).await.unwrap();
        assert_eq!(r.status, ScanStatus::Revoked);
        assert_eq!(r.message.as_deref(), Some("recall"));

        let stored = f.service.lifecycle.get_token(token.id).await.unwrap();
        assert_eq!(stored.scan_count, 3);
        assert_eq!(stored.status, TokenStatus::Revoked);
    }

    #[tokio::test]
    async fn test_second_revoke_conflicts_and_keeps_timestamp() {
        let f = fixture();
        let actor = Actor::editor("ops");
        let token = f
            .service
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::product("SKU-1")), &actor)
            .await
            .unwrap();

        let first = f.service.lifecycle.revoke_token(token.id, "recall", &actor).await.unwrap();
        let err = f
            .service
            .lifecycle
            .revoke_token(token.id, "again", &actor)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");

        let stored = f.service.lifecycle.get_token(token.id).await.unwrap();
        assert_eq!(stored.revoked_at, first.revoked_at);
        assert_eq!(stored.revoked_reason.as_deref(), Some("recall"));
    }

    #[tokio::test]
    async fn test_batch_print_and_entity_revoke() {
        let f = fixture();
        let actor = Actor::editor("ops");
        let tokens = f
            .service
            .lifecycle
            .create_token_batch(TokenSpec::new(EntityRef::batch("LOT-1")), 10, &actor)
            .await
            .unwrap();
        assert_eq!(tokens.len(), 10);
        assert_eq!(f.store.token_count().await, 10);

        let batch_events = f
            .audit
            .events()
            .iter()
            .filter(|e| e.action == AuditAction::TokenBatchCreated)
            .count();
        assert_eq!(batch_events, 1);

        f.service
            .lifecycle
            .revoke_token(tokens[0].id, "smudged", &actor)
            .await
            .unwrap();
        let revoked = f
            .service
            .lifecycle
            .revoke_tokens_by_entity(&EntityRef::batch("LOT-1"), "lot recalled", &actor)
            .await
            .unwrap();
        assert_eq!(revoked, 9);

        // nothing left to revoke: no second audit entry
        let again = f
            .service
            .lifecycle
            .revoke_tokens_by_entity(&EntityRef::batch("LOT-1"), "lot recalled", &actor)
            .await
            .unwrap();
        assert_eq!(again, 0);
        let by_entity = f
            .audit
            .events()
            .iter()
            .filter(|e| e.action == AuditAction::TokensRevokedByEntity)
            .count();
        assert_eq!(by_entity, 1);

        let r = f.service.resolver.resolve(&tokens[0].value).await.unwrap();
        assert_eq!(r.message.as_deref(), Some("smudged"));
    }

    #[tokio::test]
    async fn test_out_of_range_quantity_writes_nothing() {
        let f = fixture();
        let actor = Actor::editor("ops");
        for q in [0, 1001] {
            let err = f
                .service
                .lifecycle
                .create_token_batch(TokenSpec::new(EntityRef::product("SKU-1")), q, &actor)
                .await
                .unwrap_err();
            assert_eq!(err.code(), "invalid_input");
        }
        assert_eq!(f.store.token_count().await, 0);
    }

    #[tokio::test]
    async fn test_expired_token_scans_never_count() {
        let f = fixture();
        let token = f
            .service
            .lifecycle
            .create_token(
                TokenSpec::new(EntityRef::product("SKU-1")).expiring_at(Utc::now() + Duration::days(1)),
                &Actor::editor("ops"),
            )
            .await
            .unwrap();
        f.store
            .force_expiry(token.id, Utc::now() - Duration::seconds(5))
            .await;

        for _ in 0..5 {
            let r = f.service.resolver.resolve(&token.value).await.unwrap();
            assert_eq!(r.status, ScanStatus::Expired);
        }
        let stored = f.service.lifecycle.get_token(token.id).await.unwrap();
        assert_eq!(stored.scan_count, 0);
        assert_eq!(stored.status, TokenStatus::Expired);

        // terminal: revoke is refused
        let err = f
            .service
            .lifecycle
            .revoke_token(token.id, "late", &Actor::editor("ops"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn test_concurrent_scans_do_not_lose_updates() {
        let f = fixture();
        let token = f
            .service
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::product("SKU-1")), &Actor::editor("ops"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..40 {
            let resolver = f.service.resolver.clone();
            let value = token.value.clone();
            handles.push(tokio::spawn(async move { resolver.resolve(&value).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().status, ScanStatus::Active);
        }
        assert_eq!(f.service.lifecycle.get_token(token.id).await.unwrap().scan_count, 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_scans_of_overdue_token_expire_once() {
        use qrlink::store::TokenStore;

        let f = fixture();
        let token = f
            .service
            .lifecycle
            .create_token(
                TokenSpec::new(EntityRef::product("SKU-1")).expiring_at(Utc::now() + Duration::days(1)),
                &Actor::editor("ops"),
            )
            .await
            .unwrap();
        f.store
            .force_expiry(token.id, Utc::now() - Duration::seconds(1))
            .await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let resolver = f.service.resolver.clone();
            let value = token.value.clone();
            handles.push(tokio::spawn(async move { resolver.resolve(&value).await }));
        }
        for h in handles {
            let r = h.await.unwrap().unwrap();
            assert_eq!(r.status, ScanStatus::Expired);
            assert!(r.effective_redirect.is_none());
        }

        let stored = f.service.lifecycle.get_token(token.id).await.unwrap();
        assert_eq!(stored.status, TokenStatus::Expired);
        assert_eq!(stored.scan_count, 0);
        assert!(stored.last_scanned_at.is_none());

        // the transition already happened; nothing is left to expire
        assert!(!f.store.expire_token(token.id, Utc::now()).await.unwrap());
        assert_eq!(f.store.expire_due_tokens(Utc::now()).await.unwrap(), 0);

        let scans = f
            .audit
            .events()
            .into_iter()
            .filter(|e| e.action == AuditAction::TokenScanned)
            .count();
        assert_eq!(scans, 32);
    }
}

mod redirect_tests {
    use super::*;

    #[tokio::test]
    async fn test_precedence_chain() {
        let f = fixture();
        let admin = Actor::admin("ops");
        let token = f
            .service
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::batch("LOT-1")), &admin)
            .await
            .unwrap();

        let computed = f.service.resolver.resolve(&token.value).await.unwrap();
        assert_eq!(
            computed.effective_redirect.unwrap().url,
            "https://labels.example.com/batches/LOT-1"
        );

        f.service
            .rules
            .set_fallback_rule(&RuleSpec::new("https://example.com/fallback"), &admin)
            .await
            .unwrap();
        let fallback = f.service.resolver.resolve(&token.value).await.unwrap();
        assert_eq!(fallback.effective_redirect.unwrap().url, "https://example.com/fallback");

        let rule = f
            .service
            .rules
            .create_rule(&EntityRef::batch("LOT-1"), &RuleSpec::new("https://example.com/recall"), &admin)
            .await
            .unwrap();
        let group = f.service.resolver.resolve(&token.value).await.unwrap().effective_redirect.unwrap();
        assert_eq!(group.source, RedirectSource::Group);
        assert_eq!(group.rule_id, Some(rule.id));

        f.service
            .lifecycle
            .set_token_redirect(token.id, Some("https://example.com/one-off"), &admin)
            .await
            .unwrap();
        let own = f.service.resolver.resolve(&token.value).await.unwrap().effective_redirect.unwrap();
        assert_eq!(own.source, RedirectSource::Token);

        // clearing the override falls back to the group rule
        f.service
            .lifecycle
            .set_token_redirect(token.id, None, &admin)
            .await
            .unwrap();
        f.service.rules.deactivate_rule(rule.id, &admin).await.unwrap();
        let after = f.service.resolver.resolve(&token.value).await.unwrap().effective_redirect.unwrap();
        assert_eq!(after.url, "https://example.com/fallback");
    }

    #[tokio::test]
    async fn test_resolution_never_mutates_rules() {
        let f = fixture();
        let admin = Actor::admin("ops");
        let token = f
            .service
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::batch("LOT-1")), &admin)
            .await
            .unwrap();
        let ended = RuleSpec::new("https://example.com/old")
            .with_window(Some(Utc::now() - Duration::days(2)), Some(Utc::now() - Duration::days(1)));
        let rule = f
            .service
            .rules
            .create_rule(&EntityRef::batch("LOT-1"), &ended, &admin)
            .await
            .unwrap();

        let r = f.service.resolver.resolve(&token.value).await.unwrap();
        assert_eq!(r.effective_redirect.unwrap().source, RedirectSource::Default);

        // an ended window leaves the rule ACTIVE; only deactivation retracts it
        let stored = f.service.rules.get_rule(rule.id).await.unwrap();
        assert!(stored.active);
        assert_eq!(f.store.rule_count().await, 1);
    }

    #[tokio::test]
    async fn test_bulk_create_five_with_two_existing() {
        let f = fixture();
        let editor = Actor::editor("ops");
        let spec = RuleSpec::new("https://example.com/recall").with_reason("supplier recall");
        for lot in ["LOT-2", "LOT-4"] {
            f.service
                .rules
                .create_rule(&EntityRef::batch(lot), &spec, &editor)
                .await
                .unwrap();
        }

        let ids: Vec<String> = ["LOT-1", "LOT-2", "LOT-3", "LOT-4", "LOT-5"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = f
            .service
            .rules
            .bulk_create_rules(EntityType::Batch, &ids, &spec, &editor)
            .await
            .unwrap();

        assert_eq!(result.created, 3);
        assert_eq!(result.skipped, 2);
        let mut skipped: Vec<_> = result.skipped_items.iter().map(|s| s.entity_id.clone()).collect();
        skipped.sort();
        assert_eq!(skipped, vec!["LOT-2".to_string(), "LOT-4".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_bulk_creates_never_duplicate_active_rules() {
        let f = fixture();
        let ids: Vec<String> = ["LOT-1", "LOT-2", "LOT-3", "LOT-4", "LOT-5"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut handles = Vec::new();
        for url in ["https://example.com/a", "https://example.com/b"] {
            let rules = f.service.rules.clone();
            let ids = ids.clone();
            handles.push(tokio::spawn(async move {
                rules
                    .bulk_create_rules(EntityType::Batch, &ids, &RuleSpec::new(url), &Actor::editor("ops"))
                    .await
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }

        assert_eq!(results.iter().map(|r| r.created).sum::<usize>(), 5);
        assert_eq!(results.iter().map(|r| r.skipped).sum::<usize>(), 5);
        assert!(results.iter().all(|r| r.errors.is_empty()));
        for id in &ids {
            let winners = results
                .iter()
                .filter(|r| r.created_rules.iter().any(|c| c.entity_id.as_deref() == Some(id.as_str())))
                .count();
            assert_eq!(winners, 1, "{} must have exactly one created rule", id);
            let active = f
                .service
                .rules
                .find_active_rule(&EntityRef::batch(id.clone()), Utc::now())
                .await
                .unwrap();
            assert!(active.is_some());
        }
        assert_eq!(f.store.rule_count().await, 5);
    }
}

mod association_tests {
    use super::*;

    #[tokio::test]
    async fn test_cross_product_override_appends_one_history_entry() {
        let f = fixture();
        let token = f
            .service
            .lifecycle
            .create_token(TokenSpec::new(EntityRef::product("SKU-1")), &Actor::editor("printer"))
            .await
            .unwrap();

        let err = f
            .service
            .association
            .associate(token.id, "LOT-2", &Actor::editor("floor"), None, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert!(f.service.lifecycle.get_token_history(token.id).await.unwrap().is_empty());

        f.service
            .association
            .associate(token.id, "LOT-2", &Actor::admin("lead"), Some("relabelled stock"), true)
            .await
            .unwrap();

        let detail = f.service.lifecycle.get_token_detail(token.id).await.unwrap();
        assert_eq!(detail.association_history.len(), 1);
        assert_eq!(detail.token.entity_type, EntityType::Batch);
        assert_eq!(detail.token.entity_id, "LOT-2");
        assert_eq!(detail.entity_display_name.as_deref(), Some("Gadget lot 1"));

        // scans follow the new pointer
        let r = f.service.resolver.resolve(&token.value).await.unwrap();
        assert_eq!(r.entity_id.as_deref(), Some("LOT-2"));
    }

    #[test]
    fn test_lookup_is_not_a_scan() {
        tokio_test::block_on(async {
            let f = fixture();
            let token = f
                .service
                .lifecycle
                .create_token(TokenSpec::new(EntityRef::product("SKU-1")), &Actor::editor("printer"))
                .await
                .unwrap();
            let printed_url = format!("https://labels.example.com/qr/{}", token.value);

            let found = f
                .service
                .association
                .lookup_token(&printed_url, Some("LOT-1"), &Actor::viewer("floor"))
                .await
                .unwrap();
            assert!(found.eligibility.unwrap().is_eligible);
            assert_eq!(f.service.lifecycle.get_token(token.id).await.unwrap().scan_count, 0);
        });
    }
}
