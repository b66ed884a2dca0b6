//! Integration tests for certion-store
//!
//! Runs the firewall services and the routing table against a real SQLite
//! in-memory database

use certion_firewall::{
    import_rules, AccessRequestStore, AccessRequests, AccessStatus, FirewallConfig,
    FirewallError, NewFirewallRule, RuleDocument, RuleStore, RuleType,
};
use certion_router::{RoutingEntry, RoutingTable};
use certion_store::{connect, migrate, DbStore};
use chrono::{Duration, Utc};
use sea_orm::ConnectionTrait;
use std::sync::Arc;

async fn setup_store() -> DbStore {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    migrate(&db).await.expect("Failed to run migrations");
    DbStore::new(db)
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");
    assert!(matches!(
        db.get_database_backend(),
        sea_orm::DatabaseBackend::Sqlite
    ));
    migrate(&db).await.expect("Failed to run migrations");
    // Idempotent
    migrate(&db).await.expect("Failed to re-run migrations");
}

#[tokio::test]
async fn test_rule_crud_and_duplicates() {
    let store = setup_store().await;

    let rule = store
        .add_rule(
            "proj",
            NewFirewallRule::new(RuleType::Path, "admin", Some("Admin".into())).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rule.value, "/admin");
    assert_eq!(rule.rule_type, RuleType::Path);
    assert_eq!(rule.description.as_deref(), Some("Admin"));

    let err = store
        .add_rule(
            "proj",
            NewFirewallRule::new(RuleType::Path, "/admin", None).unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FirewallError::DuplicateRule { .. }));

    store
        .add_rule(
            "proj",
            NewFirewallRule::new(RuleType::Method, "delete", None).unwrap(),
        )
        .await
        .unwrap();

    let rules = store.list_rules("proj").await.unwrap();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[1].value, "DELETE");

    assert_eq!(
        store.delete_rule("other", rule.id).await,
        Err(FirewallError::RuleNotFound(rule.id))
    );
    store.delete_rule("proj", rule.id).await.unwrap();
    assert_eq!(store.list_rules("proj").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_import_export_roundtrip_through_database() {
    let store = setup_store().await;
    let doc = RuleDocument {
        blocked_paths: vec!["/admin".into(), "internal".into()],
        blocked_methods: vec!["put".into()],
        path_patterns: vec![r"\.git/.*".into()],
    };

    let summary = import_rules(&store, "proj", doc).await.unwrap();
    assert_eq!(summary.added, 4);

    let exported = RuleDocument::from_rules(&store.list_rules("proj").await.unwrap());
    assert_eq!(exported.blocked_paths, vec!["/admin", "/internal"]);
    assert_eq!(exported.blocked_methods, vec!["PUT"]);
    assert_eq!(exported.path_patterns, vec![r"\.git/.*"]);
}

#[tokio::test]
async fn test_config_upsert() {
    let store = setup_store().await;
    assert_eq!(store.get_config("proj").await.unwrap(), None);

    let config = FirewallConfig {
        enabled: true,
        rate_limit_per_minute: 30,
        auto_block_suspicious: true,
        whitelist_ips: vec!["10.0.0.0/8".into(), "2001:db8::1".into()],
    };
    store.put_config("proj", config.clone()).await.unwrap();
    assert_eq!(store.get_config("proj").await.unwrap(), Some(config));

    let updated = FirewallConfig {
        enabled: false,
        ..FirewallConfig::default()
    };
    store.put_config("proj", updated.clone()).await.unwrap();
    assert_eq!(store.get_config("proj").await.unwrap(), Some(updated));
}

#[tokio::test]
async fn test_access_request_lifecycle_in_database() {
    let store = Arc::new(setup_store().await);
    let access = AccessRequests::new(store.clone());

    let first = access
        .record_block("proj", "1.2.3.4", "GET", "/admin", Some(1), "blocked")
        .await
        .unwrap();
    let repeat = access
        .record_block("proj", "1.2.3.4", "GET", "/admin", Some(1), "blocked")
        .await
        .unwrap();
    assert_eq!(first.id, repeat.id);
    assert_eq!(first.status, AccessStatus::Pending);

    let t0 = Utc::now();
    let approved = access.approve_at("proj", first.id, 5, t0).await.unwrap();
    assert_eq!(approved.status, AccessStatus::Approved);

    assert!(access
        .is_approved("proj", "1.2.3.4", "GET", "/admin", t0 + Duration::minutes(4))
        .await
        .unwrap());
    assert!(!access
        .is_approved("proj", "1.2.3.4", "GET", "/admin", t0 + Duration::minutes(6))
        .await
        .unwrap());

    // Approval is not pending any more, so a new block opens a new record
    let second = access
        .record_block("proj", "1.2.3.4", "GET", "/admin", Some(1), "blocked")
        .await
        .unwrap();
    assert_ne!(second.id, first.id);

    let revoked = access.revoke("proj", first.id).await.unwrap();
    assert_eq!(revoked.status, AccessStatus::Revoked);
    assert!(access.revoke("proj", first.id).await.is_err());

    let listed = access.list("proj", None).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);

    let pending = access
        .list("proj", Some(AccessStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn test_transition_is_compare_and_set() {
    let store = setup_store().await;
    let access = AccessRequests::new(Arc::new(store.clone()));
    let record = access
        .record_block("proj", "1.2.3.4", "GET", "/x", None, "blocked")
        .await
        .unwrap();

    let now = Utc::now();
    let first = store
        .transition(
            record.id,
            AccessStatus::Pending,
            AccessStatus::Rejected,
            None,
            now,
        )
        .await
        .unwrap();
    assert_eq!(first.map(|r| r.status), Some(AccessStatus::Rejected));

    let second = store
        .transition(
            record.id,
            AccessStatus::Pending,
            AccessStatus::Approved,
            Some(now + Duration::minutes(5)),
            now,
        )
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn test_bulk_revocation() {
    let store = Arc::new(setup_store().await);
    let access = AccessRequests::new(store);

    for (ip, path) in [("1.1.1.1", "/a"), ("1.1.1.1", "/b"), ("2.2.2.2", "/a")] {
        let r = access
            .record_block("proj", ip, "GET", path, None, "blocked")
            .await
            .unwrap();
        access.approve("proj", r.id, 10).await.unwrap();
    }

    assert_eq!(access.revoke_by_ip("proj", "1.1.1.1").await.unwrap(), 2);
    assert_eq!(access.revoke_all("proj").await.unwrap(), 1);
    assert!(access
        .list("proj", Some(AccessStatus::Approved))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_routing_table() {
    let store = setup_store().await;
    assert!(store.resolve("myapp-alice").await.unwrap().is_none());

    let entry = RoutingEntry {
        subdomain: "myapp-alice".into(),
        project_id: "proj-1".into(),
        agent_id: "agent-1".into(),
        local_port: 3000,
    };
    store.upsert(entry.clone()).await.unwrap();
    assert_eq!(store.resolve("myapp-alice").await.unwrap(), Some(entry.clone()));

    let moved = RoutingEntry {
        agent_id: "agent-2".into(),
        local_port: 8080,
        ..entry
    };
    store.upsert(moved.clone()).await.unwrap();
    assert_eq!(store.resolve("myapp-alice").await.unwrap(), Some(moved));
    assert_eq!(RoutingTable::list(&store).await.unwrap().len(), 1);

    assert!(store.remove("myapp-alice").await.unwrap());
    assert!(!store.remove("myapp-alice").await.unwrap());
}
