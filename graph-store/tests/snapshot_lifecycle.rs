//! Snapshot lifecycle: staging writes, validated promotion, reader survival.

use graph_store::{GraphReader, GraphStoreError, GraphWriter, VersionManager};
use okta_client::models::{GroupRecord, UserRecord};
use tempfile::TempDir;

fn group(id: &str, name: &str) -> GroupRecord {
    GroupRecord {
        okta_id: id.to_string(),
        name: Some(name.to_string()),
        description: None,
        group_type: Some("OKTA_GROUP".into()),
        source_type: "OKTA_NATIVE".into(),
        created_at: None,
        last_updated_at: None,
    }
}

fn user(id: &str, login: &str) -> UserRecord {
    UserRecord {
        okta_id: id.to_string(),
        email: Some(login.to_string()),
        first_name: None,
        last_name: None,
        login: Some(login.to_string()),
        status: Some("ACTIVE".into()),
        mobile_phone: None,
        primary_phone: None,
        employee_number: None,
        department: None,
        manager: None,
        user_type: None,
        country_code: None,
        title: None,
        organization: None,
        custom_attributes: Default::default(),
        created_at: None,
        last_updated_at: None,
        password_changed_at: None,
        status_changed_at: None,
        group_memberships: vec![],
        app_links: vec![],
        factors: vec![],
    }
}

fn build_snapshot(manager: &VersionManager, users: &[UserRecord]) {
    let writer = GraphWriter::open(&manager.staging_path(), &[]).unwrap();
    writer.sync_groups(&[group("g1", "Engineering")], "acme");
    writer.sync_users(users, "acme");
}

#[test]
fn test_validated_promotion_and_reader_survival() {
    let dir = TempDir::new().unwrap();
    let manager = VersionManager::new(dir.path(), 2).unwrap();
    assert_eq!(manager.current_version(), 1);

    build_snapshot(&manager, &[user("u1", "jo@acme.com")]);
    assert_eq!(manager.promote_staging(true).unwrap(), 2);

    // A reader that resolved the current path keeps working...
    let old_path = manager.current_path();
    let old_reader = GraphReader::open(&old_path).unwrap();
    assert_eq!(old_reader.user_count().unwrap(), 1);

    // ...even after another build-and-promote cycle.
    build_snapshot(
        &manager,
        &[user("u1", "jo@acme.com"), user("u2", "sam@acme.com")],
    );
    assert_eq!(manager.promote_staging(true).unwrap(), 3);

    assert_eq!(old_reader.user_count().unwrap(), 1);
    assert!(old_path.exists());

    // A fresh resolution sees the new version.
    let new_path = manager.current_path();
    assert!(new_path.ends_with("okta_v3"));
    let new_reader = GraphReader::open(&new_path).unwrap();
    assert_eq!(new_reader.user_count().unwrap(), 2);
}

#[test]
fn test_empty_staging_is_never_promoted() {
    let dir = TempDir::new().unwrap();
    let manager = VersionManager::new(dir.path(), 2).unwrap();

    // Snapshot exists but holds zero users.
    let writer = GraphWriter::open(&manager.staging_path(), &[]).unwrap();
    writer.sync_groups(&[group("g1", "Engineering")], "acme");
    drop(writer);

    let err = manager.promote_staging(true).unwrap_err();
    assert!(matches!(err, GraphStoreError::ValidationFailed(_)));
    assert_eq!(manager.current_version(), 1);

    // Unvalidated promotion still goes through (policy decision upstream).
    assert_eq!(manager.promote_staging(false).unwrap(), 2);
}

#[test]
fn test_custom_attribute_round_trip_through_reader() {
    let dir = TempDir::new().unwrap();
    let manager = VersionManager::new(dir.path(), 2).unwrap();

    let writer =
        GraphWriter::open(&manager.staging_path(), &["SLT_DEPT".to_string()]).unwrap();
    let mut u = user("u1", "jo@acme.com");
    u.custom_attributes
        .insert("SLT_DEPT".to_string(), "Security".to_string());
    writer.sync_users(&[u, user("u2", "sam@acme.com")], "acme");
    drop(writer);
    manager.promote_staging(true).unwrap();

    let reader = GraphReader::open(&manager.current_path()).unwrap();
    assert_eq!(
        reader.user_column("acme", "u1", "SLT_DEPT").unwrap().as_deref(),
        Some("Security")
    );
    assert_eq!(reader.user_column("acme", "u2", "SLT_DEPT").unwrap(), None);
}

#[test]
fn test_counts_are_tenant_scoped() {
    let dir = TempDir::new().unwrap();
    let manager = VersionManager::new(dir.path(), 2).unwrap();

    let writer = GraphWriter::open(&manager.staging_path(), &[]).unwrap();
    writer.sync_users(&[user("u1", "jo@acme.com")], "acme");
    writer.sync_users(&[user("u9", "other@example.com")], "globex");
    drop(writer);
    manager.promote_staging(true).unwrap();

    let reader = GraphReader::open(&manager.current_path()).unwrap();
    assert_eq!(reader.node_count("users", "acme").unwrap(), 1);
    assert_eq!(reader.node_count("users", "globex").unwrap(), 1);
    assert_eq!(reader.node_count("users", "initech").unwrap(), 0);
    assert_eq!(reader.user_count().unwrap(), 2);
}
