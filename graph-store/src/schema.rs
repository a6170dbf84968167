//! Snapshot schema bootstrap.
//!
//! Every snapshot is a self-contained DuckDB database holding one node table
//! per entity kind and one table per edge kind. Node identity is
//! `(tenant_id, okta_id)`. Bootstrap is idempotent: re-opening an existing
//! snapshot re-runs the DDL as no-ops.

use duckdb::Connection;
use tracing::{debug, warn};

use crate::error::GraphStoreResult;

/// Node tables. Edge endpoints must exist in these before edge insertion.
const NODE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    tenant_id VARCHAR NOT NULL,
    okta_id VARCHAR NOT NULL,
    display_name VARCHAR,
    email VARCHAR,
    first_name VARCHAR,
    last_name VARCHAR,
    login VARCHAR,
    status VARCHAR,
    mobile_phone VARCHAR,
    primary_phone VARCHAR,
    employee_number VARCHAR,
    department VARCHAR,
    manager VARCHAR,
    title VARCHAR,
    organization VARCHAR,
    user_type VARCHAR,
    country_code VARCHAR,
    created_at TIMESTAMP,
    last_updated_at TIMESTAMP,
    password_changed_at TIMESTAMP,
    status_changed_at TIMESTAMP,
    last_synced_at TIMESTAMP NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (tenant_id, okta_id)
);

CREATE TABLE IF NOT EXISTS okta_groups (
    tenant_id VARCHAR NOT NULL,
    okta_id VARCHAR NOT NULL,
    name VARCHAR,
    description VARCHAR,
    group_type VARCHAR,
    source_type VARCHAR,
    created_at TIMESTAMP,
    last_updated_at TIMESTAMP,
    last_synced_at TIMESTAMP NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (tenant_id, okta_id)
);

CREATE TABLE IF NOT EXISTS applications (
    tenant_id VARCHAR NOT NULL,
    okta_id VARCHAR NOT NULL,
    name VARCHAR,
    label VARCHAR,
    status VARCHAR,
    sign_on_mode VARCHAR,
    sign_on_url VARCHAR,
    audience VARCHAR,
    destination VARCHAR,
    metadata_url VARCHAR,
    policy_id VARCHAR,
    signing_kid VARCHAR,
    username_template VARCHAR,
    username_template_type VARCHAR,
    implicit_assignment BOOLEAN DEFAULT false,
    admin_note VARCHAR,
    attribute_statements VARCHAR,
    honor_force_authn BOOLEAN DEFAULT false,
    hide_ios BOOLEAN DEFAULT false,
    hide_web BOOLEAN DEFAULT false,
    created_at TIMESTAMP,
    last_updated_at TIMESTAMP,
    last_synced_at TIMESTAMP NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (tenant_id, okta_id)
);

CREATE TABLE IF NOT EXISTS policies (
    tenant_id VARCHAR NOT NULL,
    okta_id VARCHAR NOT NULL,
    name VARCHAR,
    description VARCHAR,
    type VARCHAR,
    status VARCHAR,
    priority BIGINT,
    system BOOLEAN DEFAULT false,
    created_at TIMESTAMP,
    last_updated_at TIMESTAMP,
    last_synced_at TIMESTAMP NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (tenant_id, okta_id)
);

CREATE TABLE IF NOT EXISTS factors (
    tenant_id VARCHAR NOT NULL,
    okta_id VARCHAR NOT NULL,
    factor_type VARCHAR,
    provider VARCHAR,
    status VARCHAR,
    device_type VARCHAR,
    device_name VARCHAR,
    platform VARCHAR,
    phone_number VARCHAR,
    email VARCHAR,
    created_at TIMESTAMP,
    last_updated_at TIMESTAMP,
    last_synced_at TIMESTAMP NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (tenant_id, okta_id)
);

CREATE TABLE IF NOT EXISTS devices (
    tenant_id VARCHAR NOT NULL,
    okta_id VARCHAR NOT NULL,
    status VARCHAR,
    display_name VARCHAR,
    platform VARCHAR,
    manufacturer VARCHAR,
    model VARCHAR,
    os_version VARCHAR,
    serial_number VARCHAR,
    udid VARCHAR,
    registered BOOLEAN DEFAULT false,
    secure_hardware_present BOOLEAN DEFAULT false,
    disk_encryption_type VARCHAR,
    created_at TIMESTAMP,
    last_updated_at TIMESTAMP,
    last_synced_at TIMESTAMP NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (tenant_id, okta_id)
);

CREATE TABLE IF NOT EXISTS network_zones (
    tenant_id VARCHAR NOT NULL,
    okta_id VARCHAR NOT NULL,
    name VARCHAR,
    type VARCHAR,
    status VARCHAR,
    last_synced_at TIMESTAMP NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (tenant_id, okta_id)
);

CREATE TABLE IF NOT EXISTS policy_rules (
    tenant_id VARCHAR NOT NULL,
    okta_id VARCHAR NOT NULL,
    name VARCHAR,
    status VARCHAR,
    priority BIGINT,
    last_synced_at TIMESTAMP NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT false,
    PRIMARY KEY (tenant_id, okta_id)
);
"#;

/// Edge tables. Every edge carries its tenant and assignment instant.
const EDGE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS member_of (
    tenant_id VARCHAR NOT NULL,
    user_okta_id VARCHAR NOT NULL,
    group_okta_id VARCHAR NOT NULL,
    assigned_at TIMESTAMP,
    PRIMARY KEY (tenant_id, user_okta_id, group_okta_id)
);

CREATE TABLE IF NOT EXISTS has_access (
    tenant_id VARCHAR NOT NULL,
    user_okta_id VARCHAR NOT NULL,
    application_okta_id VARCHAR NOT NULL,
    scope VARCHAR,
    hidden BOOLEAN DEFAULT false,
    credentials_setup BOOLEAN DEFAULT false,
    assigned_at TIMESTAMP,
    PRIMARY KEY (tenant_id, user_okta_id, application_okta_id)
);

CREATE TABLE IF NOT EXISTS group_has_access (
    tenant_id VARCHAR NOT NULL,
    group_okta_id VARCHAR NOT NULL,
    application_okta_id VARCHAR NOT NULL,
    priority BIGINT DEFAULT 0,
    assigned_at TIMESTAMP,
    PRIMARY KEY (tenant_id, group_okta_id, application_okta_id)
);

CREATE TABLE IF NOT EXISTS enrolled (
    tenant_id VARCHAR NOT NULL,
    user_okta_id VARCHAR NOT NULL,
    factor_okta_id VARCHAR NOT NULL,
    assigned_at TIMESTAMP,
    PRIMARY KEY (tenant_id, user_okta_id, factor_okta_id)
);

CREATE TABLE IF NOT EXISTS owns (
    tenant_id VARCHAR NOT NULL,
    user_okta_id VARCHAR NOT NULL,
    device_okta_id VARCHAR NOT NULL,
    management_status VARCHAR,
    screen_lock_type VARCHAR,
    assigned_at TIMESTAMP,
    PRIMARY KEY (tenant_id, user_okta_id, device_okta_id)
);

CREATE TABLE IF NOT EXISTS governed_by (
    tenant_id VARCHAR NOT NULL,
    application_okta_id VARCHAR NOT NULL,
    policy_okta_id VARCHAR NOT NULL,
    assigned_at TIMESTAMP,
    PRIMARY KEY (tenant_id, application_okta_id)
);

CREATE TABLE IF NOT EXISTS contains_rule (
    tenant_id VARCHAR NOT NULL,
    policy_okta_id VARCHAR NOT NULL,
    rule_okta_id VARCHAR NOT NULL,
    assigned_at TIMESTAMP,
    PRIMARY KEY (tenant_id, policy_okta_id, rule_okta_id)
);

CREATE TABLE IF NOT EXISTS applies_to_groups (
    tenant_id VARCHAR NOT NULL,
    rule_okta_id VARCHAR NOT NULL,
    group_okta_id VARCHAR NOT NULL,
    assigned_at TIMESTAMP,
    PRIMARY KEY (tenant_id, rule_okta_id, group_okta_id)
);

CREATE TABLE IF NOT EXISTS applies_to_users (
    tenant_id VARCHAR NOT NULL,
    rule_okta_id VARCHAR NOT NULL,
    user_okta_id VARCHAR NOT NULL,
    assigned_at TIMESTAMP,
    PRIMARY KEY (tenant_id, rule_okta_id, user_okta_id)
);

CREATE TABLE IF NOT EXISTS reports_to (
    tenant_id VARCHAR NOT NULL,
    user_okta_id VARCHAR NOT NULL,
    manager_okta_id VARCHAR NOT NULL,
    assigned_at TIMESTAMP,
    PRIMARY KEY (tenant_id, user_okta_id)
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);
CREATE INDEX IF NOT EXISTS idx_users_login ON users(login);
CREATE INDEX IF NOT EXISTS idx_users_status ON users(status);
CREATE INDEX IF NOT EXISTS idx_groups_name ON okta_groups(name);
CREATE INDEX IF NOT EXISTS idx_apps_label ON applications(label);
CREATE INDEX IF NOT EXISTS idx_apps_status ON applications(status);
CREATE INDEX IF NOT EXISTS idx_policies_name ON policies(name);
CREATE INDEX IF NOT EXISTS idx_factors_type ON factors(factor_type);
"#;

pub fn bootstrap(conn: &Connection) -> GraphStoreResult<()> {
    conn.execute_batch(NODE_TABLES)?;
    conn.execute_batch(EDGE_TABLES)?;
    conn.execute_batch(INDEXES)?;
    debug!("Snapshot schema ready");
    Ok(())
}

/// Sanitize a tenant-configured attribute name into a safe column name:
/// hyphens, spaces and dots become underscores, anything else outside
/// `[A-Za-z0-9_]` is replaced with an underscore.
pub fn sanitize_attribute_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Add one VARCHAR column per configured custom attribute to the users
/// table. Idempotent across syncs against a reused staging snapshot.
pub fn ensure_custom_columns(conn: &Connection, attributes: &[String]) -> Vec<(String, String)> {
    let mut mapping = Vec::with_capacity(attributes.len());
    for raw in attributes {
        if raw.is_empty() {
            continue;
        }
        let column = sanitize_attribute_name(raw);
        let ddl = format!("ALTER TABLE users ADD COLUMN IF NOT EXISTS \"{column}\" VARCHAR");
        match conn.execute_batch(&ddl) {
            Ok(()) => {
                debug!(attribute = %raw, column = %column, "Custom attribute column ready");
                mapping.push((raw.clone(), column));
            }
            Err(err) => {
                warn!(attribute = %raw, error = %err, "Could not add custom attribute column");
            }
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_attribute_name() {
        assert_eq!(sanitize_attribute_name("SLT_DEPT"), "SLT_DEPT");
        assert_eq!(sanitize_attribute_name("cost-center"), "cost_center");
        assert_eq!(sanitize_attribute_name("org.unit name"), "org_unit_name");
        assert_eq!(sanitize_attribute_name("weird!chars?"), "weird_chars_");
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();
        bootstrap(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT count(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_custom_columns_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();

        let attrs = vec!["SLT_DEPT".to_string(), "cost-center".to_string()];
        let mapping = ensure_custom_columns(&conn, &attrs);
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping[1].1, "cost_center");

        // Second pass is a no-op, not an error.
        let mapping = ensure_custom_columns(&conn, &attrs);
        assert_eq!(mapping.len(), 2);

        conn.execute(
            "INSERT INTO users (tenant_id, okta_id, \"SLT_DEPT\", last_synced_at)
             VALUES ('t', 'u1', 'Security', now())",
            [],
        )
        .unwrap();
        let dept: String = conn
            .query_row(
                "SELECT \"SLT_DEPT\" FROM users WHERE okta_id = 'u1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(dept, "Security");
    }
}
