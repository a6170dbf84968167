//! Read-only access to a snapshot.
//!
//! Readers open the directory returned by `VersionManager::current_path()`
//! and keep working against it even after a newer version is promoted; the
//! directory survives one retention cycle.

use std::path::Path;

use duckdb::{AccessMode, Config, Connection, params};
use parking_lot::Mutex;

use crate::error::{GraphStoreError, GraphStoreResult};
use crate::schema::sanitize_attribute_name;
use crate::writer::SNAPSHOT_DB_FILE;

const NODE_TABLES: [&str; 8] = [
    "users",
    "okta_groups",
    "applications",
    "policies",
    "factors",
    "devices",
    "network_zones",
    "policy_rules",
];

const EDGE_TABLES: [&str; 10] = [
    "member_of",
    "has_access",
    "group_has_access",
    "enrolled",
    "owns",
    "governed_by",
    "contains_rule",
    "applies_to_groups",
    "applies_to_users",
    "reports_to",
];

pub struct GraphReader {
    conn: Mutex<Connection>,
}

impl GraphReader {
    pub fn open(snapshot_dir: &Path) -> GraphStoreResult<Self> {
        let db_path = snapshot_dir.join(SNAPSHOT_DB_FILE);
        if !db_path.exists() {
            return Err(GraphStoreError::ValidationFailed(format!(
                "no snapshot database at {}",
                db_path.display()
            )));
        }
        let config = Config::default().access_mode(AccessMode::ReadOnly)?;
        let conn = Connection::open_with_flags(&db_path, config)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Total user nodes across tenants; promotion validation requires > 0.
    pub fn user_count(&self) -> GraphStoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn node_count(&self, table: &str, tenant_id: &str) -> GraphStoreResult<u64> {
        if !NODE_TABLES.contains(&table) {
            return Err(GraphStoreError::Schema(format!("unknown node table {table}")));
        }
        self.count(table, tenant_id)
    }

    pub fn edge_count(&self, table: &str, tenant_id: &str) -> GraphStoreResult<u64> {
        if !EDGE_TABLES.contains(&table) {
            return Err(GraphStoreError::Schema(format!("unknown edge table {table}")));
        }
        self.count(table, tenant_id)
    }

    fn count(&self, table: &str, tenant_id: &str) -> GraphStoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT count(*) FROM {table} WHERE tenant_id = ?"),
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn has_member_of(&self, tenant_id: &str, user_id: &str, group_id: &str) -> GraphStoreResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM member_of
             WHERE tenant_id = ? AND user_okta_id = ? AND group_okta_id = ?",
            params![tenant_id, user_id, group_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn has_user_access(&self, tenant_id: &str, user_id: &str, app_id: &str) -> GraphStoreResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM has_access
             WHERE tenant_id = ? AND user_okta_id = ? AND application_okta_id = ?",
            params![tenant_id, user_id, app_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn has_group_access(&self, tenant_id: &str, group_id: &str, app_id: &str) -> GraphStoreResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM group_has_access
             WHERE tenant_id = ? AND group_okta_id = ? AND application_okta_id = ?",
            params![tenant_id, group_id, app_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Read one user column (including dynamic custom-attribute columns).
    pub fn user_column(
        &self,
        tenant_id: &str,
        okta_id: &str,
        column: &str,
    ) -> GraphStoreResult<Option<String>> {
        let column = sanitize_attribute_name(column);
        let conn = self.conn.lock();
        let value: Option<String> = conn.query_row(
            &format!(
                "SELECT CAST(\"{column}\" AS VARCHAR) FROM users WHERE tenant_id = ? AND okta_id = ?"
            ),
            params![tenant_id, okta_id],
            |row| row.get(0),
        )?;
        Ok(value)
    }
}
