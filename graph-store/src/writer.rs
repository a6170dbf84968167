//! Idempotent upsert of entity batches into the staging snapshot.
//!
//! One writer exclusively owns a staging snapshot for the duration of a
//! sync. Writes happen immediately as fetcher batches arrive: a user lands
//! together with its membership, access, and enrollment edges, so readers of
//! a promoted snapshot never see a half-written bundle. Node upserts key on
//! `(tenant_id, okta_id)`; re-running a sync against unchanged data changes
//! nothing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use duckdb::{Connection, params, params_from_iter};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use okta_client::models::{
    ApplicationRecord, DeviceRecord, GroupRecord, PolicyRecord, UserRecord,
};

use crate::error::GraphStoreResult;
use crate::schema;

/// File name of the DuckDB database inside a snapshot directory.
pub const SNAPSHOT_DB_FILE: &str = "graph.duckdb";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub users: u64,
    pub groups: u64,
    pub apps: u64,
    pub policies: u64,
    pub devices: u64,
    pub factors: u64,
}

pub struct GraphWriter {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    /// Raw attribute name → sanitized column name, fixed at snapshot open.
    custom_columns: Vec<(String, String)>,
    write_errors: AtomicU64,
}

/// TIMESTAMP literal DuckDB accepts for parameter casts.
fn ts(value: Option<&DateTime<Utc>>) -> Option<String> {
    value.map(|v| v.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
}

fn now_ts() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

impl GraphWriter {
    /// Open (creating if needed) the staging snapshot at `snapshot_dir` and
    /// bootstrap its schema, including the tenant's custom-attribute columns.
    pub fn open(snapshot_dir: &Path, custom_attributes: &[String]) -> GraphStoreResult<Self> {
        std::fs::create_dir_all(snapshot_dir)?;
        let db_path = snapshot_dir.join(SNAPSHOT_DB_FILE);
        let conn = Connection::open(&db_path)?;
        schema::bootstrap(&conn)?;
        let custom_columns = schema::ensure_custom_columns(&conn, custom_attributes);
        info!(path = %db_path.display(), custom_columns = custom_columns.len(), "Staging snapshot open");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            custom_columns,
            write_errors: AtomicU64::new(0),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Records skipped or partially written across the life of this writer.
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::SeqCst)
    }

    fn note_error(&self, entity: &str, okta_id: &str, err: &duckdb::Error) {
        self.write_errors.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("graph_write_errors_total").increment(1);
        error!(entity, okta_id, error = %err, "Graph write failed, record skipped");
    }

    pub fn sync_groups(&self, groups: &[GroupRecord], tenant_id: &str) -> usize {
        let conn = self.conn.lock();
        let mut synced = 0usize;
        for group in groups {
            let result = conn.execute(
                r#"
                INSERT INTO okta_groups (tenant_id, okta_id, name, description, group_type,
                                         source_type, created_at, last_updated_at, last_synced_at, is_deleted)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, false)
                ON CONFLICT (tenant_id, okta_id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    group_type = excluded.group_type,
                    source_type = excluded.source_type,
                    created_at = excluded.created_at,
                    last_updated_at = excluded.last_updated_at,
                    last_synced_at = excluded.last_synced_at,
                    is_deleted = false
                "#,
                params![
                    tenant_id,
                    group.okta_id,
                    group.name,
                    group.description,
                    group.group_type,
                    group.source_type,
                    ts(group.created_at.as_ref()),
                    ts(group.last_updated_at.as_ref()),
                    now_ts(),
                ],
            );
            match result {
                Ok(_) => synced += 1,
                Err(err) => self.note_error("group", &group.okta_id, &err),
            }
        }
        info!(synced, total = groups.len(), "Group batch written");
        synced
    }

    pub fn sync_applications(&self, apps: &[ApplicationRecord], tenant_id: &str) -> usize {
        let conn = self.conn.lock();
        let mut synced = 0usize;
        for app in apps {
            let attribute_statements = if app.attribute_statements.is_empty() {
                None
            } else {
                serde_json::to_string(&app.attribute_statements).ok()
            };

            let result = conn.execute(
                r#"
                INSERT INTO applications (tenant_id, okta_id, name, label, status, sign_on_mode,
                                          sign_on_url, audience, destination, metadata_url, policy_id,
                                          signing_kid, username_template, username_template_type,
                                          implicit_assignment, admin_note, attribute_statements,
                                          honor_force_authn, hide_ios, hide_web,
                                          created_at, last_updated_at, last_synced_at, is_deleted)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, false)
                ON CONFLICT (tenant_id, okta_id) DO UPDATE SET
                    name = excluded.name,
                    label = excluded.label,
                    status = excluded.status,
                    sign_on_mode = excluded.sign_on_mode,
                    sign_on_url = excluded.sign_on_url,
                    audience = excluded.audience,
                    destination = excluded.destination,
                    metadata_url = excluded.metadata_url,
                    policy_id = excluded.policy_id,
                    signing_kid = excluded.signing_kid,
                    username_template = excluded.username_template,
                    username_template_type = excluded.username_template_type,
                    implicit_assignment = excluded.implicit_assignment,
                    admin_note = excluded.admin_note,
                    attribute_statements = excluded.attribute_statements,
                    honor_force_authn = excluded.honor_force_authn,
                    hide_ios = excluded.hide_ios,
                    hide_web = excluded.hide_web,
                    created_at = excluded.created_at,
                    last_updated_at = excluded.last_updated_at,
                    last_synced_at = excluded.last_synced_at,
                    is_deleted = false
                "#,
                params![
                    tenant_id,
                    app.okta_id,
                    app.name,
                    app.label,
                    app.status,
                    app.sign_on_mode,
                    app.sign_on_url,
                    app.audience,
                    app.destination,
                    app.metadata_url,
                    app.policy_id,
                    app.signing_kid,
                    app.username_template,
                    app.username_template_type,
                    app.implicit_assignment,
                    app.admin_note,
                    attribute_statements,
                    app.honor_force_authn,
                    app.hide_ios,
                    app.hide_web,
                    ts(app.created_at.as_ref()),
                    ts(app.last_updated_at.as_ref()),
                    now_ts(),
                ],
            );
            match result {
                Ok(_) => {
                    self.write_group_assignments(&conn, app, tenant_id);
                    synced += 1;
                }
                Err(err) => self.note_error("application", &app.okta_id, &err),
            }
        }
        info!(synced, total = apps.len(), "Application batch written");
        synced
    }

    fn write_group_assignments(&self, conn: &Connection, app: &ApplicationRecord, tenant_id: &str) {
        for assignment in &app.group_assignments {
            if !self.node_exists(conn, "okta_groups", tenant_id, &assignment.group_okta_id) {
                warn!(
                    group_id = %assignment.group_okta_id,
                    app_id = %app.okta_id,
                    "Skipping GROUP_HAS_ACCESS edge: group node missing"
                );
                continue;
            }
            let result = conn.execute(
                r#"
                INSERT INTO group_has_access (tenant_id, group_okta_id, application_okta_id, priority, assigned_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (tenant_id, group_okta_id, application_okta_id) DO UPDATE SET
                    priority = excluded.priority,
                    assigned_at = excluded.assigned_at
                "#,
                params![
                    tenant_id,
                    assignment.group_okta_id,
                    app.okta_id,
                    assignment.priority,
                    now_ts(),
                ],
            );
            if let Err(err) = result {
                self.note_error("group_has_access", &app.okta_id, &err);
            }
        }
    }

    /// Write a batch of users, each as a coherent bundle: the node first,
    /// then its membership, access and enrollment edges.
    pub fn sync_users(&self, users: &[UserRecord], tenant_id: &str) -> usize {
        let conn = self.conn.lock();
        let mut synced = 0usize;
        let sql = self.user_upsert_sql();

        for user in users {
            let mut values: Vec<Option<String>> = vec![
                Some(tenant_id.to_string()),
                Some(user.okta_id.clone()),
                Some(user.display_name()),
                user.email.clone(),
                user.first_name.clone(),
                user.last_name.clone(),
                user.login.clone(),
                user.status.clone(),
                user.mobile_phone.clone(),
                user.primary_phone.clone(),
                user.employee_number.clone(),
                user.department.clone(),
                user.manager.clone(),
                user.title.clone(),
                user.organization.clone(),
                user.user_type.clone(),
                user.country_code.clone(),
                ts(user.created_at.as_ref()),
                ts(user.last_updated_at.as_ref()),
                ts(user.password_changed_at.as_ref()),
                ts(user.status_changed_at.as_ref()),
            ];
            for (raw, _) in &self.custom_columns {
                values.push(user.custom_attributes.get(raw).cloned());
            }
            values.push(Some(now_ts()));

            match conn.execute(&sql, params_from_iter(values)) {
                Ok(_) => {
                    self.write_user_edges(&conn, user, tenant_id);
                    synced += 1;
                }
                Err(err) => self.note_error("user", &user.okta_id, &err),
            }
        }
        info!(synced, total = users.len(), "User batch written");
        synced
    }

    fn user_upsert_sql(&self) -> String {
        let base_columns = [
            "tenant_id",
            "okta_id",
            "display_name",
            "email",
            "first_name",
            "last_name",
            "login",
            "status",
            "mobile_phone",
            "primary_phone",
            "employee_number",
            "department",
            "manager",
            "title",
            "organization",
            "user_type",
            "country_code",
            "created_at",
            "last_updated_at",
            "password_changed_at",
            "status_changed_at",
        ];

        let mut columns: Vec<String> = base_columns.iter().map(|c| (*c).to_string()).collect();
        for (_, column) in &self.custom_columns {
            columns.push(format!("\"{column}\""));
        }
        columns.push("last_synced_at".to_string());

        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates = columns
            .iter()
            .skip(2) // identity columns never change
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(",\n                    ");

        format!(
            r#"
            INSERT INTO users ({cols}, is_deleted)
            VALUES ({placeholders}, false)
            ON CONFLICT (tenant_id, okta_id) DO UPDATE SET
                {updates},
                is_deleted = false
            "#,
            cols = columns.join(", "),
        )
    }

    fn write_user_edges(&self, conn: &Connection, user: &UserRecord, tenant_id: &str) {
        for group_id in &user.group_memberships {
            if !self.node_exists(conn, "okta_groups", tenant_id, group_id) {
                warn!(user_id = %user.okta_id, group_id = %group_id, "Skipping MEMBER_OF edge: group node missing");
                continue;
            }
            let result = conn.execute(
                r#"
                INSERT INTO member_of (tenant_id, user_okta_id, group_okta_id, assigned_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (tenant_id, user_okta_id, group_okta_id) DO UPDATE SET
                    assigned_at = excluded.assigned_at
                "#,
                params![tenant_id, user.okta_id, group_id, now_ts()],
            );
            if let Err(err) = result {
                self.note_error("member_of", &user.okta_id, &err);
            }
        }

        for link in &user.app_links {
            if !self.node_exists(conn, "applications", tenant_id, &link.application_okta_id) {
                warn!(
                    user_id = %user.okta_id,
                    app_id = %link.application_okta_id,
                    "Skipping HAS_ACCESS edge: application node missing"
                );
                continue;
            }
            let result = conn.execute(
                r#"
                INSERT INTO has_access (tenant_id, user_okta_id, application_okta_id,
                                        scope, hidden, credentials_setup, assigned_at)
                VALUES (?, ?, ?, 'USER', ?, ?, ?)
                ON CONFLICT (tenant_id, user_okta_id, application_okta_id) DO UPDATE SET
                    scope = excluded.scope,
                    hidden = excluded.hidden,
                    credentials_setup = excluded.credentials_setup,
                    assigned_at = excluded.assigned_at
                "#,
                params![
                    tenant_id,
                    user.okta_id,
                    link.application_okta_id,
                    link.hidden,
                    link.credentials_setup,
                    now_ts(),
                ],
            );
            if let Err(err) = result {
                self.note_error("has_access", &user.okta_id, &err);
            }
        }

        for factor in &user.factors {
            let result = conn.execute(
                r#"
                INSERT INTO factors (tenant_id, okta_id, factor_type, provider, status,
                                     device_type, device_name, platform, phone_number, email,
                                     created_at, last_updated_at, last_synced_at, is_deleted)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, false)
                ON CONFLICT (tenant_id, okta_id) DO UPDATE SET
                    factor_type = excluded.factor_type,
                    provider = excluded.provider,
                    status = excluded.status,
                    device_type = excluded.device_type,
                    device_name = excluded.device_name,
                    platform = excluded.platform,
                    phone_number = excluded.phone_number,
                    email = excluded.email,
                    created_at = excluded.created_at,
                    last_updated_at = excluded.last_updated_at,
                    last_synced_at = excluded.last_synced_at,
                    is_deleted = false
                "#,
                params![
                    tenant_id,
                    factor.okta_id,
                    factor.factor_type,
                    factor.provider,
                    factor.status,
                    factor.device_type,
                    factor.device_name,
                    factor.platform,
                    factor.phone_number,
                    factor.email,
                    ts(factor.created_at.as_ref()),
                    ts(factor.last_updated_at.as_ref()),
                    now_ts(),
                ],
            );
            if let Err(err) = result {
                self.note_error("factor", &factor.okta_id, &err);
                continue;
            }
            let result = conn.execute(
                r#"
                INSERT INTO enrolled (tenant_id, user_okta_id, factor_okta_id, assigned_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (tenant_id, user_okta_id, factor_okta_id) DO UPDATE SET
                    assigned_at = excluded.assigned_at
                "#,
                params![
                    tenant_id,
                    user.okta_id,
                    factor.okta_id,
                    ts(factor.created_at.as_ref()).or_else(|| Some(now_ts())),
                ],
            );
            if let Err(err) = result {
                self.note_error("enrolled", &user.okta_id, &err);
            }
        }
    }

    pub fn sync_devices(&self, devices: &[DeviceRecord], tenant_id: &str) -> usize {
        let conn = self.conn.lock();
        let mut synced = 0usize;
        for device in devices {
            let result = conn.execute(
                r#"
                INSERT INTO devices (tenant_id, okta_id, status, display_name, platform,
                                     manufacturer, model, os_version, serial_number, udid,
                                     registered, secure_hardware_present, disk_encryption_type,
                                     created_at, last_updated_at, last_synced_at, is_deleted)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, false)
                ON CONFLICT (tenant_id, okta_id) DO UPDATE SET
                    status = excluded.status,
                    display_name = excluded.display_name,
                    platform = excluded.platform,
                    manufacturer = excluded.manufacturer,
                    model = excluded.model,
                    os_version = excluded.os_version,
                    serial_number = excluded.serial_number,
                    udid = excluded.udid,
                    registered = excluded.registered,
                    secure_hardware_present = excluded.secure_hardware_present,
                    disk_encryption_type = excluded.disk_encryption_type,
                    created_at = excluded.created_at,
                    last_updated_at = excluded.last_updated_at,
                    last_synced_at = excluded.last_synced_at,
                    is_deleted = false
                "#,
                params![
                    tenant_id,
                    device.okta_id,
                    device.status,
                    device.display_name,
                    device.platform,
                    device.manufacturer,
                    device.model,
                    device.os_version,
                    device.serial_number,
                    device.udid,
                    device.registered,
                    device.secure_hardware_present,
                    device.disk_encryption_type,
                    ts(device.created_at.as_ref()),
                    ts(device.last_updated_at.as_ref()),
                    now_ts(),
                ],
            );
            match result {
                Ok(_) => {
                    self.write_device_owners(&conn, device, tenant_id);
                    synced += 1;
                }
                Err(err) => self.note_error("device", &device.okta_id, &err),
            }
        }
        info!(synced, total = devices.len(), "Device batch written");
        synced
    }

    fn write_device_owners(&self, conn: &Connection, device: &DeviceRecord, tenant_id: &str) {
        for owner in &device.owners {
            if !self.node_exists(conn, "users", tenant_id, &owner.user_okta_id) {
                warn!(
                    device_id = %device.okta_id,
                    user_id = %owner.user_okta_id,
                    "Skipping OWNS edge: user node missing"
                );
                continue;
            }
            let result = conn.execute(
                r#"
                INSERT INTO owns (tenant_id, user_okta_id, device_okta_id,
                                  management_status, screen_lock_type, assigned_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (tenant_id, user_okta_id, device_okta_id) DO UPDATE SET
                    management_status = excluded.management_status,
                    screen_lock_type = excluded.screen_lock_type,
                    assigned_at = excluded.assigned_at
                "#,
                params![
                    tenant_id,
                    owner.user_okta_id,
                    device.okta_id,
                    owner.management_status,
                    owner.screen_lock_type,
                    ts(owner.assigned_at.as_ref()).or_else(|| Some(now_ts())),
                ],
            );
            if let Err(err) = result {
                self.note_error("owns", &device.okta_id, &err);
            }
        }
    }

    pub fn sync_policies(&self, policies: &[PolicyRecord], tenant_id: &str) -> usize {
        let conn = self.conn.lock();
        let mut synced = 0usize;
        for policy in policies {
            let result = conn.execute(
                r#"
                INSERT INTO policies (tenant_id, okta_id, name, description, type, status,
                                      priority, system, created_at, last_updated_at,
                                      last_synced_at, is_deleted)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, false)
                ON CONFLICT (tenant_id, okta_id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    type = excluded.type,
                    status = excluded.status,
                    priority = excluded.priority,
                    system = excluded.system,
                    created_at = excluded.created_at,
                    last_updated_at = excluded.last_updated_at,
                    last_synced_at = excluded.last_synced_at,
                    is_deleted = false
                "#,
                params![
                    tenant_id,
                    policy.okta_id,
                    policy.name,
                    policy.description,
                    policy.policy_type,
                    policy.status,
                    policy.priority,
                    policy.system,
                    ts(policy.created_at.as_ref()),
                    ts(policy.last_updated_at.as_ref()),
                    now_ts(),
                ],
            );
            match result {
                Ok(_) => synced += 1,
                Err(err) => self.note_error("policy", &policy.okta_id, &err),
            }
        }
        info!(synced, total = policies.len(), "Policy batch written");
        synced
    }

    /// Materialize GOVERNED_BY from the policy reference each application
    /// carries. Run after the policy phase so both endpoints exist.
    pub fn link_governed_by(&self, tenant_id: &str) -> GraphStoreResult<usize> {
        let conn = self.conn.lock();
        let linked = conn.execute(
            r#"
            INSERT INTO governed_by (tenant_id, application_okta_id, policy_okta_id, assigned_at)
            SELECT a.tenant_id, a.okta_id, p.okta_id, now()
            FROM applications a
            JOIN policies p ON p.tenant_id = a.tenant_id AND p.okta_id = a.policy_id
            WHERE a.tenant_id = ? AND a.policy_id IS NOT NULL
            ON CONFLICT (tenant_id, application_okta_id) DO UPDATE SET
                policy_okta_id = excluded.policy_okta_id,
                assigned_at = excluded.assigned_at
            "#,
            params![tenant_id],
        )?;
        info!(linked, "GOVERNED_BY edges materialized");
        Ok(linked)
    }

    /// Materialize REPORTS_TO by matching each user's manager field against
    /// logins. Run after the user phase.
    pub fn link_reports_to(&self, tenant_id: &str) -> GraphStoreResult<usize> {
        let conn = self.conn.lock();
        let linked = conn.execute(
            r#"
            INSERT INTO reports_to (tenant_id, user_okta_id, manager_okta_id, assigned_at)
            SELECT u.tenant_id, u.okta_id, m.okta_id, now()
            FROM users u
            JOIN users m ON m.tenant_id = u.tenant_id AND m.login = u.manager
            WHERE u.tenant_id = ? AND u.manager IS NOT NULL AND u.okta_id <> m.okta_id
            QUALIFY row_number() OVER (PARTITION BY u.tenant_id, u.okta_id ORDER BY m.okta_id) = 1
            ON CONFLICT (tenant_id, user_okta_id) DO UPDATE SET
                manager_okta_id = excluded.manager_okta_id,
                assigned_at = excluded.assigned_at
            "#,
            params![tenant_id],
        )?;
        info!(linked, "REPORTS_TO edges materialized");
        Ok(linked)
    }

    pub fn entity_counts(&self, tenant_id: &str) -> GraphStoreResult<EntityCounts> {
        let conn = self.conn.lock();
        let count = |table: &str| -> duckdb::Result<u64> {
            conn.query_row(
                &format!("SELECT count(*) FROM {table} WHERE tenant_id = ?"),
                params![tenant_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|c| c as u64)
        };
        Ok(EntityCounts {
            users: count("users")?,
            groups: count("okta_groups")?,
            apps: count("applications")?,
            policies: count("policies")?,
            devices: count("devices")?,
            factors: count("factors")?,
        })
    }

    fn node_exists(&self, conn: &Connection, table: &str, tenant_id: &str, okta_id: &str) -> bool {
        conn.query_row(
            &format!("SELECT count(*) FROM {table} WHERE tenant_id = ? AND okta_id = ?"),
            params![tenant_id, okta_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|c| c > 0)
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use okta_client::models::{AppLinkRecord, FactorRecord};
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
            first_name: Some("Test".into()),
            last_name: Some("User".into()),
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

    #[test]
    fn test_node_upserts_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let writer = GraphWriter::open(dir.path(), &[]).unwrap();

        let groups = vec![group("g1", "Engineering"), group("g2", "Sales")];
        assert_eq!(writer.sync_groups(&groups, "acme"), 2);
        assert_eq!(writer.sync_groups(&groups, "acme"), 2);

        let counts = writer.entity_counts("acme").unwrap();
        assert_eq!(counts.groups, 2);
        assert_eq!(writer.write_errors(), 0);
    }

    #[test]
    fn test_user_bundle_with_edges() {
        let dir = TempDir::new().unwrap();
        let writer = GraphWriter::open(dir.path(), &[]).unwrap();
        writer.sync_groups(&[group("g1", "Engineering")], "acme");

        let mut u = user("u1", "jo@acme.com");
        u.group_memberships = vec!["g1".into()];
        u.factors = vec![FactorRecord {
            okta_id: "f1".into(),
            factor_type: Some("sms".into()),
            provider: Some("OKTA".into()),
            status: Some("ACTIVE".into()),
            device_type: None,
            device_name: None,
            platform: None,
            phone_number: Some("+15550001111".into()),
            email: None,
            created_at: None,
            last_updated_at: None,
        }];
        assert_eq!(writer.sync_users(&[u], "acme"), 1);

        let counts = writer.entity_counts("acme").unwrap();
        assert_eq!(counts.users, 1);
        assert_eq!(counts.factors, 1);

        let conn = writer.conn.lock();
        let members: i64 = conn
            .query_row("SELECT count(*) FROM member_of", [], |r| r.get(0))
            .unwrap();
        assert_eq!(members, 1);
        let enrolled: i64 = conn
            .query_row("SELECT count(*) FROM enrolled", [], |r| r.get(0))
            .unwrap();
        assert_eq!(enrolled, 1);
    }

    #[test]
    fn test_edge_with_missing_endpoint_is_skipped() {
        let dir = TempDir::new().unwrap();
        let writer = GraphWriter::open(dir.path(), &[]).unwrap();

        let mut u = user("u1", "jo@acme.com");
        u.group_memberships = vec!["ghost".into()];
        u.app_links = vec![AppLinkRecord {
            application_okta_id: "missing-app".into(),
            assignment_id: None,
            credentials_setup: false,
            hidden: false,
        }];
        assert_eq!(writer.sync_users(&[u], "acme"), 1);

        let conn = writer.conn.lock();
        let members: i64 = conn
            .query_row("SELECT count(*) FROM member_of", [], |r| r.get(0))
            .unwrap();
        assert_eq!(members, 0);
        let access: i64 = conn
            .query_row("SELECT count(*) FROM has_access", [], |r| r.get(0))
            .unwrap();
        assert_eq!(access, 0);
    }

    #[test]
    fn test_custom_attributes_become_columns() {
        let dir = TempDir::new().unwrap();
        let writer =
            GraphWriter::open(dir.path(), &["SLT_DEPT".to_string(), "cost-center".to_string()])
                .unwrap();

        let mut u = user("u1", "jo@acme.com");
        u.custom_attributes
            .insert("SLT_DEPT".to_string(), "Security".to_string());
        writer.sync_users(&[u], "acme");
        // A user without the attribute gets a null, not an error.
        writer.sync_users(&[user("u2", "sam@acme.com")], "acme");

        let conn = writer.conn.lock();
        let dept: Option<String> = conn
            .query_row(
                "SELECT \"SLT_DEPT\" FROM users WHERE okta_id = 'u1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(dept.as_deref(), Some("Security"));
        let dept: Option<String> = conn
            .query_row(
                "SELECT \"SLT_DEPT\" FROM users WHERE okta_id = 'u2'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(dept.is_none());
    }

    #[test]
    fn test_governed_by_and_reports_to_materialization() {
        let dir = TempDir::new().unwrap();
        let writer = GraphWriter::open(dir.path(), &[]).unwrap();

        let mut manager = user("u1", "boss@acme.com");
        manager.manager = None;
        let mut report = user("u2", "jo@acme.com");
        report.manager = Some("boss@acme.com".into());
        writer.sync_users(&[manager, report], "acme");
        assert_eq!(writer.link_reports_to("acme").unwrap(), 1);

        let app = ApplicationRecord {
            okta_id: "a1".into(),
            name: Some("wiki".into()),
            label: Some("Corp Wiki".into()),
            status: Some("ACTIVE".into()),
            sign_on_mode: None,
            sign_on_url: None,
            audience: None,
            destination: None,
            metadata_url: None,
            policy_id: Some("p1".into()),
            signing_kid: None,
            username_template: None,
            username_template_type: None,
            implicit_assignment: false,
            admin_note: None,
            attribute_statements: vec![],
            honor_force_authn: false,
            hide_ios: false,
            hide_web: false,
            created_at: None,
            last_updated_at: None,
            group_assignments: vec![],
        };
        writer.sync_applications(&[app], "acme");
        writer.sync_policies(
            &[PolicyRecord {
                okta_id: "p1".into(),
                name: Some("Default Access".into()),
                description: None,
                status: Some("ACTIVE".into()),
                policy_type: "ACCESS_POLICY".into(),
                priority: Some(1),
                system: false,
                created_at: None,
                last_updated_at: None,
            }],
            "acme",
        );
        assert_eq!(writer.link_governed_by("acme").unwrap(), 1);

        // Re-linking updates in place instead of duplicating.
        assert_eq!(writer.link_governed_by("acme").unwrap(), 1);
        let conn = writer.conn.lock();
        let governed: i64 = conn
            .query_row("SELECT count(*) FROM governed_by", [], |r| r.get(0))
            .unwrap();
        assert_eq!(governed, 1);
    }

    #[test]
    fn test_last_synced_at_moves_forward() {
        let dir = TempDir::new().unwrap();
        let writer = GraphWriter::open(dir.path(), &[]).unwrap();

        writer.sync_groups(&[group("g1", "Engineering")], "acme");
        let first: String = {
            let conn = writer.conn.lock();
            conn.query_row(
                "SELECT CAST(last_synced_at AS VARCHAR) FROM okta_groups WHERE okta_id = 'g1'",
                [],
                |r| r.get(0),
            )
            .unwrap()
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        writer.sync_groups(&[group("g1", "Engineering")], "acme");
        let second: String = {
            let conn = writer.conn.lock();
            conn.query_row(
                "SELECT CAST(last_synced_at AS VARCHAR) FROM okta_groups WHERE okta_id = 'g1'",
                [],
                |r| r.get(0),
            )
            .unwrap()
        };
        assert!(second >= first);
    }
}
