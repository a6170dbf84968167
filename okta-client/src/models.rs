//! Typed records produced by the entity fetchers.
//!
//! Each record is the transformed shape of one Okta API resource, carrying
//! exactly the fields the graph writer persists. Transforms are tolerant:
//! a resource without an `id` yields `None` (the batch skips it), and any
//! unparseable timestamp becomes `None` rather than an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Parse an Okta timestamp (`2024-01-15T10:30:00.000Z`) into a UTC instant.
pub fn parse_okta_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn bool_field(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn timestamp_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    parse_okta_timestamp(value.get(key).and_then(Value::as_str))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub okta_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    /// `OKTA_GROUP`, `APP_GROUP` or `BUILT_IN`.
    pub group_type: Option<String>,
    /// Provenance of the group: AD, LDAP, OKTA_NATIVE, APP_GROUP, BUILT_IN.
    pub source_type: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl GroupRecord {
    pub fn from_api(raw: &Value) -> Option<Self> {
        let okta_id = str_field(raw, "id")?;
        let profile = raw.get("profile").cloned().unwrap_or(Value::Null);
        let group_type = str_field(raw, "type");

        // Okta reports directory-mastered groups through objectClass;
        // native and built-in groups only through `type`.
        let source_type = match group_type.as_deref() {
            Some("APP_GROUP") => {
                let object_class: Vec<&str> = raw
                    .get("objectClass")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                if object_class.iter().any(|c| c.contains("windows")) {
                    "AD"
                } else if object_class.iter().any(|c| c.contains("ldap")) {
                    "LDAP"
                } else {
                    "APP_GROUP"
                }
            }
            Some("BUILT_IN") => "BUILT_IN",
            _ => "OKTA_NATIVE",
        }
        .to_string();

        Some(Self {
            okta_id,
            name: str_field(&profile, "name"),
            description: str_field(&profile, "description"),
            group_type,
            source_type,
            created_at: timestamp_field(raw, "created"),
            last_updated_at: timestamp_field(raw, "lastUpdated"),
        })
    }
}

/// Group-to-application assignment attached to an [`ApplicationRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppGroupAssignment {
    pub group_okta_id: String,
    pub priority: i64,
}

impl AppGroupAssignment {
    pub fn from_api(raw: &Value) -> Option<Self> {
        Some(Self {
            group_okta_id: str_field(raw, "id")?,
            priority: raw.get("priority").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub okta_id: String,
    pub name: Option<String>,
    pub label: Option<String>,
    pub status: Option<String>,
    pub sign_on_mode: Option<String>,
    pub sign_on_url: Option<String>,
    pub audience: Option<String>,
    pub destination: Option<String>,
    pub metadata_url: Option<String>,
    /// Okta id of the access policy governing this app, from
    /// `_links.accessPolicy`.
    pub policy_id: Option<String>,
    pub signing_kid: Option<String>,
    pub username_template: Option<String>,
    pub username_template_type: Option<String>,
    pub implicit_assignment: bool,
    pub admin_note: Option<String>,
    /// SAML attribute statements, JSON-encoded, in declaration order.
    pub attribute_statements: Vec<String>,
    pub honor_force_authn: bool,
    pub hide_ios: bool,
    pub hide_web: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub group_assignments: Vec<AppGroupAssignment>,
}

impl ApplicationRecord {
    pub fn from_api(raw: &Value) -> Option<Self> {
        let okta_id = str_field(raw, "id")?;
        let sign_on = raw.pointer("/settings/signOn").cloned().unwrap_or(Value::Null);
        let visibility_hide = raw.pointer("/visibility/hide").cloned().unwrap_or(Value::Null);

        let policy_id = raw
            .pointer("/_links/accessPolicy/href")
            .and_then(Value::as_str)
            .and_then(|href| href.rsplit('/').next())
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let attribute_statements = sign_on
            .get("attributeStatements")
            .and_then(Value::as_array)
            .map(|stmts| stmts.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        Some(Self {
            okta_id,
            name: str_field(raw, "name"),
            label: str_field(raw, "label"),
            status: str_field(raw, "status"),
            sign_on_mode: str_field(raw, "signOnMode"),
            sign_on_url: str_field(&sign_on, "ssoAcsUrl"),
            audience: str_field(&sign_on, "audience"),
            destination: str_field(&sign_on, "destination"),
            metadata_url: raw
                .pointer("/_links/metadata/href")
                .and_then(Value::as_str)
                .map(str::to_string),
            policy_id,
            signing_kid: raw
                .pointer("/credentials/signing/kid")
                .and_then(Value::as_str)
                .map(str::to_string),
            username_template: raw
                .pointer("/credentials/userNameTemplate/template")
                .and_then(Value::as_str)
                .map(str::to_string),
            username_template_type: raw
                .pointer("/credentials/userNameTemplate/type")
                .and_then(Value::as_str)
                .map(str::to_string),
            implicit_assignment: raw
                .pointer("/settings/implicitAssignment")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            admin_note: raw
                .pointer("/settings/notes/admin")
                .and_then(Value::as_str)
                .map(str::to_string),
            attribute_statements,
            honor_force_authn: bool_field(&sign_on, "honorForceAuthn"),
            hide_ios: bool_field(&visibility_hide, "ios"),
            hide_web: bool_field(&visibility_hide, "web"),
            created_at: timestamp_field(raw, "created"),
            last_updated_at: timestamp_field(raw, "lastUpdated"),
            group_assignments: Vec::new(),
        })
    }
}

/// Direct user-to-application assignment from `/users/{id}/appLinks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppLinkRecord {
    pub application_okta_id: String,
    pub assignment_id: Option<String>,
    pub credentials_setup: bool,
    pub hidden: bool,
}

impl AppLinkRecord {
    pub fn from_api(raw: &Value) -> Option<Self> {
        Some(Self {
            application_okta_id: str_field(raw, "appInstanceId")?,
            assignment_id: str_field(raw, "appAssignmentId"),
            credentials_setup: bool_field(raw, "credentialsSetup"),
            hidden: bool_field(raw, "hidden"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorRecord {
    pub okta_id: String,
    pub factor_type: Option<String>,
    pub provider: Option<String>,
    pub status: Option<String>,
    pub device_type: Option<String>,
    pub device_name: Option<String>,
    pub platform: Option<String>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl FactorRecord {
    pub fn from_api(raw: &Value) -> Option<Self> {
        let okta_id = str_field(raw, "id")?;
        let factor_type = str_field(raw, "factorType");
        let profile = raw.get("profile").cloned().unwrap_or(Value::Null);

        let mut record = Self {
            okta_id,
            factor_type: factor_type.clone(),
            provider: str_field(raw, "provider"),
            status: str_field(raw, "status"),
            device_type: None,
            device_name: None,
            platform: None,
            phone_number: None,
            email: None,
            created_at: timestamp_field(raw, "created"),
            last_updated_at: timestamp_field(raw, "lastUpdated"),
        };

        match factor_type.as_deref() {
            Some("email") => record.email = str_field(&profile, "email"),
            Some("sms") | Some("call") => {
                record.phone_number = str_field(&profile, "phoneNumber");
            }
            Some("push") | Some("signed_nonce") => {
                record.device_type = str_field(&profile, "deviceType");
                record.device_name = str_field(&profile, "name");
                record.platform = str_field(&profile, "platform");
            }
            _ => {}
        }

        Some(record)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub okta_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub login: Option<String>,
    pub status: Option<String>,
    pub mobile_phone: Option<String>,
    pub primary_phone: Option<String>,
    pub employee_number: Option<String>,
    pub department: Option<String>,
    /// Login of this user's manager, used to derive the reporting edge.
    pub manager: Option<String>,
    pub user_type: Option<String>,
    pub country_code: Option<String>,
    pub title: Option<String>,
    pub organization: Option<String>,
    /// Tenant-configured profile fields, keyed by raw attribute name.
    /// Blank values are dropped at extraction time.
    pub custom_attributes: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub group_memberships: Vec<String>,
    pub app_links: Vec<AppLinkRecord>,
    pub factors: Vec<FactorRecord>,
}

impl UserRecord {
    pub fn from_api(raw: &Value, custom_attribute_names: &[String]) -> Option<Self> {
        let okta_id = str_field(raw, "id")?;
        let profile = raw.get("profile").cloned().unwrap_or(Value::Null);

        let mut custom_attributes = BTreeMap::new();
        for name in custom_attribute_names {
            let Some(value) = profile.get(name) else {
                continue;
            };
            let rendered = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            if !rendered.is_empty() {
                custom_attributes.insert(name.clone(), rendered);
            }
        }

        Some(Self {
            okta_id,
            email: str_field(&profile, "email"),
            first_name: str_field(&profile, "firstName"),
            last_name: str_field(&profile, "lastName"),
            login: str_field(&profile, "login"),
            status: str_field(raw, "status"),
            mobile_phone: str_field(&profile, "mobilePhone"),
            primary_phone: str_field(&profile, "primaryPhone"),
            employee_number: str_field(&profile, "employeeNumber"),
            department: str_field(&profile, "department"),
            manager: str_field(&profile, "manager"),
            user_type: str_field(&profile, "userType"),
            country_code: str_field(&profile, "countryCode"),
            title: str_field(&profile, "title"),
            organization: str_field(&profile, "organization"),
            custom_attributes,
            created_at: timestamp_field(raw, "created"),
            last_updated_at: timestamp_field(raw, "lastUpdated"),
            password_changed_at: timestamp_field(raw, "passwordChanged"),
            status_changed_at: timestamp_field(raw, "statusChanged"),
            group_memberships: Vec::new(),
            app_links: Vec::new(),
            factors: Vec::new(),
        })
    }

    pub fn is_deprovisioned(&self) -> bool {
        self.status.as_deref() == Some("DEPROVISIONED")
    }

    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (None, None) => self
                .email
                .clone()
                .or_else(|| self.login.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            (first, last) => format!(
                "{} {}",
                first.as_deref().unwrap_or(""),
                last.as_deref().unwrap_or("")
            )
            .trim()
            .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub okta_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    /// OKTA_SIGN_ON, PASSWORD, MFA_ENROLL, ACCESS_POLICY, ...
    pub policy_type: String,
    pub priority: Option<i64>,
    pub system: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl PolicyRecord {
    pub fn from_api(raw: &Value, policy_type: &str) -> Option<Self> {
        let okta_id = str_field(raw, "id")?;
        let name = str_field(raw, "name")?;
        Some(Self {
            okta_id,
            name: Some(name),
            description: str_field(raw, "description"),
            status: str_field(raw, "status"),
            policy_type: policy_type.to_string(),
            priority: raw.get("priority").and_then(Value::as_i64),
            system: bool_field(raw, "system"),
            created_at: timestamp_field(raw, "created"),
            last_updated_at: timestamp_field(raw, "lastUpdated"),
        })
    }
}

/// Owner relationship embedded in a device's `_embedded.users`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOwner {
    pub user_okta_id: String,
    pub management_status: Option<String>,
    pub screen_lock_type: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub okta_id: String,
    pub status: Option<String>,
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub os_version: Option<String>,
    pub serial_number: Option<String>,
    pub udid: Option<String>,
    pub registered: bool,
    pub secure_hardware_present: bool,
    pub disk_encryption_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub owners: Vec<DeviceOwner>,
}

impl DeviceRecord {
    pub fn from_api(raw: &Value) -> Option<Self> {
        let okta_id = str_field(raw, "id")?;
        let profile = raw.get("profile").cloned().unwrap_or(Value::Null);

        let owners = raw
            .pointer("/_embedded/users")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let user_okta_id = entry
                            .pointer("/user/id")
                            .and_then(Value::as_str)?
                            .to_string();
                        Some(DeviceOwner {
                            user_okta_id,
                            management_status: str_field(entry, "managementStatus"),
                            screen_lock_type: str_field(entry, "screenLockType"),
                            assigned_at: timestamp_field(entry, "created"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            okta_id,
            status: str_field(raw, "status"),
            display_name: str_field(&profile, "displayName"),
            platform: str_field(&profile, "platform"),
            manufacturer: str_field(&profile, "manufacturer"),
            model: str_field(&profile, "model"),
            os_version: str_field(&profile, "osVersion"),
            serial_number: str_field(&profile, "serialNumber"),
            udid: str_field(&profile, "udid"),
            registered: bool_field(&profile, "registered"),
            secure_hardware_present: bool_field(&profile, "secureHardwarePresent"),
            disk_encryption_type: str_field(&profile, "diskEncryptionType"),
            created_at: timestamp_field(raw, "created"),
            last_updated_at: timestamp_field(raw, "lastUpdated"),
            owners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_parse_round_trip() {
        let parsed = parse_okta_timestamp(Some("2024-01-15T10:30:00.000Z")).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-01-15T10:30:00+00:00");

        // Offset form normalizes to the same UTC instant.
        let offset = parse_okta_timestamp(Some("2024-01-15T12:30:00.000+02:00")).unwrap();
        assert_eq!(offset, parsed);
    }

    #[test]
    fn test_timestamp_parse_failure_is_none() {
        assert!(parse_okta_timestamp(None).is_none());
        assert!(parse_okta_timestamp(Some("")).is_none());
        assert!(parse_okta_timestamp(Some("not-a-date")).is_none());
    }

    #[test]
    fn test_user_from_api_extracts_custom_attributes() {
        let raw = json!({
            "id": "u1",
            "status": "ACTIVE",
            "created": "2024-01-01T00:00:00.000Z",
            "profile": {
                "email": "jo@acme.com",
                "firstName": "Jo",
                "lastName": "Doe",
                "login": "jo@acme.com",
                "SLT_DEPT": "Security",
                "costCenter": "  ",
                "badgeId": 4711
            }
        });
        let attrs = vec![
            "SLT_DEPT".to_string(),
            "costCenter".to_string(),
            "badgeId".to_string(),
            "missing".to_string(),
        ];
        let user = UserRecord::from_api(&raw, &attrs).unwrap();
        assert_eq!(user.custom_attributes.get("SLT_DEPT").unwrap(), "Security");
        // Whitespace-only values are dropped, absent ones never appear.
        assert!(!user.custom_attributes.contains_key("costCenter"));
        assert!(!user.custom_attributes.contains_key("missing"));
        assert_eq!(user.custom_attributes.get("badgeId").unwrap(), "4711");
        assert_eq!(user.display_name(), "Jo Doe");
    }

    #[test]
    fn test_user_without_id_is_skipped() {
        assert!(UserRecord::from_api(&json!({"profile": {}}), &[]).is_none());
    }

    #[test]
    fn test_application_policy_reference() {
        let raw = json!({
            "id": "a1",
            "label": "Corp Wiki",
            "signOnMode": "SAML_2_0",
            "settings": {"signOn": {
                "attributeStatements": [
                    {"name": "email", "values": ["user.email"]},
                    {"name": "dept", "values": ["user.department"]}
                ]
            }},
            "_links": {"accessPolicy": {"href": "https://acme.okta.com/api/v1/policies/p42"}}
        });
        let app = ApplicationRecord::from_api(&raw).unwrap();
        assert_eq!(app.policy_id.as_deref(), Some("p42"));
        assert_eq!(app.attribute_statements.len(), 2);
        assert!(app.attribute_statements[0].contains("email"));
    }

    #[test]
    fn test_group_source_type() {
        let native = json!({"id": "g1", "type": "OKTA_GROUP", "profile": {"name": "Everyone"}});
        assert_eq!(GroupRecord::from_api(&native).unwrap().source_type, "OKTA_NATIVE");

        let ad = json!({
            "id": "g2",
            "type": "APP_GROUP",
            "objectClass": ["okta:windows_security_principal"],
            "profile": {"name": "Domain Users"}
        });
        assert_eq!(GroupRecord::from_api(&ad).unwrap().source_type, "AD");

        let built_in = json!({"id": "g3", "type": "BUILT_IN", "profile": {"name": "Everyone"}});
        assert_eq!(GroupRecord::from_api(&built_in).unwrap().source_type, "BUILT_IN");
    }

    #[test]
    fn test_device_embedded_owners() {
        let raw = json!({
            "id": "d1",
            "status": "ACTIVE",
            "profile": {"displayName": "MacBook", "platform": "MACOS"},
            "_embedded": {"users": [
                {
                    "managementStatus": "MANAGED",
                    "screenLockType": "BIOMETRIC",
                    "created": "2024-02-01T00:00:00.000Z",
                    "user": {"id": "u1"}
                },
                {"user": {}}
            ]}
        });
        let device = DeviceRecord::from_api(&raw).unwrap();
        assert_eq!(device.owners.len(), 1);
        assert_eq!(device.owners[0].user_okta_id, "u1");
        assert_eq!(device.owners[0].management_status.as_deref(), Some("MANAGED"));
    }

    #[test]
    fn test_factor_profile_by_modality() {
        let sms = json!({
            "id": "f1", "factorType": "sms", "provider": "OKTA", "status": "ACTIVE",
            "profile": {"phoneNumber": "+15551234567"}
        });
        let record = FactorRecord::from_api(&sms).unwrap();
        assert_eq!(record.phone_number.as_deref(), Some("+15551234567"));

        let push = json!({
            "id": "f2", "factorType": "push", "provider": "OKTA", "status": "ACTIVE",
            "profile": {"deviceType": "SmartPhone_IPhone", "name": "iPhone", "platform": "IOS"}
        });
        let record = FactorRecord::from_api(&push).unwrap();
        assert_eq!(record.platform.as_deref(), Some("IOS"));
        assert!(record.phone_number.is_none());
    }
}
