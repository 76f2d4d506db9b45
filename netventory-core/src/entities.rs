//! Typed entity structures.
//!
//! Domain-facing views of the nine sync-managed model kinds, plus the
//! rows of the sync infrastructure tables. The replication engine itself
//! operates on [`crate::record::StoredRecord`]; these structs are what
//! the rest of the application reads and writes, and they drive the
//! declared schema used by the self-check.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::enums::{ModelKind, SchemaIssueType, SyncAction, SyncOrigin, SyncPeer};
use crate::Timestamp;

// ============================================================================
// SYNC-MANAGED ENTITIES
// ============================================================================

/// An application user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct User {
    pub id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub uuid: Uuid,
    pub version: i64,
    pub email: String,
    pub name: Option<String>,
    pub role: Option<String>,
    pub is_active: bool,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub conflict_data: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub sync_state: Option<Value>,
}

/// A managed network device. Devices with no real site default to the
/// virtual warehouse (site 100); warehouse devices carry no location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Device {
    pub id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub uuid: Uuid,
    pub version: i64,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub manufacturer: Option<String>,
    pub device_type_id: Option<i64>,
    pub site_id: i64,
    pub location_id: Option<i64>,
    pub is_deleted: bool,
    pub deleted_by_id: Option<i64>,
    pub deleted_origin: Option<SyncOrigin>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub conflict_data: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub sync_state: Option<Value>,
}

/// A VLAN definition scoped to a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Vlan {
    pub id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub uuid: Uuid,
    pub version: i64,
    pub vlan_id: i64,
    pub name: Option<String>,
    pub site_id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub conflict_data: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub sync_state: Option<Value>,
}

/// SSH credentials used by config pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SshCredential {
    pub id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub uuid: Uuid,
    pub version: i64,
    pub username: String,
    pub host: String,
    pub secret: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub conflict_data: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub sync_state: Option<Value>,
}

/// SNMP community strings, scoped either to a host or to a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SnmpCommunity {
    pub id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub uuid: Uuid,
    pub version: i64,
    pub community: String,
    pub snmp_version: String,
    pub host: Option<String>,
    pub site_id: Option<i64>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub conflict_data: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub sync_state: Option<Value>,
}

/// A physical location within a site. Never references the virtual
/// warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Location {
    pub id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub uuid: Uuid,
    pub version: i64,
    pub name: String,
    pub site_id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub conflict_data: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub sync_state: Option<Value>,
}

/// Device type catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DeviceType {
    pub id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub uuid: Uuid,
    pub version: i64,
    pub name: String,
    pub manufacturer: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub conflict_data: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub sync_state: Option<Value>,
}

/// A deployment site. Id 100 is the reserved virtual warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Site {
    pub id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub uuid: Uuid,
    pub version: i64,
    pub name: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub conflict_data: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub sync_state: Option<Value>,
}

/// Free-form tag applied to devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Tag {
    pub id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub uuid: Uuid,
    pub version: i64,
    pub name: String,
    pub color: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub conflict_data: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub sync_state: Option<Value>,
}

// ============================================================================
// SITE KEYS AND LIVENESS
// ============================================================================

/// One provisioned site key. Authenticates sync traffic for a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteKey {
    pub site_id: i64,
    pub site_name: String,
    pub api_key: String,
    pub active: bool,
    pub created_at: Timestamp,
    pub last_used_at: Option<Timestamp>,
}

/// A personal API key for an end user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserApiKey {
    pub id: Uuid,
    pub user_id: i64,
    pub key: String,
    pub status: String,
    pub created_at: Timestamp,
    pub last_used_at: Option<Timestamp>,
}

/// Liveness row for a site, upserted by check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedSite {
    pub site_id: i64,
    pub git_version: String,
    pub sync_status: String,
    pub last_update_status: String,
    pub last_check_in: Timestamp,
}

// ============================================================================
// SYNC BOOKKEEPING ROWS (append-only)
// ============================================================================

/// One shipped mutation, recorded on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub record_id: i64,
    pub model_name: ModelKind,
    pub action: SyncAction,
    pub origin: SyncPeer,
    pub target: SyncPeer,
    pub timestamp: Timestamp,
    pub user_id: Option<i64>,
}

/// A resolved merge conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictLogEntry {
    pub record_id: i64,
    pub model_name: ModelKind,
    pub local_version: i64,
    pub cloud_version: i64,
    pub resolved_version: i64,
    pub resolution_time: Timestamp,
}

/// A natural-key duplicate collapsed into its surviving row. `removed_id`
/// is null when the losing record was never stored on this side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateResolutionLogEntry {
    pub model_name: ModelKind,
    pub kept_id: i64,
    pub removed_id: Option<i64>,
    pub timestamp: Timestamp,
}

/// A soft deletion with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionLogEntry {
    pub record_id: i64,
    pub model_name: ModelKind,
    pub deleted_by: Option<i64>,
    pub deleted_at: Timestamp,
    pub origin: SyncOrigin,
}

/// A per-field data issue observed during sync. Deduplicated on
/// `(model, field, issue_type, instance)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub model_name: ModelKind,
    pub field_name: String,
    pub issue_type: String,
    pub instance: String,
    pub timestamp: Timestamp,
}

/// A server-side sync failure. Deduplicated on `error_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub model_name: Option<ModelKind>,
    pub action: String,
    pub error_trace: String,
    pub error_hash: String,
    pub timestamp: Timestamp,
}

// ============================================================================
// SCHEMA FORENSICS ROWS (append-only)
// ============================================================================

/// A divergence between the declared schema and the live database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaValidationIssue {
    pub table_name: String,
    pub column_name: Option<String>,
    pub issue_type: SchemaIssueType,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub timestamp: Timestamp,
}

/// A record of automated schema recovery having run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaReset {
    pub reason: String,
    pub timestamp: Timestamp,
}

/// A local-instance recovery event (crash restart, cursor rebuild, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecoveryEvent {
    pub description: String,
    pub timestamp: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_device_serialization_includes_soft_delete_fields() {
        let device = Device {
            id: 1,
            uuid: Uuid::new_v4(),
            version: 1,
            hostname: Some("core-sw-01".into()),
            ip: Some("10.0.0.1".into()),
            mac: Some("aa:bb:cc:00:11:22".into()),
            manufacturer: Some("cisco".into()),
            device_type_id: Some(1),
            site_id: crate::VIRTUAL_WAREHOUSE_SITE_ID,
            location_id: None,
            is_deleted: false,
            deleted_by_id: None,
            deleted_origin: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
            conflict_data: None,
            sync_state: None,
        };

        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["is_deleted"], serde_json::json!(false));
        assert_eq!(json["site_id"], serde_json::json!(100));
        assert!(json["deleted_origin"].is_null());
    }

    #[test]
    fn test_sync_log_entry_roundtrip() -> Result<(), serde_json::Error> {
        let entry = SyncLogEntry {
            record_id: 42,
            model_name: ModelKind::Vlans,
            action: SyncAction::Update,
            origin: SyncPeer::Site,
            target: SyncPeer::Cloud,
            timestamp: Utc::now(),
            user_id: None,
        };
        let json = serde_json::to_string(&entry)?;
        let back: SyncLogEntry = serde_json::from_str(&json)?;
        assert_eq!(back, entry);
        Ok(())
    }
}
