//! Wire and row representations of sync-managed records.
//!
//! The protocol is generic over model kinds: a record travels as a model
//! tag plus a flattened JSON payload of domain fields. The typed entity
//! structs in [`crate::entities`] are the domain-facing view; the sync
//! engine only ever needs the sync columns plus the opaque payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::enums::ModelKind;
use crate::Timestamp;

/// Domain field map of a record, keyed by column name.
pub type Payload = Map<String, Value>;

/// Column names owned by the sync machinery. These never appear in the
/// domain payload of a record; clients sending them are ignored.
pub const SYNC_COLUMNS: &[&str] = &[
    "model",
    "id",
    "uuid",
    "version",
    "created_at",
    "updated_at",
    "deleted_at",
    "conflict_data",
    "sync_state",
];

// ============================================================================
// INCOMING RECORD (PUSH)
// ============================================================================

/// A record as received by the push endpoint. `uuid` is optional for
/// first-time rows from old clients; `id` is the sender's local id and is
/// only a lookup hint on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SyncRecord {
    pub model: ModelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub uuid: Option<Uuid>,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub created_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub updated_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    /// Domain fields, flattened on the wire.
    #[serde(flatten)]
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub fields: Payload,
}

impl SyncRecord {
    /// Domain payload with any sync-owned columns stripped out.
    pub fn sanitized_fields(&self) -> Payload {
        self.fields
            .iter()
            .filter(|(k, _)| !SYNC_COLUMNS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Whether the incoming record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ============================================================================
// STORED RECORD (ROW)
// ============================================================================

/// A materialized row of a sync-managed table: the mandatory sync columns
/// plus the domain payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct StoredRecord {
    pub model: ModelKind,
    pub id: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub uuid: Uuid,
    pub version: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub deleted_at: Option<Timestamp>,
    /// The losing side of the most recent merge; null when no conflict
    /// is outstanding.
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub conflict_data: Option<Value>,
    /// Per-remote shipping bookkeeping. Never replicated.
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub sync_state: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub fields: Payload,
}

impl StoredRecord {
    /// Whether this row is soft-deleted.
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Look up a domain field by column name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Flatten into the pull wire shape: one JSON object carrying the
    /// model tag, the sync columns (minus `sync_state`, which is
    /// instance-private) and all domain fields.
    pub fn to_wire(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("model".into(), Value::String(self.model.table_name().into()));
        obj.insert("id".into(), Value::from(self.id));
        obj.insert("uuid".into(), Value::String(self.uuid.to_string()));
        obj.insert("version".into(), Value::from(self.version));
        obj.insert(
            "created_at".into(),
            Value::String(self.created_at.to_rfc3339()),
        );
        obj.insert(
            "updated_at".into(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        obj.insert(
            "deleted_at".into(),
            match self.deleted_at {
                Some(at) => Value::String(at.to_rfc3339()),
                None => Value::Null,
            },
        );
        for (k, v) in &self.fields {
            if !SYNC_COLUMNS.contains(&k.as_str()) {
                obj.insert(k.clone(), v.clone());
            }
        }
        Value::Object(obj)
    }
}

// ============================================================================
// PUSH WIRE TYPES
// ============================================================================

/// Body of `POST /api/v1/sync/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PushRequest {
    pub records: Vec<SyncRecord>,
}

/// Result counts for a push batch. A conflict-resolved record counts in
/// both `accepted` and `conflicts` (it was applied); `skipped` covers
/// idempotent repeats and stale echoes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PushOutcome {
    pub accepted: u64,
    pub conflicts: u64,
    pub skipped: u64,
}

impl PushOutcome {
    pub fn record_accepted(&mut self) {
        self.accepted += 1;
    }

    pub fn record_conflict(&mut self) {
        self.accepted += 1;
        self.conflicts += 1;
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }
}

// ============================================================================
// PULL WIRE TYPES
// ============================================================================

/// Resume point for an incremental pull. `since` is the `updated_at`
/// watermark; `model`/`uuid` carry the tie-break position for rows that
/// share the watermark timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PullCursor {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub since: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub uuid: Option<Uuid>,
}

impl PullCursor {
    /// Cursor for a plain `{since: ...}` request with no tie-break state.
    pub fn at(since: Timestamp) -> Self {
        Self {
            since,
            model: None,
            uuid: None,
        }
    }
}

/// Body of `POST /api/v1/sync/pull`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PullRequest {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub since: Timestamp,
    pub models: Vec<ModelKind>,
    /// Tie-break resume state from a previous truncated reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<PullCursor>,
}

/// Shipping metadata attached to a pull reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PullSyncState {
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<PullCursor>,
}

/// Reply of `POST /api/v1/sync/pull`: a flat list of wire records
/// (tombstones included) plus cursor metadata for resuming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PullBatch {
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<Object>))]
    pub records: Vec<Value>,
    pub sync_state: PullSyncState,
}

// ============================================================================
// CHECK-IN
// ============================================================================

/// Body of `POST /api/sync/check-in`: per-site heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CheckIn {
    pub site_id: i64,
    pub git_version: String,
    pub sync_status: String,
    pub last_update_status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_sync_record_flattens_domain_fields() {
        let json = json!({
            "model": "devices",
            "id": 2,
            "version": 1,
            "hostname": "edge-01",
            "mac": "aa:bb:cc:dd:ee:ff",
            "site_id": 3
        });
        let record: SyncRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.model, ModelKind::Devices);
        assert_eq!(record.id, Some(2));
        assert_eq!(record.version, 1);
        assert_eq!(record.fields.get("hostname"), Some(&json!("edge-01")));
        assert!(record.uuid.is_none());
    }

    #[test]
    fn test_sanitized_fields_strips_sync_columns() {
        let json = json!({
            "model": "users",
            "version": 4,
            "email": "a@x",
            "sync_state": {"pushed_version": 3},
            "conflict_data": {"email": "b@x"}
        });
        let record: SyncRecord = serde_json::from_value(json).unwrap();
        let fields = record.sanitized_fields();
        assert!(fields.contains_key("email"));
        assert!(!fields.contains_key("sync_state"));
        assert!(!fields.contains_key("conflict_data"));
    }

    #[test]
    fn test_missing_version_is_a_parse_error() {
        let json = json!({"model": "users", "email": "a@x"});
        assert!(serde_json::from_value::<SyncRecord>(json).is_err());
    }

    #[test]
    fn test_stored_record_wire_shape() {
        let now = Utc::now();
        let mut fields = Payload::new();
        fields.insert("name".into(), json!("lab"));
        let record = StoredRecord {
            model: ModelKind::Sites,
            id: 5,
            uuid: uuid::Uuid::new_v4(),
            version: 2,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            conflict_data: None,
            sync_state: Some(json!({"pushed_version": 2})),
            fields,
        };
        let wire = record.to_wire();
        assert_eq!(wire["model"], json!("sites"));
        assert_eq!(wire["version"], json!(2));
        assert_eq!(wire["name"], json!("lab"));
        assert!(wire["deleted_at"].is_null());
        // sync_state is instance-private and never shipped
        assert!(wire.get("sync_state").is_none());
    }

    #[test]
    fn test_push_outcome_counting() {
        let mut outcome = PushOutcome::default();
        outcome.record_accepted();
        outcome.record_conflict();
        outcome.record_skipped();
        assert_eq!(
            outcome,
            PushOutcome {
                accepted: 2,
                conflicts: 1,
                skipped: 1
            }
        );
    }

    #[test]
    fn test_pull_request_accepts_bare_since() {
        let json = json!({"since": "2026-01-01T00:00:00Z", "models": ["devices", "vlans"]});
        let req: PullRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.models, vec![ModelKind::Devices, ModelKind::Vlans]);
        assert!(req.cursor.is_none());
    }
}
