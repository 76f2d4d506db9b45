//! In-memory store.
//!
//! Reference implementation of the storage traits, used by every engine
//! test and by the test-utils fixtures. Mirrors the PostgreSQL
//! implementation's constraints: unique uuids per model, the virtual
//! warehouse CHECKs, and the dedup rules of `sync_issues`/`sync_errors`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use netventory_core::{
    compute_error_hash, natural_key_of, CheckIn, ConflictLogEntry, ConnectedSite,
    DeletionLogEntry, DuplicateResolutionLogEntry, LocalRecoveryEvent, ModelKind, NaturalKey,
    PullCursor, SchemaReset, SchemaValidationIssue, SiteKey, StoreError, StoredRecord, SyncErrorEntry,
    SyncIssue, SyncLogEntry, Timestamp, SyncOrigin, VIRTUAL_WAREHOUSE_SITE_ID,
};

use crate::changelog::{ChangeLog, ChangeLogEvent};
use crate::schema::{self, LiveColumn, SchemaInspector, FOREIGN_KEYS};
use crate::store::{NewRecord, RecordStore, SiteRegistry};

#[derive(Default)]
struct Inner {
    rows: HashMap<ModelKind, Vec<StoredRecord>>,
    next_id: HashMap<ModelKind, i64>,
    site_keys: HashMap<i64, SiteKey>,
    connected_sites: HashMap<i64, ConnectedSite>,
    sync_logs: Vec<SyncLogEntry>,
    conflict_logs: Vec<ConflictLogEntry>,
    duplicate_logs: Vec<DuplicateResolutionLogEntry>,
    deletion_logs: Vec<DeletionLogEntry>,
    sync_issues: Vec<SyncIssue>,
    sync_errors: Vec<SyncErrorEntry>,
    schema_issues: Vec<SchemaValidationIssue>,
    schema_resets: Vec<SchemaReset>,
    recovery_events: Vec<LocalRecoveryEvent>,
    /// Test override: live columns reported per table instead of the
    /// declared schema.
    live_schema_overrides: HashMap<String, Option<Vec<LiveColumn>>>,
}

/// In-memory implementation of all storage traits.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner.read().map_err(|_| StoreError::Backend {
            reason: "store lock poisoned".into(),
        })
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner.write().map_err(|_| StoreError::Backend {
            reason: "store lock poisoned".into(),
        })
    }

    // ========================================================================
    // TEST ACCESSORS
    // ========================================================================

    /// Seed a row as-is, assigning the next id when `record.id == 0`.
    pub fn seed_record(&self, mut record: StoredRecord) -> StoredRecord {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if record.id == 0 {
            let next = inner.next_id.entry(record.model).or_insert(1);
            record.id = *next;
            *next += 1;
        } else {
            let next = inner.next_id.entry(record.model).or_insert(1);
            *next = (*next).max(record.id + 1);
        }
        inner.rows.entry(record.model).or_default().push(record.clone());
        record
    }

    /// Provision a site key.
    pub fn seed_site_key(&self, key: SiteKey) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner.site_keys.insert(key.site_id, key);
    }

    /// Override what the schema inspector reports for a table. `None`
    /// makes the table look absent.
    pub fn override_live_schema(&self, table: &str, columns: Option<Vec<LiveColumn>>) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        inner
            .live_schema_overrides
            .insert(table.to_string(), columns);
    }

    pub fn row_count(&self, model: ModelKind) -> usize {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.rows.get(&model).map(Vec::len).unwrap_or(0)
    }

    pub fn sync_logs(&self) -> Vec<SyncLogEntry> {
        self.inner.read().expect("store lock poisoned").sync_logs.clone()
    }

    pub fn conflict_logs(&self) -> Vec<ConflictLogEntry> {
        self.inner.read().expect("store lock poisoned").conflict_logs.clone()
    }

    pub fn duplicate_logs(&self) -> Vec<DuplicateResolutionLogEntry> {
        self.inner.read().expect("store lock poisoned").duplicate_logs.clone()
    }

    pub fn deletion_logs(&self) -> Vec<DeletionLogEntry> {
        self.inner.read().expect("store lock poisoned").deletion_logs.clone()
    }

    pub fn sync_issues(&self) -> Vec<SyncIssue> {
        self.inner.read().expect("store lock poisoned").sync_issues.clone()
    }

    pub fn sync_errors(&self) -> Vec<SyncErrorEntry> {
        self.inner.read().expect("store lock poisoned").sync_errors.clone()
    }

    pub fn schema_issues(&self) -> Vec<SchemaValidationIssue> {
        self.inner.read().expect("store lock poisoned").schema_issues.clone()
    }

    pub fn connected_sites(&self) -> Vec<ConnectedSite> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.connected_sites.values().cloned().collect()
    }

    pub fn site_key(&self, site_id: i64) -> Option<SiteKey> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.site_keys.get(&site_id).cloned()
    }

    // ========================================================================
    // CONSTRAINTS
    // ========================================================================

    /// Mirror of the DDL CHECK constraints and unique indexes.
    fn check_constraints(inner: &Inner, record: &StoredRecord) -> Result<(), StoreError> {
        if let Some(other) = inner
            .rows
            .get(&record.model)
            .into_iter()
            .flatten()
            .find(|r| r.uuid == record.uuid && r.id != record.id)
        {
            return Err(StoreError::ConstraintViolation {
                constraint: format!("{}_uuid_key", record.model),
                reason: format!("uuid {} already used by row {}", record.uuid, other.id),
            });
        }

        let site_id = record
            .field("site_id")
            .and_then(Value::as_i64);
        match record.model {
            ModelKind::Locations => {
                if site_id == Some(VIRTUAL_WAREHOUSE_SITE_ID) {
                    return Err(StoreError::ConstraintViolation {
                        constraint: "locations_site_id_check".into(),
                        reason: "locations may not reference the virtual warehouse".into(),
                    });
                }
            }
            ModelKind::Devices => {
                let has_location = record
                    .field("location_id")
                    .map(|v| !v.is_null())
                    .unwrap_or(false);
                if site_id == Some(VIRTUAL_WAREHOUSE_SITE_ID) && has_location {
                    return Err(StoreError::ConstraintViolation {
                        constraint: "devices_warehouse_location_check".into(),
                        reason: "warehouse devices may not have a location".into(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

// ============================================================================
// RECORD STORE
// ============================================================================

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get_by_uuid(
        &self,
        model: ModelKind,
        uuid: Uuid,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .rows
            .get(&model)
            .into_iter()
            .flatten()
            .find(|r| r.uuid == uuid)
            .cloned())
    }

    async fn get_by_id(
        &self,
        model: ModelKind,
        id: i64,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .rows
            .get(&model)
            .into_iter()
            .flatten()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .rows
            .get(&key.model())
            .into_iter()
            .flatten()
            .filter(|r| !r.is_tombstone())
            .find(|r| natural_key_of(r.model, &r.fields).as_ref() == Some(key))
            .cloned())
    }

    async fn insert(&self, record: NewRecord) -> Result<StoredRecord, StoreError> {
        let mut inner = self.write()?;
        let next = inner.next_id.entry(record.model).or_insert(1);
        let id = *next;
        *next += 1;

        let stored = StoredRecord {
            model: record.model,
            id,
            uuid: record.uuid,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
            conflict_data: record.conflict_data,
            sync_state: None,
            fields: record.fields,
        };
        Self::check_constraints(&inner, &stored)?;
        inner.rows.entry(stored.model).or_default().push(stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        Self::check_constraints(&inner, record)?;
        let rows = inner.rows.entry(record.model).or_default();
        match rows.iter_mut().find(|r| r.id == record.id) {
            Some(row) => {
                *row = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                model: record.model,
                id: record.id,
            }),
        }
    }

    async fn set_sync_state(
        &self,
        model: ModelKind,
        id: i64,
        sync_state: Option<Value>,
    ) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let rows = inner.rows.entry(model).or_default();
        match rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.sync_state = sync_state;
                Ok(())
            }
            None => Err(StoreError::NotFound { model, id }),
        }
    }

    async fn soft_delete(
        &self,
        model: ModelKind,
        id: i64,
        deleted_by: Option<i64>,
        origin: SyncOrigin,
        at: Timestamp,
    ) -> Result<StoredRecord, StoreError> {
        let mut inner = self.write()?;
        let rows = inner.rows.entry(model).or_default();
        let updated = match rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.deleted_at = Some(at);
                row.version += 1;
                row.updated_at = at;
                if model == ModelKind::Devices {
                    row.fields.insert("is_deleted".into(), Value::Bool(true));
                    row.fields
                        .insert("deleted_origin".into(), Value::String(origin.as_str().into()));
                    row.fields.insert(
                        "deleted_by_id".into(),
                        deleted_by.map(Value::from).unwrap_or(Value::Null),
                    );
                }
                row.clone()
            }
            None => return Err(StoreError::NotFound { model, id }),
        };
        inner.deletion_logs.push(DeletionLogEntry {
            record_id: id,
            model_name: model,
            deleted_by,
            deleted_at: at,
            origin,
        });
        Ok(updated)
    }

    async fn delete_row(&self, model: ModelKind, id: i64) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let rows = inner.rows.entry(model).or_default();
        let before = rows.len();
        rows.retain(|r| r.id != id);
        if rows.len() == before {
            return Err(StoreError::NotFound { model, id });
        }
        Ok(())
    }

    async fn rewrite_references(
        &self,
        model: ModelKind,
        from_id: i64,
        to_id: i64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let mut rewritten = 0u64;
        for (referencing, column, target) in FOREIGN_KEYS {
            if *target != model {
                continue;
            }
            for row in inner.rows.entry(*referencing).or_default().iter_mut() {
                if row.fields.get(*column).and_then(Value::as_i64) == Some(from_id) {
                    row.fields.insert((*column).to_string(), Value::from(to_id));
                    rewritten += 1;
                }
            }
        }
        Ok(rewritten)
    }

    async fn changed_since(
        &self,
        models: &[ModelKind],
        cursor: &PullCursor,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.read()?;
        let boundary = cursor
            .model
            .zip(cursor.uuid)
            .map(|(model, uuid)| (model.table_name(), uuid));

        let mut matched: Vec<StoredRecord> = models
            .iter()
            .filter_map(|model| inner.rows.get(model))
            .flatten()
            .filter(|row| {
                if row.updated_at > cursor.since {
                    return true;
                }
                // Rows sharing the watermark timestamp resume past the
                // cursor's (model, uuid) position.
                match boundary {
                    Some((model, uuid)) => {
                        row.updated_at == cursor.since
                            && (row.model.table_name(), row.uuid) > (model, uuid)
                    }
                    None => false,
                }
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            (a.updated_at, a.model.table_name(), a.uuid)
                .cmp(&(b.updated_at, b.model.table_name(), b.uuid))
        });
        matched.truncate(limit);
        Ok(matched)
    }
}

// ============================================================================
// SITE REGISTRY
// ============================================================================

#[async_trait]
impl SiteRegistry for InMemoryStore {
    async fn find_site_key(&self, site_id: i64) -> Result<Option<SiteKey>, StoreError> {
        let inner = self.read()?;
        Ok(inner.site_keys.get(&site_id).cloned())
    }

    async fn touch_site_key(&self, site_id: i64, at: Timestamp) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if let Some(key) = inner.site_keys.get_mut(&site_id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn record_check_in(
        &self,
        check_in: &CheckIn,
        at: Timestamp,
    ) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.connected_sites.insert(
            check_in.site_id,
            ConnectedSite {
                site_id: check_in.site_id,
                git_version: check_in.git_version.clone(),
                sync_status: check_in.sync_status.clone(),
                last_update_status: check_in.last_update_status.clone(),
                last_check_in: at,
            },
        );
        Ok(())
    }
}

// ============================================================================
// CHANGE LOG
// ============================================================================

#[async_trait]
impl ChangeLog for InMemoryStore {
    async fn record(&self, event: ChangeLogEvent) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        match event {
            ChangeLogEvent::SyncApplied {
                record_id,
                model,
                action,
                origin,
                target,
                user_id,
                at,
            } => inner.sync_logs.push(SyncLogEntry {
                record_id,
                model_name: model,
                action,
                origin,
                target,
                timestamp: at,
                user_id,
            }),
            ChangeLogEvent::ConflictResolved {
                record_id,
                model,
                local_version,
                cloud_version,
                resolved_version,
                at,
            } => inner.conflict_logs.push(ConflictLogEntry {
                record_id,
                model_name: model,
                local_version,
                cloud_version,
                resolved_version,
                resolution_time: at,
            }),
            ChangeLogEvent::DuplicateCollapsed {
                model,
                kept_id,
                removed_id,
                at,
            } => inner.duplicate_logs.push(DuplicateResolutionLogEntry {
                model_name: model,
                kept_id,
                removed_id,
                timestamp: at,
            }),
            ChangeLogEvent::Deleted {
                record_id,
                model,
                deleted_by,
                origin,
                at,
            } => inner.deletion_logs.push(DeletionLogEntry {
                record_id,
                model_name: model,
                deleted_by,
                deleted_at: at,
                origin,
            }),
            ChangeLogEvent::Issue {
                model,
                field,
                issue_type,
                instance,
                at,
            } => {
                let duplicate = inner.sync_issues.iter().any(|issue| {
                    issue.model_name == model
                        && issue.field_name == field
                        && issue.issue_type == issue_type
                        && issue.instance == instance
                });
                if !duplicate {
                    inner.sync_issues.push(SyncIssue {
                        model_name: model,
                        field_name: field,
                        issue_type,
                        instance,
                        timestamp: at,
                    });
                }
            }
            ChangeLogEvent::Error {
                model,
                action,
                trace,
                at,
            } => {
                let hash = compute_error_hash(&trace);
                if !inner.sync_errors.iter().any(|e| e.error_hash == hash) {
                    inner.sync_errors.push(SyncErrorEntry {
                        model_name: model,
                        action,
                        error_trace: trace,
                        error_hash: hash,
                        timestamp: at,
                    });
                }
            }
            ChangeLogEvent::SchemaIssue {
                table,
                column,
                issue_type,
                expected,
                actual,
                at,
            } => inner.schema_issues.push(SchemaValidationIssue {
                table_name: table,
                column_name: column,
                issue_type,
                expected,
                actual,
                timestamp: at,
            }),
            ChangeLogEvent::SchemaReset { reason, at } => inner.schema_resets.push(SchemaReset {
                reason,
                timestamp: at,
            }),
            ChangeLogEvent::LocalRecovery { description, at } => {
                inner.recovery_events.push(LocalRecoveryEvent {
                    description,
                    timestamp: at,
                })
            }
        }
        Ok(())
    }
}

// ============================================================================
// SCHEMA INSPECTOR
// ============================================================================

#[async_trait]
impl SchemaInspector for InMemoryStore {
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<LiveColumn>>, StoreError> {
        let inner = self.read()?;
        if let Some(overridden) = inner.live_schema_overrides.get(table) {
            return Ok(overridden.clone());
        }
        // Without an override the live schema is exactly the declared one.
        Ok(schema::declared_schema()
            .iter()
            .find(|t| t.name == table)
            .map(|t| {
                t.columns
                    .iter()
                    .map(|c| LiveColumn {
                        name: c.name.to_string(),
                        data_type: c.ty.pg_name().to_string(),
                        nullable: c.nullable,
                    })
                    .collect()
            }))
    }
}
