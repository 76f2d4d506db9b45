//! Transaction-scoped PostgreSQL store.
//!
//! Implements the netventory-sync storage traits over one open
//! transaction, so a whole push or pull runs all-or-nothing on one
//! connection. Lookups that precede writes take `FOR UPDATE` row locks;
//! the cloud serializes concurrent pushes per row this way.
//!
//! Rows travel as `to_jsonb(t)` documents and come back through
//! `jsonb_populate_record`, which keeps one generic code path for all
//! nine model tables; the declared schema provides the column lists, so
//! no SQL fragment is ever built from request data.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Row, Transaction};
use uuid::Uuid;

use netventory_core::{
    compute_error_hash, CheckIn, ModelKind, NaturalKey, PullCursor, SiteKey, StoreError,
    StoredRecord, SyncOrigin, Timestamp, SYNC_COLUMNS,
};
use netventory_sync::{
    table_spec, ChangeLog, ChangeLogEvent, LiveColumn, NewRecord, RecordStore, SchemaInspector,
    SiteRegistry, FOREIGN_KEYS,
};

use crate::db::store_error_from_pg;

/// Sync columns selected (in this order) ahead of the `to_jsonb` doc.
pub(crate) const RECORD_SELECT_COLUMNS: &str =
    "t.id, t.uuid, t.version, t.created_at, t.updated_at, t.deleted_at, t.conflict_data, t.sync_state";

/// Build a `StoredRecord` from a row shaped `RECORD_SELECT_COLUMNS, doc`.
pub(crate) fn record_from_row(model: ModelKind, row: &Row) -> Result<StoredRecord, StoreError> {
    let doc: Value = row.try_get(8).map_err(store_error_from_pg)?;
    let fields: Map<String, Value> = doc
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter(|(k, _)| !SYNC_COLUMNS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    Ok(StoredRecord {
        model,
        id: row.try_get(0).map_err(store_error_from_pg)?,
        uuid: row.try_get(1).map_err(store_error_from_pg)?,
        version: row.try_get(2).map_err(store_error_from_pg)?,
        created_at: row.try_get(3).map_err(store_error_from_pg)?,
        updated_at: row.try_get(4).map_err(store_error_from_pg)?,
        deleted_at: row.try_get(5).map_err(store_error_from_pg)?,
        conflict_data: row.try_get(6).map_err(store_error_from_pg)?,
        sync_state: row.try_get(7).map_err(store_error_from_pg)?,
        fields,
    })
}

/// Full-row JSON document for `jsonb_populate_record`. Only declared
/// domain columns are copied from the field map; anything else a client
/// smuggled in is dropped here.
fn row_doc(
    model: ModelKind,
    id: i64,
    uuid: Uuid,
    version: i64,
    created_at: Timestamp,
    updated_at: Timestamp,
    deleted_at: Option<Timestamp>,
    conflict_data: &Option<Value>,
    sync_state: &Option<Value>,
    fields: &Map<String, Value>,
) -> Value {
    let mut doc = Map::new();
    doc.insert("id".into(), Value::from(id));
    doc.insert("uuid".into(), Value::String(uuid.to_string()));
    doc.insert("version".into(), Value::from(version));
    doc.insert("created_at".into(), Value::String(created_at.to_rfc3339()));
    doc.insert("updated_at".into(), Value::String(updated_at.to_rfc3339()));
    doc.insert(
        "deleted_at".into(),
        deleted_at
            .map(|at| Value::String(at.to_rfc3339()))
            .unwrap_or(Value::Null),
    );
    doc.insert(
        "conflict_data".into(),
        conflict_data.clone().unwrap_or(Value::Null),
    );
    doc.insert(
        "sync_state".into(),
        sync_state.clone().unwrap_or(Value::Null),
    );
    for column in table_spec(model).columns {
        if SYNC_COLUMNS.contains(&column.name) {
            continue;
        }
        if let Some(value) = fields.get(column.name) {
            doc.insert(column.name.to_string(), value.clone());
        }
    }
    Value::Object(doc)
}

/// Declared domain columns of a model (everything but the sync columns).
fn domain_columns(model: ModelKind) -> impl Iterator<Item = &'static str> {
    table_spec(model)
        .columns
        .iter()
        .map(|c| c.name)
        .filter(|name| !SYNC_COLUMNS.contains(name))
}

/// One transaction's view of the record store.
pub struct PgStore<'a> {
    tx: &'a Transaction<'a>,
}

impl<'a> PgStore<'a> {
    pub fn new(tx: &'a Transaction<'a>) -> Self {
        Self { tx }
    }

    async fn fetch_one_locked(
        &self,
        model: ModelKind,
        predicate: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<StoredRecord>, StoreError> {
        let sql = format!(
            "SELECT {columns}, to_jsonb(t) AS doc FROM {table} t WHERE {predicate} \
             ORDER BY t.id LIMIT 1 FOR UPDATE",
            columns = RECORD_SELECT_COLUMNS,
            table = model.table_name(),
            predicate = predicate,
        );
        let row = self
            .tx
            .query_opt(sql.as_str(), params)
            .await
            .map_err(store_error_from_pg)?;
        row.map(|row| record_from_row(model, &row)).transpose()
    }
}

// ============================================================================
// RECORD STORE
// ============================================================================

#[async_trait]
impl RecordStore for PgStore<'_> {
    async fn get_by_uuid(
        &self,
        model: ModelKind,
        uuid: Uuid,
    ) -> Result<Option<StoredRecord>, StoreError> {
        self.fetch_one_locked(model, "t.uuid = $1", &[&uuid]).await
    }

    async fn get_by_id(
        &self,
        model: ModelKind,
        id: i64,
    ) -> Result<Option<StoredRecord>, StoreError> {
        self.fetch_one_locked(model, "t.id = $1", &[&id]).await
    }

    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<StoredRecord>, StoreError> {
        // Live rows only; tombstones never block a natural key. Device
        // keys respect the first-non-empty precedence: a row keyed by
        // its mac never matches a hostname or ip lookup.
        const LIVE: &str = "t.deleted_at IS NULL";
        match key {
            NaturalKey::UserEmail { email } => {
                let predicate = format!("lower(t.email) = $1 AND {}", LIVE);
                self.fetch_one_locked(ModelKind::Users, &predicate, &[email])
                    .await
            }
            NaturalKey::DeviceMac { mac } => {
                let predicate = format!("lower(t.mac) = $1 AND {}", LIVE);
                self.fetch_one_locked(ModelKind::Devices, &predicate, &[mac])
                    .await
            }
            NaturalKey::DeviceHostname { hostname, site_id } => {
                let predicate = format!(
                    "(t.mac IS NULL OR btrim(t.mac) = '') AND lower(t.hostname) = $1 \
                     AND t.site_id = $2 AND {}",
                    LIVE
                );
                self.fetch_one_locked(ModelKind::Devices, &predicate, &[hostname, site_id])
                    .await
            }
            NaturalKey::DeviceIp { ip, site_id } => {
                let predicate = format!(
                    "(t.mac IS NULL OR btrim(t.mac) = '') \
                     AND (t.hostname IS NULL OR btrim(t.hostname) = '') \
                     AND btrim(t.ip) = $1 AND t.site_id = $2 AND {}",
                    LIVE
                );
                self.fetch_one_locked(ModelKind::Devices, &predicate, &[ip, site_id])
                    .await
            }
            NaturalKey::Vlan { vlan_id, site_id } => {
                let predicate = format!("t.vlan_id = $1 AND t.site_id = $2 AND {}", LIVE);
                self.fetch_one_locked(ModelKind::Vlans, &predicate, &[vlan_id, site_id])
                    .await
            }
            NaturalKey::SshCredential { username, host } => {
                let predicate =
                    format!("btrim(t.username) = $1 AND btrim(t.host) = $2 AND {}", LIVE);
                self.fetch_one_locked(ModelKind::SshCredentials, &predicate, &[username, host])
                    .await
            }
            NaturalKey::SnmpCommunity {
                community,
                snmp_version,
                scope,
            } => {
                let predicate = format!(
                    "btrim(t.community) = $1 AND btrim(t.snmp_version) = $2 \
                     AND COALESCE(NULLIF(btrim(t.host), ''), 'site:' || t.site_id::text) = $3 \
                     AND {}",
                    LIVE
                );
                self.fetch_one_locked(
                    ModelKind::SnmpCommunities,
                    &predicate,
                    &[community, snmp_version, scope],
                )
                .await
            }
            NaturalKey::LocationName { name, site_id } => {
                let predicate = format!("btrim(t.name) = $1 AND t.site_id = $2 AND {}", LIVE);
                self.fetch_one_locked(ModelKind::Locations, &predicate, &[name, site_id])
                    .await
            }
            NaturalKey::DeviceTypeName { name } => {
                let predicate = format!("btrim(t.name) = $1 AND {}", LIVE);
                self.fetch_one_locked(ModelKind::DeviceTypes, &predicate, &[name])
                    .await
            }
            NaturalKey::SiteName { name } => {
                let predicate = format!("btrim(t.name) = $1 AND {}", LIVE);
                self.fetch_one_locked(ModelKind::Sites, &predicate, &[name]).await
            }
            NaturalKey::TagName { name } => {
                let predicate = format!("btrim(t.name) = $1 AND {}", LIVE);
                self.fetch_one_locked(ModelKind::Tags, &predicate, &[name]).await
            }
        }
    }

    async fn insert(&self, record: NewRecord) -> Result<StoredRecord, StoreError> {
        let table = record.model.table_name();

        let id: i64 = self
            .tx
            .query_one("SELECT nextval(pg_get_serial_sequence($1, 'id'))", &[&table])
            .await
            .map_err(store_error_from_pg)?
            .try_get(0)
            .map_err(store_error_from_pg)?;

        let doc = row_doc(
            record.model,
            id,
            record.uuid,
            record.version,
            record.created_at,
            record.updated_at,
            record.deleted_at,
            &record.conflict_data,
            &None,
            &record.fields,
        );

        // Only columns present in the doc are listed, so absent domain
        // fields pick up their table defaults instead of NULL.
        let provided: Vec<&str> = table_spec(record.model)
            .columns
            .iter()
            .map(|c| c.name)
            .filter(|name| doc.get(*name).is_some())
            .collect();
        let targets = provided.join(", ");
        let sources = provided
            .iter()
            .map(|name| format!("r.{}", name))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "INSERT INTO {table} ({targets}) \
             SELECT {sources} FROM jsonb_populate_record(NULL::{table}, $1::jsonb) r",
            table = table,
            targets = targets,
            sources = sources,
        );
        self.tx
            .execute(sql.as_str(), &[&doc])
            .await
            .map_err(store_error_from_pg)?;

        self.get_by_id(record.model, id)
            .await?
            .ok_or(StoreError::NotFound {
                model: record.model,
                id,
            })
    }

    async fn update(&self, record: &StoredRecord) -> Result<(), StoreError> {
        let table = record.model.table_name();
        let doc = row_doc(
            record.model,
            record.id,
            record.uuid,
            record.version,
            record.created_at,
            record.updated_at,
            record.deleted_at,
            &record.conflict_data,
            &record.sync_state,
            &record.fields,
        );

        let mut columns: Vec<&str> = vec![
            "version",
            "created_at",
            "updated_at",
            "deleted_at",
            "conflict_data",
            "sync_state",
        ];
        columns.extend(domain_columns(record.model));
        let targets = columns.join(", ");
        let sources = columns
            .iter()
            .map(|name| format!("r.{}", name))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "UPDATE {table} AS t SET ({targets}) = \
             (SELECT {sources} FROM jsonb_populate_record(NULL::{table}, $2::jsonb) r) \
             WHERE t.id = $1",
            table = table,
            targets = targets,
            sources = sources,
        );
        let updated = self
            .tx
            .execute(sql.as_str(), &[&record.id, &doc])
            .await
            .map_err(store_error_from_pg)?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                model: record.model,
                id: record.id,
            });
        }
        Ok(())
    }

    async fn set_sync_state(
        &self,
        model: ModelKind,
        id: i64,
        sync_state: Option<Value>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET sync_state = $2 WHERE id = $1",
            model.table_name()
        );
        self.tx
            .execute(sql.as_str(), &[&id, &sync_state])
            .await
            .map_err(store_error_from_pg)?;
        Ok(())
    }

    async fn soft_delete(
        &self,
        model: ModelKind,
        id: i64,
        deleted_by: Option<i64>,
        origin: SyncOrigin,
        at: Timestamp,
    ) -> Result<StoredRecord, StoreError> {
        let mut row = self
            .get_by_id(model, id)
            .await?
            .ok_or(StoreError::NotFound { model, id })?;

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
        self.update(&row).await?;

        self.record(ChangeLogEvent::Deleted {
            record_id: id,
            model,
            deleted_by,
            origin,
            at,
        })
        .await?;
        Ok(row)
    }

    async fn delete_row(&self, model: ModelKind, id: i64) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", model.table_name());
        let deleted = self
            .tx
            .execute(sql.as_str(), &[&id])
            .await
            .map_err(store_error_from_pg)?;
        if deleted == 0 {
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
        let mut rewritten = 0;
        for (referencing, column, target) in FOREIGN_KEYS {
            if *target != model {
                continue;
            }
            let sql = format!(
                "UPDATE {table} SET {column} = $2 WHERE {column} = $1",
                table = referencing.table_name(),
                column = column,
            );
            rewritten += self
                .tx
                .execute(sql.as_str(), &[&from_id, &to_id])
                .await
                .map_err(store_error_from_pg)?;
        }
        Ok(rewritten)
    }

    async fn changed_since(
        &self,
        models: &[ModelKind],
        cursor: &PullCursor,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let boundary = cursor.model.zip(cursor.uuid);
        let mut matched: Vec<StoredRecord> = Vec::new();

        for model in models {
            let table = model.table_name();
            // Position of this table relative to the cursor's tie-break
            // point in (model, uuid) order.
            let (predicate, needs_uuid) = match boundary {
                None => ("t.updated_at > $1", false),
                Some((cursor_model, _)) => {
                    match table.cmp(cursor_model.table_name()) {
                        std::cmp::Ordering::Less => ("t.updated_at > $1", false),
                        std::cmp::Ordering::Equal => (
                            "(t.updated_at > $1 OR (t.updated_at = $1 AND t.uuid > $2))",
                            true,
                        ),
                        std::cmp::Ordering::Greater => ("t.updated_at >= $1", false),
                    }
                }
            };

            let sql = format!(
                "SELECT {columns}, to_jsonb(t) AS doc FROM {table} t WHERE {predicate} \
                 ORDER BY t.updated_at, t.uuid LIMIT {limit}",
                columns = RECORD_SELECT_COLUMNS,
                table = table,
                predicate = predicate,
                limit = limit,
            );

            let rows = if needs_uuid {
                let uuid = boundary.map(|(_, uuid)| uuid).unwrap_or_default();
                self.tx.query(sql.as_str(), &[&cursor.since, &uuid]).await
            } else {
                self.tx.query(sql.as_str(), &[&cursor.since]).await
            }
            .map_err(store_error_from_pg)?;

            for row in rows {
                matched.push(record_from_row(*model, &row)?);
            }
        }

        matched.sort_by(|a, b| {
            (a.updated_at, a.model.table_name(), a.uuid)
                .cmp(&(b.updated_at, b.model.table_name(), b.uuid))
        });
        matched.truncate(limit);
        Ok(matched)
    }
}

// ============================================================================
// CHANGE LOG
// ============================================================================

#[async_trait]
impl ChangeLog for PgStore<'_> {
    async fn record(&self, event: ChangeLogEvent) -> Result<(), StoreError> {
        let result = match event {
            ChangeLogEvent::SyncApplied {
                record_id,
                model,
                action,
                origin,
                target,
                user_id,
                at,
            } => {
                self.tx
                    .execute(
                        "INSERT INTO sync_logs \
                             (record_id, model_name, action, origin, target, timestamp, user_id) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                        &[
                            &record_id,
                            &model.table_name(),
                            &action.as_str(),
                            &origin.as_str(),
                            &target.as_str(),
                            &at,
                            &user_id,
                        ],
                    )
                    .await
            }
            ChangeLogEvent::ConflictResolved {
                record_id,
                model,
                local_version,
                cloud_version,
                resolved_version,
                at,
            } => {
                self.tx
                    .execute(
                        "INSERT INTO conflict_logs \
                             (record_id, model_name, local_version, cloud_version, \
                              resolved_version, resolution_time) \
                         VALUES ($1, $2, $3, $4, $5, $6)",
                        &[
                            &record_id,
                            &model.table_name(),
                            &local_version,
                            &cloud_version,
                            &resolved_version,
                            &at,
                        ],
                    )
                    .await
            }
            ChangeLogEvent::DuplicateCollapsed {
                model,
                kept_id,
                removed_id,
                at,
            } => {
                self.tx
                    .execute(
                        "INSERT INTO duplicate_resolution_logs \
                             (model_name, kept_id, removed_id, timestamp) \
                         VALUES ($1, $2, $3, $4)",
                        &[&model.table_name(), &kept_id, &removed_id, &at],
                    )
                    .await
            }
            ChangeLogEvent::Deleted {
                record_id,
                model,
                deleted_by,
                origin,
                at,
            } => {
                self.tx
                    .execute(
                        "INSERT INTO deletion_logs \
                             (record_id, model_name, deleted_by, deleted_at, origin) \
                         VALUES ($1, $2, $3, $4, $5)",
                        &[
                            &record_id,
                            &model.table_name(),
                            &deleted_by,
                            &at,
                            &origin.as_str(),
                        ],
                    )
                    .await
            }
            ChangeLogEvent::Issue {
                model,
                field,
                issue_type,
                instance,
                at,
            } => {
                self.tx
                    .execute(
                        "INSERT INTO sync_issues \
                             (model_name, field_name, issue_type, instance, timestamp) \
                         VALUES ($1, $2, $3, $4, $5) \
                         ON CONFLICT (model_name, field_name, issue_type, instance) DO NOTHING",
                        &[&model.table_name(), &field, &issue_type, &instance, &at],
                    )
                    .await
            }
            ChangeLogEvent::Error {
                model,
                action,
                trace,
                at,
            } => {
                let hash = compute_error_hash(&trace);
                self.tx
                    .execute(
                        "INSERT INTO sync_errors \
                             (model_name, action, error_trace, error_hash, timestamp) \
                         VALUES ($1, $2, $3, $4, $5) \
                         ON CONFLICT (error_hash) DO NOTHING",
                        &[
                            &model.map(|m| m.table_name()),
                            &action,
                            &trace,
                            &hash,
                            &at,
                        ],
                    )
                    .await
            }
            ChangeLogEvent::SchemaIssue {
                table,
                column,
                issue_type,
                expected,
                actual,
                at,
            } => {
                self.tx
                    .execute(
                        "INSERT INTO schema_validation_issues \
                             (table_name, column_name, issue_type, expected, actual, timestamp) \
                         VALUES ($1, $2, $3, $4, $5, $6)",
                        &[
                            &table,
                            &column,
                            &issue_type.as_str(),
                            &expected,
                            &actual,
                            &at,
                        ],
                    )
                    .await
            }
            ChangeLogEvent::SchemaReset { reason, at } => {
                self.tx
                    .execute(
                        "INSERT INTO schema_resets (reason, timestamp) VALUES ($1, $2)",
                        &[&reason, &at],
                    )
                    .await
            }
            ChangeLogEvent::LocalRecovery { description, at } => {
                self.tx
                    .execute(
                        "INSERT INTO local_recovery_events (description, timestamp) \
                         VALUES ($1, $2)",
                        &[&description, &at],
                    )
                    .await
            }
        };
        result.map_err(store_error_from_pg)?;
        Ok(())
    }
}

// ============================================================================
// SCHEMA INSPECTOR
// ============================================================================

#[async_trait]
impl SchemaInspector for PgStore<'_> {
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<LiveColumn>>, StoreError> {
        let rows = self
            .tx
            .query(
                "SELECT column_name::text, data_type::text, is_nullable::text \
                 FROM information_schema.columns \
                 WHERE table_schema = 'public' AND table_name = $1 \
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .map_err(store_error_from_pg)?;

        if rows.is_empty() {
            return Ok(None);
        }
        let columns = rows
            .iter()
            .map(|row| {
                Ok(LiveColumn {
                    name: row.try_get(0).map_err(store_error_from_pg)?,
                    data_type: row.try_get(1).map_err(store_error_from_pg)?,
                    nullable: row.try_get::<_, String>(2).map_err(store_error_from_pg)? == "YES",
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(Some(columns))
    }
}

// ============================================================================
// SITE REGISTRY (transactional view)
// ============================================================================

/// Registry operations inside an open transaction, used when a check-in
/// or key touch must commit atomically with other writes.
#[async_trait]
impl SiteRegistry for PgStore<'_> {
    async fn find_site_key(&self, site_id: i64) -> Result<Option<SiteKey>, StoreError> {
        let row = self
            .tx
            .query_opt(
                "SELECT site_id, site_name, api_key, active, created_at, last_used_at \
                 FROM site_keys WHERE site_id = $1",
                &[&site_id],
            )
            .await
            .map_err(store_error_from_pg)?;
        Ok(row.map(|row| SiteKey {
            site_id: row.get(0),
            site_name: row.get(1),
            api_key: row.get(2),
            active: row.get(3),
            created_at: row.get(4),
            last_used_at: row.get(5),
        }))
    }

    async fn touch_site_key(&self, site_id: i64, at: Timestamp) -> Result<(), StoreError> {
        self.tx
            .execute(
                "UPDATE site_keys SET last_used_at = $2 WHERE site_id = $1",
                &[&site_id, &at],
            )
            .await
            .map_err(store_error_from_pg)?;
        Ok(())
    }

    async fn record_check_in(
        &self,
        check_in: &CheckIn,
        at: Timestamp,
    ) -> Result<(), StoreError> {
        self.tx
            .execute(
                "INSERT INTO connected_sites \
                     (site_id, git_version, sync_status, last_update_status, last_check_in) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (site_id) DO UPDATE SET \
                     git_version = EXCLUDED.git_version, \
                     sync_status = EXCLUDED.sync_status, \
                     last_update_status = EXCLUDED.last_update_status, \
                     last_check_in = EXCLUDED.last_check_in",
                &[
                    &check_in.site_id,
                    &check_in.git_version,
                    &check_in.sync_status,
                    &check_in.last_update_status,
                    &at,
                ],
            )
            .await
            .map_err(store_error_from_pg)?;
        Ok(())
    }
}
