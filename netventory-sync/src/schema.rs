//! Schema self-check (C9).
//!
//! The declared schema is the single source of truth for what columns
//! each sync table carries. At startup (and on demand) the live database
//! is compared against it; every divergence lands in
//! `schema_validation_issues`, and automated recovery runs are recorded
//! in `schema_resets`.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;

use netventory_core::{
    ModelKind, SchemaIssueType, SchemaValidationIssue, StoreError, Timestamp,
};

use crate::changelog::{ChangeLog, ChangeLogEvent};

// ============================================================================
// DECLARED SCHEMA
// ============================================================================

/// Declared column type, matched against `information_schema.columns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Integer,
    Uuid,
    Text,
    Bool,
    TimestampTz,
    JsonB,
}

impl ColumnType {
    /// Canonical PostgreSQL name, used in issue rows and DDL.
    pub fn pg_name(&self) -> &'static str {
        match self {
            ColumnType::BigInt => "bigint",
            ColumnType::Integer => "integer",
            ColumnType::Uuid => "uuid",
            ColumnType::Text => "text",
            ColumnType::Bool => "boolean",
            ColumnType::TimestampTz => "timestamp with time zone",
            ColumnType::JsonB => "jsonb",
        }
    }

    /// Whether a live `data_type` satisfies this declaration. Varchar is
    /// an acceptable spelling of text; nothing else is fuzzy.
    pub fn matches(&self, live: &str) -> bool {
        let live = live.to_lowercase();
        match self {
            ColumnType::Text => live == "text" || live == "character varying",
            other => live == other.pg_name(),
        }
    }
}

/// One declared column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// One declared table.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
}

const fn col(name: &'static str, ty: ColumnType, nullable: bool) -> ColumnSpec {
    ColumnSpec { name, ty, nullable }
}

/// The eight sync columns every replicated table carries, in declared
/// order. Table specs below repeat them first, then the domain columns.
pub const SYNC_COLUMN_SPECS: [ColumnSpec; 8] = [
    col("id", ColumnType::BigInt, false),
    col("uuid", ColumnType::Uuid, false),
    col("version", ColumnType::BigInt, false),
    col("created_at", ColumnType::TimestampTz, false),
    col("updated_at", ColumnType::TimestampTz, false),
    col("deleted_at", ColumnType::TimestampTz, true),
    col("conflict_data", ColumnType::JsonB, true),
    col("sync_state", ColumnType::JsonB, true),
];

const SYNC0: ColumnSpec = SYNC_COLUMN_SPECS[0];
const SYNC1: ColumnSpec = SYNC_COLUMN_SPECS[1];
const SYNC2: ColumnSpec = SYNC_COLUMN_SPECS[2];
const SYNC3: ColumnSpec = SYNC_COLUMN_SPECS[3];
const SYNC4: ColumnSpec = SYNC_COLUMN_SPECS[4];
const SYNC5: ColumnSpec = SYNC_COLUMN_SPECS[5];
const SYNC6: ColumnSpec = SYNC_COLUMN_SPECS[6];
const SYNC7: ColumnSpec = SYNC_COLUMN_SPECS[7];

macro_rules! sme_columns {
    ($($extra:expr),* $(,)?) => {
        &[SYNC0, SYNC1, SYNC2, SYNC3, SYNC4, SYNC5, SYNC6, SYNC7, $($extra),*]
    };
}

/// Declared schema of every table the sync core owns.
pub static DECLARED_SCHEMA: &[TableSpec] = &[
    TableSpec {
        name: "users",
        columns: sme_columns![
            col("email", ColumnType::Text, false),
            col("name", ColumnType::Text, true),
            col("role", ColumnType::Text, true),
            col("is_active", ColumnType::Bool, false),
        ],
    },
    TableSpec {
        name: "devices",
        columns: sme_columns![
            col("hostname", ColumnType::Text, true),
            col("ip", ColumnType::Text, true),
            col("mac", ColumnType::Text, true),
            col("manufacturer", ColumnType::Text, true),
            col("device_type_id", ColumnType::BigInt, true),
            col("site_id", ColumnType::BigInt, false),
            col("location_id", ColumnType::BigInt, true),
            col("is_deleted", ColumnType::Bool, false),
            col("deleted_by_id", ColumnType::BigInt, true),
            col("deleted_origin", ColumnType::Text, true),
        ],
    },
    TableSpec {
        name: "vlans",
        columns: sme_columns![
            col("vlan_id", ColumnType::BigInt, false),
            col("name", ColumnType::Text, true),
            col("site_id", ColumnType::BigInt, false),
        ],
    },
    TableSpec {
        name: "ssh_credentials",
        columns: sme_columns![
            col("username", ColumnType::Text, false),
            col("host", ColumnType::Text, false),
            col("secret", ColumnType::Text, true),
        ],
    },
    TableSpec {
        name: "snmp_communities",
        columns: sme_columns![
            col("community", ColumnType::Text, false),
            col("snmp_version", ColumnType::Text, false),
            col("host", ColumnType::Text, true),
            col("site_id", ColumnType::BigInt, true),
        ],
    },
    TableSpec {
        name: "locations",
        columns: sme_columns![
            col("name", ColumnType::Text, false),
            col("site_id", ColumnType::BigInt, false),
        ],
    },
    TableSpec {
        name: "device_types",
        columns: sme_columns![
            col("name", ColumnType::Text, false),
            col("manufacturer", ColumnType::Text, true),
        ],
    },
    TableSpec {
        name: "sites",
        columns: sme_columns![col("name", ColumnType::Text, false)],
    },
    TableSpec {
        name: "tags",
        columns: sme_columns![
            col("name", ColumnType::Text, false),
            col("color", ColumnType::Text, true),
        ],
    },
    TableSpec {
        name: "site_keys",
        columns: &[
            col("site_id", ColumnType::BigInt, false),
            col("site_name", ColumnType::Text, false),
            col("api_key", ColumnType::Text, false),
            col("active", ColumnType::Bool, false),
            col("created_at", ColumnType::TimestampTz, false),
            col("last_used_at", ColumnType::TimestampTz, true),
        ],
    },
    TableSpec {
        name: "user_api_keys",
        columns: &[
            col("id", ColumnType::Uuid, false),
            col("user_id", ColumnType::BigInt, false),
            col("key", ColumnType::Text, false),
            col("status", ColumnType::Text, false),
            col("created_at", ColumnType::TimestampTz, false),
            col("last_used_at", ColumnType::TimestampTz, true),
        ],
    },
    TableSpec {
        name: "connected_sites",
        columns: &[
            col("site_id", ColumnType::BigInt, false),
            col("git_version", ColumnType::Text, false),
            col("sync_status", ColumnType::Text, false),
            col("last_update_status", ColumnType::Text, false),
            col("last_check_in", ColumnType::TimestampTz, false),
        ],
    },
    TableSpec {
        name: "sync_logs",
        columns: &[
            col("id", ColumnType::BigInt, false),
            col("record_id", ColumnType::BigInt, false),
            col("model_name", ColumnType::Text, false),
            col("action", ColumnType::Text, false),
            col("origin", ColumnType::Text, false),
            col("target", ColumnType::Text, false),
            col("timestamp", ColumnType::TimestampTz, false),
            col("user_id", ColumnType::BigInt, true),
        ],
    },
    TableSpec {
        name: "conflict_logs",
        columns: &[
            col("id", ColumnType::BigInt, false),
            col("record_id", ColumnType::BigInt, false),
            col("model_name", ColumnType::Text, false),
            col("local_version", ColumnType::BigInt, false),
            col("cloud_version", ColumnType::BigInt, false),
            col("resolved_version", ColumnType::BigInt, false),
            col("resolution_time", ColumnType::TimestampTz, false),
        ],
    },
    TableSpec {
        name: "duplicate_resolution_logs",
        columns: &[
            col("id", ColumnType::BigInt, false),
            col("model_name", ColumnType::Text, false),
            col("kept_id", ColumnType::BigInt, false),
            col("removed_id", ColumnType::BigInt, true),
            col("timestamp", ColumnType::TimestampTz, false),
        ],
    },
    TableSpec {
        name: "deletion_logs",
        columns: &[
            col("id", ColumnType::BigInt, false),
            col("record_id", ColumnType::BigInt, false),
            col("model_name", ColumnType::Text, false),
            col("deleted_by", ColumnType::BigInt, true),
            col("deleted_at", ColumnType::TimestampTz, false),
            col("origin", ColumnType::Text, false),
        ],
    },
    TableSpec {
        name: "sync_issues",
        columns: &[
            col("id", ColumnType::BigInt, false),
            col("model_name", ColumnType::Text, false),
            col("field_name", ColumnType::Text, false),
            col("issue_type", ColumnType::Text, false),
            col("instance", ColumnType::Text, false),
            col("timestamp", ColumnType::TimestampTz, false),
        ],
    },
    TableSpec {
        name: "sync_errors",
        columns: &[
            col("id", ColumnType::BigInt, false),
            col("model_name", ColumnType::Text, true),
            col("action", ColumnType::Text, false),
            col("error_trace", ColumnType::Text, false),
            col("error_hash", ColumnType::Text, false),
            col("timestamp", ColumnType::TimestampTz, false),
        ],
    },
    TableSpec {
        name: "schema_validation_issues",
        columns: &[
            col("id", ColumnType::BigInt, false),
            col("table_name", ColumnType::Text, false),
            col("column_name", ColumnType::Text, true),
            col("issue_type", ColumnType::Text, false),
            col("expected", ColumnType::Text, true),
            col("actual", ColumnType::Text, true),
            col("timestamp", ColumnType::TimestampTz, false),
        ],
    },
    TableSpec {
        name: "schema_resets",
        columns: &[
            col("id", ColumnType::BigInt, false),
            col("reason", ColumnType::Text, false),
            col("timestamp", ColumnType::TimestampTz, false),
        ],
    },
    TableSpec {
        name: "local_recovery_events",
        columns: &[
            col("id", ColumnType::BigInt, false),
            col("description", ColumnType::Text, false),
            col("timestamp", ColumnType::TimestampTz, false),
        ],
    },
];

static TABLES_BY_NAME: Lazy<HashMap<&'static str, &'static TableSpec>> = Lazy::new(|| {
    DECLARED_SCHEMA
        .iter()
        .map(|table| (table.name, table))
        .collect()
});

/// Declared schema of every table the sync core owns.
pub fn declared_schema() -> &'static [TableSpec] {
    DECLARED_SCHEMA
}

/// Foreign keys between sync-managed tables, as
/// `(referencing model, column, referenced model)`. The duplicate
/// resolver rewrites these when it collapses a row.
pub const FOREIGN_KEYS: &[(ModelKind, &str, ModelKind)] = &[
    (ModelKind::Devices, "site_id", ModelKind::Sites),
    (ModelKind::Devices, "location_id", ModelKind::Locations),
    (ModelKind::Devices, "device_type_id", ModelKind::DeviceTypes),
    (ModelKind::Devices, "deleted_by_id", ModelKind::Users),
    (ModelKind::Locations, "site_id", ModelKind::Sites),
    (ModelKind::Vlans, "site_id", ModelKind::Sites),
    (ModelKind::SnmpCommunities, "site_id", ModelKind::Sites),
];

/// Declared table for a model kind.
pub fn table_spec(model: ModelKind) -> &'static TableSpec {
    TABLES_BY_NAME
        .get(model.table_name())
        .expect("every model kind has a declared table")
}

// ============================================================================
// LIVE SCHEMA INSPECTION
// ============================================================================

/// One column as reported by the live database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Reads live column definitions. The PostgreSQL implementation queries
/// `information_schema.columns`; the in-memory store answers from the
/// declared schema (optionally perturbed for tests).
#[async_trait]
pub trait SchemaInspector: Send + Sync {
    /// Live columns of a table, or None when the table does not exist.
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<LiveColumn>>, StoreError>;
}

/// Compare declared vs live schema. Pure comparison; recording is the
/// caller's job.
pub async fn validate_schema<I: SchemaInspector>(
    inspector: &I,
    now: Timestamp,
) -> Result<Vec<SchemaValidationIssue>, StoreError> {
    let mut issues = Vec::new();

    for table in declared_schema() {
        let live = match inspector.table_columns(table.name).await? {
            Some(columns) => columns,
            None => {
                // A missing table surfaces as every declared column missing.
                for column in table.columns {
                    issues.push(SchemaValidationIssue {
                        table_name: table.name.to_string(),
                        column_name: Some(column.name.to_string()),
                        issue_type: SchemaIssueType::MissingColumn,
                        expected: Some(column.ty.pg_name().to_string()),
                        actual: None,
                        timestamp: now,
                    });
                }
                continue;
            }
        };

        for column in table.columns {
            match live.iter().find(|c| c.name == column.name) {
                None => issues.push(SchemaValidationIssue {
                    table_name: table.name.to_string(),
                    column_name: Some(column.name.to_string()),
                    issue_type: SchemaIssueType::MissingColumn,
                    expected: Some(column.ty.pg_name().to_string()),
                    actual: None,
                    timestamp: now,
                }),
                Some(found) => {
                    if !column.ty.matches(&found.data_type) {
                        issues.push(SchemaValidationIssue {
                            table_name: table.name.to_string(),
                            column_name: Some(column.name.to_string()),
                            issue_type: SchemaIssueType::TypeMismatch,
                            expected: Some(column.ty.pg_name().to_string()),
                            actual: Some(found.data_type.clone()),
                            timestamp: now,
                        });
                    }
                    if column.nullable != found.nullable {
                        issues.push(SchemaValidationIssue {
                            table_name: table.name.to_string(),
                            column_name: Some(column.name.to_string()),
                            issue_type: SchemaIssueType::NullabilityMismatch,
                            expected: Some(if column.nullable { "NULL" } else { "NOT NULL" }.into()),
                            actual: Some(if found.nullable { "NULL" } else { "NOT NULL" }.into()),
                            timestamp: now,
                        });
                    }
                }
            }
        }

        for found in &live {
            if !table.columns.iter().any(|c| c.name == found.name) {
                issues.push(SchemaValidationIssue {
                    table_name: table.name.to_string(),
                    column_name: Some(found.name.clone()),
                    issue_type: SchemaIssueType::ExtraColumn,
                    expected: None,
                    actual: Some(found.data_type.clone()),
                    timestamp: now,
                });
            }
        }
    }

    Ok(issues)
}

/// Run the self-check and record every divergence.
pub async fn run_self_check<S: SchemaInspector + ChangeLog>(
    store: &S,
    now: Timestamp,
) -> Result<Vec<SchemaValidationIssue>, StoreError> {
    let issues = validate_schema(store, now).await?;
    for issue in &issues {
        store
            .record(ChangeLogEvent::SchemaIssue {
                table: issue.table_name.clone(),
                column: issue.column_name.clone(),
                issue_type: issue.issue_type,
                expected: issue.expected.clone(),
                actual: issue.actual.clone(),
                at: now,
            })
            .await?;
    }
    if !issues.is_empty() {
        tracing::warn!(count = issues.len(), "schema self-check found divergences");
    }
    Ok(issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_model_kind_has_a_table_spec() {
        for model in ModelKind::ALL {
            let spec = table_spec(model);
            assert_eq!(spec.name, model.table_name());
            // Every replicated table starts with the sync columns.
            assert_eq!(spec.columns[0].name, "id");
            assert_eq!(spec.columns[1].name, "uuid");
            assert_eq!(spec.columns[2].name, "version");
            assert!(spec.columns.iter().any(|c| c.name == "conflict_data"));
            assert!(spec.columns.iter().any(|c| c.name == "sync_state"));
        }
    }

    #[test]
    fn test_column_type_matching() {
        assert!(ColumnType::Text.matches("text"));
        assert!(ColumnType::Text.matches("character varying"));
        assert!(!ColumnType::Text.matches("jsonb"));
        assert!(ColumnType::TimestampTz.matches("timestamp with time zone"));
        assert!(!ColumnType::BigInt.matches("integer"));
    }

    #[test]
    fn test_devices_declares_soft_delete_provenance() {
        let spec = table_spec(ModelKind::Devices);
        for name in ["is_deleted", "deleted_by_id", "deleted_origin"] {
            assert!(spec.columns.iter().any(|c| c.name == name), "missing {}", name);
        }
    }
}
