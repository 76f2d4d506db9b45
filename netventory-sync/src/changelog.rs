//! Change-log writer (C3).
//!
//! Every observable sync outcome is appended to one of the bookkeeping
//! tables through this trait, inside the same transaction as the mutation
//! it describes. `Issue` and `Error` deduplicate silently via their
//! unique constraints.

use async_trait::async_trait;

use netventory_core::{ModelKind, SchemaIssueType, StoreError, SyncAction, SyncOrigin, SyncPeer, Timestamp};

/// A tagged sync event. Variants map one-to-one onto the bookkeeping
/// tables.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeLogEvent {
    /// A shipped mutation was applied (`sync_logs`).
    SyncApplied {
        record_id: i64,
        model: ModelKind,
        action: SyncAction,
        origin: SyncPeer,
        target: SyncPeer,
        user_id: Option<i64>,
        at: Timestamp,
    },
    /// A merge conflict was resolved receiver-wins (`conflict_logs`).
    ConflictResolved {
        record_id: i64,
        model: ModelKind,
        local_version: i64,
        cloud_version: i64,
        resolved_version: i64,
        at: Timestamp,
    },
    /// A natural-key duplicate was collapsed (`duplicate_resolution_logs`).
    DuplicateCollapsed {
        model: ModelKind,
        kept_id: i64,
        removed_id: Option<i64>,
        at: Timestamp,
    },
    /// A row was soft-deleted (`deletion_logs`).
    Deleted {
        record_id: i64,
        model: ModelKind,
        deleted_by: Option<i64>,
        origin: SyncOrigin,
        at: Timestamp,
    },
    /// A per-field data issue (`sync_issues`, deduplicated on the
    /// `(model, field, issue_type, instance)` tuple).
    Issue {
        model: ModelKind,
        field: String,
        issue_type: String,
        instance: String,
        at: Timestamp,
    },
    /// A server-side failure (`sync_errors`, deduplicated on the trace
    /// hash).
    Error {
        model: Option<ModelKind>,
        action: String,
        trace: String,
        at: Timestamp,
    },
    /// A declared-vs-live schema divergence (`schema_validation_issues`).
    SchemaIssue {
        table: String,
        column: Option<String>,
        issue_type: SchemaIssueType,
        expected: Option<String>,
        actual: Option<String>,
        at: Timestamp,
    },
    /// Automated schema recovery ran (`schema_resets`).
    SchemaReset { reason: String, at: Timestamp },
    /// A local-instance recovery event (`local_recovery_events`).
    LocalRecovery { description: String, at: Timestamp },
}

/// Append-only writer over the bookkeeping tables.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    async fn record(&self, event: ChangeLogEvent) -> Result<(), StoreError>;
}
