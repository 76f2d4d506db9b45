//! Duplicate resolver (C6).
//!
//! Collapses natural-key duplicates to a single winner. The surviving row
//! is the one with the lower `id` (older rows typically carry more
//! inbound references); the loser's payload fills only the survivor's
//! null/empty fields, inbound foreign keys are rewritten, and the
//! collapse is logged.

use serde_json::Value;

use netventory_core::{Payload, StoreError, StoredRecord, SyncRecord, SyncResult, Timestamp, SYNC_COLUMNS};

use crate::changelog::{ChangeLog, ChangeLogEvent};
use crate::store::RecordStore;

/// A value that does not count as "filled" on the surviving row.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Copy donor fields into the survivor's payload wherever the survivor
/// has nothing. Returns the merged payload.
fn fill_missing(survivor: &Payload, donor: &Payload) -> Payload {
    let mut merged = survivor.clone();
    for (key, value) in donor {
        if SYNC_COLUMNS.contains(&key.as_str()) || is_empty_value(value) {
            continue;
        }
        let take = merged.get(key).map(is_empty_value).unwrap_or(true);
        if take {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Collapse two stored rows that share a natural key. Returns the
/// survivor as written. Idempotent: once the loser is gone there is no
/// collision left to resolve.
pub async fn resolve_duplicates<S: RecordStore + ChangeLog>(
    store: &S,
    a: &StoredRecord,
    b: &StoredRecord,
    at: Timestamp,
) -> SyncResult<StoredRecord> {
    if a.model != b.model {
        return Err(StoreError::Backend {
            reason: format!(
                "cannot collapse {} row into {} row",
                b.model, a.model
            ),
        }
        .into());
    }

    // Re-acquire both rows in sorted-uuid order so concurrent resolvers
    // take their row locks in a consistent order. A row that vanished in
    // the meantime means another resolver already collapsed the pair.
    let (first, second) = if a.uuid <= b.uuid { (a, b) } else { (b, a) };
    let first = store.get_by_uuid(first.model, first.uuid).await?;
    let second = store.get_by_uuid(second.model, second.uuid).await?;
    let (a, b) = match (first, second) {
        (Some(a), Some(b)) => (a, b),
        (Some(row), None) | (None, Some(row)) => return Ok(row),
        (None, None) => {
            return Err(StoreError::Backend {
                reason: "both duplicate rows vanished during resolution".into(),
            }
            .into())
        }
    };

    let (winner, loser) = if a.id <= b.id { (&a, &b) } else { (&b, &a) };

    let mut survivor = winner.clone();
    survivor.fields = fill_missing(&winner.fields, &loser.fields);
    survivor.version = winner.version.max(loser.version) + 1;
    survivor.updated_at = at;

    let rewritten = store
        .rewrite_references(winner.model, loser.id, winner.id)
        .await?;
    tracing::debug!(
        model = %winner.model,
        kept_id = winner.id,
        removed_id = loser.id,
        rewritten,
        "collapsed natural-key duplicate"
    );

    store.delete_row(loser.model, loser.id).await?;
    store.update(&survivor).await?;
    store
        .record(ChangeLogEvent::DuplicateCollapsed {
            model: winner.model,
            kept_id: winner.id,
            removed_id: Some(loser.id),
            at,
        })
        .await?;

    Ok(survivor)
}

/// Collapse an incoming, never-stored record into the existing row that
/// owns its natural key. The stored row survives regardless of the
/// incoming id (there is nothing to delete or rewrite on this side).
pub async fn absorb_incoming_duplicate<S: RecordStore + ChangeLog>(
    store: &S,
    survivor: &StoredRecord,
    incoming: &SyncRecord,
    at: Timestamp,
) -> SyncResult<StoredRecord> {
    let mut merged = survivor.clone();
    merged.fields = fill_missing(&survivor.fields, &incoming.sanitized_fields());
    merged.version = survivor.version.max(incoming.version) + 1;
    merged.updated_at = at;

    store.update(&merged).await?;
    store
        .record(ChangeLogEvent::DuplicateCollapsed {
            model: survivor.model,
            kept_id: survivor.id,
            removed_id: incoming.id,
            at,
        })
        .await?;

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fill_missing_only_touches_empty_fields() {
        let survivor = json!({"hostname": "edge-01", "ip": "", "manufacturer": null})
            .as_object()
            .cloned()
            .unwrap();
        let donor = json!({"hostname": "dup", "ip": "2.2.2.2", "manufacturer": "cisco", "mac": "aa"})
            .as_object()
            .cloned()
            .unwrap();

        let merged = fill_missing(&survivor, &donor);
        assert_eq!(merged["hostname"], json!("edge-01"));
        assert_eq!(merged["ip"], json!("2.2.2.2"));
        assert_eq!(merged["manufacturer"], json!("cisco"));
        assert_eq!(merged["mac"], json!("aa"));
    }

    #[test]
    fn test_fill_missing_skips_empty_donor_values() {
        let survivor = json!({"hostname": null}).as_object().cloned().unwrap();
        let donor = json!({"hostname": "  "}).as_object().cloned().unwrap();
        let merged = fill_missing(&survivor, &donor);
        assert_eq!(merged["hostname"], json!(null));
    }

    #[test]
    fn test_fill_missing_never_copies_sync_columns() {
        let survivor = Payload::new();
        let donor = json!({"version": 9, "uuid": "x", "name": "lab"})
            .as_object()
            .cloned()
            .unwrap();
        let merged = fill_missing(&survivor, &donor);
        assert!(!merged.contains_key("version"));
        assert!(!merged.contains_key("uuid"));
        assert_eq!(merged["name"], json!("lab"));
    }
}
