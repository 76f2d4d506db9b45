//! Merge decision core.
//!
//! Pure comparison of an incoming record against the receiver's current
//! row. The push processor turns the decision into writes and log
//! entries; nothing in here touches storage.
//!
//! The rules, in the order they apply:
//! 1. no existing row: insert at `max(1, incoming.version)`.
//! 2. existing tombstone vs incoming edit: resurrect only when the edit
//!    carries a strictly newer version; otherwise the delete wins.
//! 3. incoming tombstone vs existing live row: apply the delete when
//!    strictly newer, conflict on an equal version, skip when stale.
//! 4. both live: newer version wins outright; an equal version with an
//!    equal payload is an idempotent repeat; any other payload divergence
//!    is a conflict resolved receiver-wins-by-value.
//!
//! Version 0 marks a record from a client that does not track versions:
//! it is always accepted and re-versioned above the receiver's row, so
//! legacy sites converge instead of conflicting forever.

use serde_json::Value;

use netventory_core::{StoredRecord, SyncRecord, SYNC_COLUMNS};

/// Outcome of comparing an incoming record against the current row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No existing row: insert at this version.
    Insert { version: i64 },
    /// Overwrite the provided fields; `resurrect` clears the tombstone.
    Accept { version: i64, resurrect: bool },
    /// Apply the incoming tombstone at this version.
    Delete { version: i64 },
    /// Receiver's row wins by value; park the incoming payload in
    /// `conflict_data` and bump to this version so the result propagates.
    Conflict { version: i64 },
    /// Same version, same payload: nothing to do, nothing to log.
    IdempotentSkip,
    /// Older version, same payload: stale echo of an already-applied
    /// mutation.
    StaleSkip,
    /// The existing tombstone is at least as new as the incoming edit; a
    /// later delete always wins over an earlier edit.
    DeleteWinsSkip,
}

/// Resolved version for any applied mutation: strictly above both sides.
fn bumped(existing: i64, incoming: i64) -> i64 {
    existing.max(incoming) + 1
}

/// Field-level equality on the provided fields only. Sync-owned columns
/// are ignored; a field the sender did not provide is not compared.
pub fn payload_matches(existing: &StoredRecord, incoming: &SyncRecord) -> bool {
    incoming
        .fields
        .iter()
        .filter(|(k, _)| !SYNC_COLUMNS.contains(&k.as_str()))
        .all(|(k, v)| existing.fields.get(k).unwrap_or(&Value::Null) == v)
}

/// Compare an incoming record against the receiver's current row.
pub fn decide(existing: Option<&StoredRecord>, incoming: &SyncRecord) -> MergeDecision {
    let current = match existing {
        None => {
            return MergeDecision::Insert {
                version: incoming.version.max(1),
            }
        }
        Some(row) => row,
    };

    // Unversioned client: accept and re-version above the current row.
    if incoming.version == 0 && !incoming.is_tombstone() {
        return MergeDecision::Accept {
            version: bumped(current.version, 0),
            resurrect: current.is_tombstone(),
        };
    }

    match (current.is_tombstone(), incoming.is_tombstone()) {
        // Tombstone vs edit: resurrect only on a strictly newer version.
        (true, false) => {
            if incoming.version > current.version {
                MergeDecision::Accept {
                    version: bumped(current.version, incoming.version),
                    resurrect: true,
                }
            } else {
                MergeDecision::DeleteWinsSkip
            }
        }
        // Edit vs incoming tombstone.
        (false, true) => {
            if incoming.version > current.version {
                MergeDecision::Delete {
                    version: bumped(current.version, incoming.version),
                }
            } else if incoming.version == current.version {
                MergeDecision::Conflict {
                    version: bumped(current.version, incoming.version),
                }
            } else {
                MergeDecision::StaleSkip
            }
        }
        // Both deleted: keep the newer tombstone, otherwise nothing to do.
        (true, true) => {
            if incoming.version > current.version {
                MergeDecision::Accept {
                    version: bumped(current.version, incoming.version),
                    resurrect: false,
                }
            } else {
                MergeDecision::IdempotentSkip
            }
        }
        // Both live: the version comparison proper.
        (false, false) => {
            if incoming.version > current.version {
                MergeDecision::Accept {
                    version: bumped(current.version, incoming.version),
                    resurrect: false,
                }
            } else if incoming.version == current.version {
                if payload_matches(current, incoming) {
                    MergeDecision::IdempotentSkip
                } else {
                    MergeDecision::Conflict {
                        version: bumped(current.version, incoming.version),
                    }
                }
            } else if payload_matches(current, incoming) {
                MergeDecision::StaleSkip
            } else {
                MergeDecision::Conflict {
                    version: bumped(current.version, incoming.version),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use netventory_core::ModelKind;
    use serde_json::json;
    use uuid::Uuid;

    fn stored(version: i64, fields: Value, deleted: bool) -> StoredRecord {
        let now = Utc::now();
        StoredRecord {
            model: ModelKind::Users,
            id: 1,
            uuid: Uuid::new_v4(),
            version,
            created_at: now,
            updated_at: now,
            deleted_at: if deleted { Some(now) } else { None },
            conflict_data: None,
            sync_state: None,
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    fn incoming(version: i64, fields: Value, deleted: bool) -> SyncRecord {
        SyncRecord {
            model: ModelKind::Users,
            id: Some(1),
            uuid: None,
            version,
            created_at: None,
            updated_at: None,
            deleted_at: if deleted { Some(Utc::now()) } else { None },
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_new_row_inserts_at_least_version_one() {
        assert_eq!(
            decide(None, &incoming(0, json!({"email": "a@x"}), false)),
            MergeDecision::Insert { version: 1 }
        );
        assert_eq!(
            decide(None, &incoming(5, json!({"email": "a@x"}), false)),
            MergeDecision::Insert { version: 5 }
        );
    }

    #[test]
    fn test_newer_version_is_accepted_above_both_sides() {
        let current = stored(1, json!({"email": "a@x"}), false);
        assert_eq!(
            decide(Some(&current), &incoming(3, json!({"email": "b@x"}), false)),
            MergeDecision::Accept {
                version: 4,
                resurrect: false
            }
        );
    }

    #[test]
    fn test_equal_version_equal_payload_is_idempotent() {
        let current = stored(2, json!({"email": "a@x", "name": "A"}), false);
        assert_eq!(
            decide(Some(&current), &incoming(2, json!({"email": "a@x"}), false)),
            MergeDecision::IdempotentSkip
        );
    }

    #[test]
    fn test_equal_version_diverging_payload_is_a_conflict() {
        let current = stored(1, json!({"email": "a@x"}), false);
        assert_eq!(
            decide(Some(&current), &incoming(1, json!({"email": "b@x"}), false)),
            MergeDecision::Conflict { version: 2 }
        );
    }

    #[test]
    fn test_stale_echo_is_skipped() {
        let current = stored(4, json!({"email": "a@x"}), false);
        assert_eq!(
            decide(Some(&current), &incoming(2, json!({"email": "a@x"}), false)),
            MergeDecision::StaleSkip
        );
    }

    #[test]
    fn test_stale_diverging_payload_is_a_conflict() {
        let current = stored(4, json!({"email": "a@x"}), false);
        assert_eq!(
            decide(Some(&current), &incoming(2, json!({"email": "b@x"}), false)),
            MergeDecision::Conflict { version: 5 }
        );
    }

    #[test]
    fn test_unversioned_client_record_is_accepted() {
        let current = stored(1, json!({"email": "a@x"}), false);
        assert_eq!(
            decide(Some(&current), &incoming(0, json!({"email": "b@x"}), false)),
            MergeDecision::Accept {
                version: 2,
                resurrect: false
            }
        );
    }

    #[test]
    fn test_newer_edit_resurrects_tombstone() {
        let current = stored(2, json!({"email": "a@x"}), true);
        assert_eq!(
            decide(Some(&current), &incoming(3, json!({"email": "a@x"}), false)),
            MergeDecision::Accept {
                version: 4,
                resurrect: true
            }
        );
    }

    #[test]
    fn test_later_delete_wins_over_earlier_edit() {
        let current = stored(3, json!({"email": "a@x"}), true);
        for version in [1, 2, 3] {
            assert_eq!(
                decide(Some(&current), &incoming(version, json!({"email": "b@x"}), false)),
                MergeDecision::DeleteWinsSkip
            );
        }
    }

    #[test]
    fn test_newer_tombstone_applies_the_delete() {
        let current = stored(1, json!({"email": "a@x"}), false);
        assert_eq!(
            decide(Some(&current), &incoming(2, json!({}), true)),
            MergeDecision::Delete { version: 3 }
        );
    }

    #[test]
    fn test_same_version_delete_vs_edit_is_a_conflict() {
        let current = stored(2, json!({"email": "a@x"}), false);
        assert_eq!(
            decide(Some(&current), &incoming(2, json!({}), true)),
            MergeDecision::Conflict { version: 3 }
        );
    }

    #[test]
    fn test_stale_delete_loses_to_newer_edit() {
        let current = stored(5, json!({"email": "a@x"}), false);
        assert_eq!(
            decide(Some(&current), &incoming(2, json!({}), true)),
            MergeDecision::StaleSkip
        );
    }

    #[test]
    fn test_repeated_tombstone_is_idempotent() {
        let current = stored(4, json!({"email": "a@x"}), true);
        assert_eq!(
            decide(Some(&current), &incoming(4, json!({}), true)),
            MergeDecision::IdempotentSkip
        );
    }

    #[test]
    fn test_payload_match_ignores_sync_columns_and_unprovided_fields() {
        let current = stored(1, json!({"email": "a@x", "name": "A"}), false);
        let mut record = incoming(1, json!({"email": "a@x"}), false);
        record
            .fields
            .insert("sync_state".into(), json!({"pushed_version": 1}));
        assert!(payload_matches(&current, &record));
    }

    #[test]
    fn test_payload_match_treats_missing_as_null() {
        let current = stored(1, json!({"email": "a@x"}), false);
        let record = incoming(1, json!({"email": "a@x", "name": null}), false);
        assert!(payload_matches(&current, &record));

        let record = incoming(1, json!({"email": "a@x", "name": "A"}), false);
        assert!(!payload_matches(&current, &record));
    }

    #[test]
    fn test_applied_decisions_stay_above_current_version() {
        // Whatever the branch, an applied decision lands strictly above
        // the current row.
        let current = stored(7, json!({"email": "a@x"}), false);
        for version in 0..10 {
            match decide(Some(&current), &incoming(version, json!({"email": "z@x"}), false)) {
                MergeDecision::Accept { version: v, .. }
                | MergeDecision::Delete { version: v }
                | MergeDecision::Conflict { version: v } => assert!(v > current.version),
                _ => {}
            }
        }
    }

    #[test]
    fn test_empty_incoming_payload_matches_anything() {
        let current = stored(1, json!({"email": "a@x"}), false);
        let record = incoming(1, json!({}), false);
        // Nothing provided, nothing diverges.
        assert!(payload_matches(&current, &record));
    }
}
