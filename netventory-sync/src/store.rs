//! Storage traits for the replication engine.
//!
//! `RecordStore` is the seam between the engine and persistence: the
//! in-memory implementation backs the test suites, the PostgreSQL
//! implementation in netventory-api backs production. Implementations are
//! expected to run every call of one request inside a single transaction
//! and to take row-level locks on lookups that precede writes.

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use netventory_core::{
    AuthError, CheckIn, ModelKind, NaturalKey, Payload, PullCursor, SiteKey, StoreError,
    StoredRecord, SyncOrigin, SyncResult, Timestamp,
};

// ============================================================================
// RECORD STORE (C1)
// ============================================================================

/// A row about to be inserted. The store assigns the local `id`.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub model: ModelKind,
    pub uuid: Uuid,
    pub version: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
    pub conflict_data: Option<Value>,
    pub fields: Payload,
}

/// Typed persistence of sync-managed entities.
///
/// `update` writes the row exactly as given: callers passing a merged row
/// own `version` and `updated_at`. `soft_delete` bumps the version itself
/// and records the deletion log entry in the same transaction.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Row by canonical cross-site identity.
    async fn get_by_uuid(
        &self,
        model: ModelKind,
        uuid: Uuid,
    ) -> Result<Option<StoredRecord>, StoreError>;

    /// Row by local id.
    async fn get_by_id(&self, model: ModelKind, id: i64)
        -> Result<Option<StoredRecord>, StoreError>;

    /// Live (non-tombstone) row matching a natural key.
    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<StoredRecord>, StoreError>;

    /// Insert a new row, assigning its local id.
    async fn insert(&self, record: NewRecord) -> Result<StoredRecord, StoreError>;

    /// Replace all non-key columns of an existing row with the given
    /// merged row. Does not apply conflict policy; the caller already has.
    async fn update(&self, record: &StoredRecord) -> Result<(), StoreError>;

    /// Update only the `sync_state` side-channel. Must not touch
    /// `version` or `updated_at` (shipping bookkeeping is not an edit).
    async fn set_sync_state(
        &self,
        model: ModelKind,
        id: i64,
        sync_state: Option<Value>,
    ) -> Result<(), StoreError>;

    /// Soft-delete a row: set `deleted_at`, bump `version`, refresh
    /// `updated_at`, and write the `deletion_logs` entry.
    async fn soft_delete(
        &self,
        model: ModelKind,
        id: i64,
        deleted_by: Option<i64>,
        origin: SyncOrigin,
        at: Timestamp,
    ) -> Result<StoredRecord, StoreError>;

    /// Physically remove a row. Only the duplicate resolver does this,
    /// after rewriting inbound references.
    async fn delete_row(&self, model: ModelKind, id: i64) -> Result<(), StoreError>;

    /// Rewrite foreign keys pointing at `from_id` to `to_id` across all
    /// referencing tables. Returns the number of rewritten references.
    async fn rewrite_references(
        &self,
        model: ModelKind,
        from_id: i64,
        to_id: i64,
    ) -> Result<u64, StoreError>;

    /// Rows changed since the cursor across the given models, tombstones
    /// included, ordered by `(updated_at, model, uuid)` with the cursor's
    /// tie-break applied. Returns at most `limit` rows.
    async fn changed_since(
        &self,
        models: &[ModelKind],
        cursor: &PullCursor,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError>;
}

// ============================================================================
// SITE-KEY REGISTRY (C2)
// ============================================================================

/// Site-key lookup and liveness tracking.
#[async_trait]
pub trait SiteRegistry: Send + Sync {
    /// Provisioned key row for a site, active or not.
    async fn find_site_key(&self, site_id: i64) -> Result<Option<SiteKey>, StoreError>;

    /// Record that a site's key was just used.
    async fn touch_site_key(&self, site_id: i64, at: Timestamp) -> Result<(), StoreError>;

    /// Upsert the `connected_sites` heartbeat row for a site.
    async fn record_check_in(&self, check_in: &CheckIn, at: Timestamp)
        -> Result<(), StoreError>;
}

/// Compare two secrets without leaking length or prefix timing: equality
/// of SHA-256 digests is equality of inputs for any practical purpose.
fn secrets_match(expected: &str, presented: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(presented.as_bytes());
    a == b
}

/// Verify a presented key against the provisioned row.
pub fn verify_site_key(key: &SiteKey, presented: &str) -> Result<(), AuthError> {
    if !secrets_match(&key.api_key, presented) {
        return Err(AuthError::BadKey {
            site_id: key.site_id,
        });
    }
    if !key.active {
        return Err(AuthError::Inactive {
            site_id: key.site_id,
        });
    }
    Ok(())
}

/// Authenticate an inbound sync call by `(site_id, api_key)` and update
/// the key's `last_used_at`.
pub async fn authenticate<R: SiteRegistry>(
    registry: &R,
    site_id: i64,
    api_key: &str,
    now: Timestamp,
) -> SyncResult<SiteKey> {
    let key = registry
        .find_site_key(site_id)
        .await?
        .ok_or(AuthError::UnknownSite { site_id })?;

    if let Err(err) = verify_site_key(&key, api_key) {
        tracing::warn!(site_id, kind = err.kind(), "site authentication failed");
        return Err(err.into());
    }

    registry.touch_site_key(site_id, now).await?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn site_key(active: bool) -> SiteKey {
        SiteKey {
            site_id: 7,
            site_name: "branch-7".into(),
            api_key: "nv_0123456789abcdef".into(),
            active,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[test]
    fn test_verify_accepts_matching_key() {
        assert!(verify_site_key(&site_key(true), "nv_0123456789abcdef").is_ok());
    }

    #[test]
    fn test_verify_rejects_bad_key() {
        let err = verify_site_key(&site_key(true), "nv_wrong").unwrap_err();
        assert_eq!(err.kind(), "bad_key");
    }

    #[test]
    fn test_verify_rejects_inactive_site_even_with_good_key() {
        let err = verify_site_key(&site_key(false), "nv_0123456789abcdef").unwrap_err();
        assert_eq!(err.kind(), "inactive");
    }

    #[test]
    fn test_bad_key_reported_before_inactive() {
        // An attacker probing a deactivated site must not learn that the
        // key material was otherwise correct.
        let err = verify_site_key(&site_key(false), "nv_wrong").unwrap_err();
        assert_eq!(err.kind(), "bad_key");
    }
}
