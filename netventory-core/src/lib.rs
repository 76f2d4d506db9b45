//! Netventory Core - Sync Data Model
//!
//! Pure data structures with no behavior. All other crates depend on this.
//! This crate contains ONLY data types - no I/O, no business logic.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod entities;
pub mod enums;
pub mod error;
pub mod natural_key;
pub mod record;

pub use entities::*;
pub use enums::*;
pub use error::*;
pub use natural_key::*;
pub use record::*;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone. All sync timestamps are UTC.
pub type Timestamp = DateTime<Utc>;

/// Generate a new record UUID (v4). The UUID is the canonical cross-site
/// identity of a row; the local `id` is an optimization.
pub fn new_record_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Reserved site id for the virtual warehouse. Devices with no real site
/// default to it; locations may never reference it.
pub const VIRTUAL_WAREHOUSE_SITE_ID: i64 = 100;

// ============================================================================
// ERROR HASHING
// ============================================================================

/// Compute the deduplication hash for a `sync_errors` row: hex-encoded
/// SHA-256 of the error trace. Identical failures collapse to one row.
pub fn compute_error_hash(trace: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(trace.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_hash_is_stable() {
        let a = compute_error_hash("duplicate key value violates unique constraint");
        let b = compute_error_hash("duplicate key value violates unique constraint");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_error_hash_differs_per_trace() {
        assert_ne!(compute_error_hash("a"), compute_error_hash("b"));
    }

    #[test]
    fn test_record_uuids_are_unique() {
        assert_ne!(new_record_uuid(), new_record_uuid());
    }
}
