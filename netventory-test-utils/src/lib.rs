//! Netventory Test Utilities
//!
//! Centralized test infrastructure for the Netventory workspace:
//! - Builders for incoming and stored sync records
//! - Seeded in-memory stores with provisioned site keys
//! - Proptest strategies for payloads and version sequences

// Re-export the in-memory store from its source crate
pub use netventory_sync::InMemoryStore;

// Re-export core types for convenience
pub use netventory_core::{
    CheckIn, ModelKind, Payload, PullCursor, PullRequest, PushOutcome, PushRequest, SiteKey,
    StoredRecord, SyncOrigin, SyncPeer, SyncRecord, Timestamp,
};

use chrono::Utc;
use proptest::prelude::*;
use serde_json::{json, Value};
use uuid::Uuid;

/// Site id used by fixtures and tests.
pub const TEST_SITE_ID: i64 = 7;

/// Api key provisioned for [`TEST_SITE_ID`] by [`seeded_store`].
pub const TEST_API_KEY: &str = "nv_testkey_0123456789abcdef";

// ============================================================================
// BUILDERS
// ============================================================================

/// Fluent builder for incoming push records.
#[derive(Debug, Clone)]
pub struct SyncRecordBuilder {
    record: SyncRecord,
}

impl SyncRecordBuilder {
    pub fn new(model: ModelKind) -> Self {
        Self {
            record: SyncRecord {
                model,
                id: None,
                uuid: None,
                version: 1,
                created_at: None,
                updated_at: None,
                deleted_at: None,
                fields: Payload::new(),
            },
        }
    }

    pub fn id(mut self, id: i64) -> Self {
        self.record.id = Some(id);
        self
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.record.uuid = Some(uuid);
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.record.version = version;
        self
    }

    pub fn deleted_at(mut self, at: Timestamp) -> Self {
        self.record.deleted_at = Some(at);
        self
    }

    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.record.fields.insert(name.to_string(), value);
        self
    }

    pub fn build(self) -> SyncRecord {
        self.record
    }
}

/// Incoming user record with the given email.
pub fn user_record(id: i64, email: &str, version: i64) -> SyncRecord {
    SyncRecordBuilder::new(ModelKind::Users)
        .id(id)
        .version(version)
        .field("email", json!(email))
        .field("is_active", json!(true))
        .build()
}

/// Incoming device record with the usual identifying fields.
pub fn device_record(id: i64, hostname: &str, ip: &str, mac: &str, version: i64) -> SyncRecord {
    SyncRecordBuilder::new(ModelKind::Devices)
        .id(id)
        .version(version)
        .field("hostname", json!(hostname))
        .field("ip", json!(ip))
        .field("mac", json!(mac))
        .field("manufacturer", json!("cisco"))
        .field("device_type_id", json!(1))
        .field("site_id", json!(TEST_SITE_ID))
        .build()
}

/// A stored row ready for seeding, with sensible sync-column defaults.
pub fn stored_record(model: ModelKind, id: i64, version: i64, fields: Value) -> StoredRecord {
    let now = Utc::now();
    StoredRecord {
        model,
        id,
        uuid: Uuid::new_v4(),
        version,
        created_at: now,
        updated_at: now,
        deleted_at: None,
        conflict_data: None,
        sync_state: None,
        fields: fields.as_object().cloned().unwrap_or_default(),
    }
}

/// Site key fixture for [`TEST_SITE_ID`].
pub fn test_site_key() -> SiteKey {
    SiteKey {
        site_id: TEST_SITE_ID,
        site_name: "branch-7".to_string(),
        api_key: TEST_API_KEY.to_string(),
        active: true,
        created_at: Utc::now(),
        last_used_at: None,
    }
}

/// An in-memory store with the test site key provisioned.
pub fn seeded_store() -> InMemoryStore {
    let store = InMemoryStore::new();
    store.seed_site_key(test_site_key());
    store
}

// ============================================================================
// PROPTEST STRATEGIES
// ============================================================================

/// Any sync-managed model kind.
pub fn arb_model_kind() -> impl Strategy<Value = ModelKind> {
    proptest::sample::select(ModelKind::ALL.to_vec())
}

/// A short lowercase identifier usable as hostname, tag name, etc.
pub fn arb_identifier() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{2,15}"
}

/// A plausible email address.
pub fn arb_email() -> impl Strategy<Value = String> {
    ("[a-z]{2,10}", "[a-z]{2,8}").prop_map(|(user, host)| format!("{}@{}.example", user, host))
}

/// A strictly increasing version sequence of the given length.
pub fn arb_version_chain(len: usize) -> impl Strategy<Value = Vec<i64>> {
    proptest::collection::vec(1i64..20, len).prop_map(|increments| {
        let mut version = 0;
        increments
            .into_iter()
            .map(|step| {
                version += step;
                version
            })
            .collect()
    })
}
