//! Netventory Sync - Replication Engine
//!
//! Storage traits, the in-memory reference implementation, and the
//! push/pull/duplicate-resolution machinery that makes records converge
//! between site and cloud databases. The PostgreSQL implementation of the
//! traits lives in netventory-api.

pub mod changelog;
pub mod dedupe;
pub mod memory;
pub mod merge;
pub mod pull;
pub mod push;
pub mod schema;
pub mod store;

pub use changelog::{ChangeLog, ChangeLogEvent};
pub use dedupe::{absorb_incoming_duplicate, resolve_duplicates};
pub use memory::InMemoryStore;
pub use merge::{decide, payload_matches, MergeDecision};
pub use pull::{process_pull, PullOptions};
pub use push::{PushContext, PushProcessor};
pub use schema::{
    declared_schema, run_self_check, table_spec, validate_schema, ColumnSpec, ColumnType,
    LiveColumn, SchemaInspector, TableSpec, FOREIGN_KEYS,
};
pub use store::{authenticate, verify_site_key, NewRecord, RecordStore, SiteRegistry};
