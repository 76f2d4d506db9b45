//! Error types for the sync core.

use thiserror::Error;
use uuid::Uuid;

use crate::enums::ModelKind;

/// Site-key authentication failures. Each variant maps to a distinct
/// failure kind surfaced as 401 by the API layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unknown site {site_id}")]
    UnknownSite { site_id: i64 },

    #[error("bad api key for site {site_id}")]
    BadKey { site_id: i64 },

    #[error("site {site_id} is inactive")]
    Inactive { site_id: i64 },
}

impl AuthError {
    /// Stable failure kind string for logs and error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::UnknownSite { .. } => "unknown_site",
            AuthError::BadKey { .. } => "bad_key",
            AuthError::Inactive { .. } => "inactive",
        }
    }
}

/// Request validation failures. One of these aborts the whole batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("required field missing: {field}")]
    MissingField { field: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("unknown model kind: {name}")]
    UnknownModel { name: String },

    #[error("malformed record payload: {reason}")]
    InvalidPayload { reason: String },
}

/// Storage layer errors. `Transient` failures are retried by the request
/// handler; everything else is permanent for the current request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{model} row {id} not found")]
    NotFound { model: ModelKind, id: i64 },

    #[error("{model} row with uuid {uuid} not found")]
    UuidNotFound { model: ModelKind, uuid: Uuid },

    #[error("constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },

    #[error("transient database failure: {reason}")]
    Transient { reason: String },

    #[error("storage backend error: {reason}")]
    Backend { reason: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },
}

impl StoreError {
    /// Whether the operation is worth retrying on a fresh transaction.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

/// Umbrella error for sync operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type alias used throughout the sync core.
pub type SyncResult<T> = Result<T, SyncError>;
