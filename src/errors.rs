//! Typed error hierarchy for cardsync.
//!
//! Three top-level types cover the three layers:
//! - `StoreError`: failures reported by the remote store (code + message)
//! - `SyncError`: failures surfaced by entity hooks and the autosave writer
//! - `UploadError`: client-side attachment checks and blob store failures

use thiserror::Error;

/// Postgres-style code for "relation does not exist". The only code the sync
/// layer branches on: it marks an optional feature table as unprovisioned.
pub const MISSING_RELATION_CODE: &str = "42P01";

/// Code used when a row addressed by id does not exist.
pub const ROW_NOT_FOUND_CODE: &str = "PGRST116";

/// Code used for transport-level failures (connection reset, timeout).
pub const UNAVAILABLE_CODE: &str = "unavailable";

/// Structured error returned by a remote store operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct StoreError {
    pub code: String,
    pub message: String,
}

impl StoreError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn missing_relation(table: &str) -> Self {
        Self::new(
            MISSING_RELATION_CODE,
            format!("relation \"{}\" does not exist", table),
        )
    }

    pub fn row_not_found(table: &str, id: &str) -> Self {
        Self::new(ROW_NOT_FOUND_CODE, format!("no row {} in {}", id, table))
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(UNAVAILABLE_CODE, message)
    }

    /// True when the error signals an unprovisioned optional table.
    pub fn is_missing_relation(&self) -> bool {
        self.code == MISSING_RELATION_CODE || self.message.contains("does not exist")
    }

    /// True for failures worth retrying: the request never reached a
    /// verdict from the store.
    pub fn is_transient(&self) -> bool {
        self.code == UNAVAILABLE_CODE
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::new("internal", format!("{:#}", err))
    }
}

/// A single field-level validation failure, shown next to the offending input.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by the sync primitives. Hooks never panic or propagate
/// these past their boundary except as a returned value; the same message
/// is mirrored into the cached `error` field.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The hook has no key yet (e.g. the applicant id is still being created).
    #[error("entity key is not set yet")]
    NotReady,

    /// The caller asked for fields the entity does not have.
    #[error("patch touches fields outside the entity shape: {}", fields.join(", "))]
    InvalidPatch { fields: Vec<String> },

    /// User input rejected before any network call.
    #[error("validation failed on {} field(s)", .0.len())]
    Validation(Vec<FieldError>),

    /// The remote store rejected the operation.
    #[error("remote store error: {0}")]
    Remote(#[from] StoreError),

    /// The target row vanished from the local cache.
    #[error("row {id} is not in the local cache")]
    UnknownRow { id: String },

    /// A row could not be converted to or from the entity type.
    #[error("row does not match entity shape: {0}")]
    Shape(String),

    /// The hook was unmounted while the operation was in flight.
    #[error("hook was unmounted")]
    Unmounted,

    /// The key changed while the request was in flight; the response was dropped.
    #[error("key changed while the request was in flight")]
    Stale,
}

impl SyncError {
    /// True for the "not ready yet" condition rather than a real failure.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, SyncError::NotReady)
    }

    /// True when the failure belongs to the caller's code, not the user or the network.
    pub fn is_invalid_usage(&self) -> bool {
        matches!(self, SyncError::InvalidPatch { .. } | SyncError::Shape(_))
    }
}

/// Errors from the attachment upload path.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file type '{content_type}' is not allowed")]
    TypeNotAllowed { content_type: String },

    #[error("file is {size} bytes, the limit is {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("file name is empty or contains a path separator")]
    InvalidFileName,

    #[error("blob path '{0}' escapes the blob root")]
    InvalidPath(String),

    #[error("signed URL has expired")]
    Expired,

    #[error("signed URL signature does not match")]
    BadSignature,

    #[error("signing secret cannot key an HMAC")]
    SigningKey,

    #[error("blob store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sync(#[from] SyncError),
}
