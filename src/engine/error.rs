use ulid::Ulid;

use crate::model::Timestamp;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid identifier: {0:?}")]
    InvalidId(String),
    #[error("invalid name: {0}")]
    InvalidName(&'static str),
    #[error("invalid interval [{start}, {end}): start must be before end and both within range")]
    InvalidInterval { start: Timestamp, end: Timestamp },
    #[error("resource not found: {0}")]
    ResourceNotFound(Ulid),
    #[error("reservation not found: {0}")]
    ReservationNotFound(Ulid),
    #[error("resource name already in use: {0}")]
    DuplicateName(String),
    #[error("resource {resource_id} unavailable: overlaps reservation {conflicting}")]
    ResourceUnavailable { resource_id: Ulid, conflicting: Ulid },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

/// Coarse classification callers use to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Client fault; never retried.
    InvalidInput,
    NotFound,
    /// Uniqueness rejection.
    Conflict,
    /// Overlap rejection; a business outcome, not a fault.
    Unavailable,
    /// Transient; safe to retry with backoff.
    StorageFailure,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidId(_)
            | EngineError::InvalidName(_)
            | EngineError::InvalidInterval { .. }
            | EngineError::LimitExceeded(_) => ErrorKind::InvalidInput,
            EngineError::ResourceNotFound(_) | EngineError::ReservationNotFound(_) => ErrorKind::NotFound,
            EngineError::DuplicateName(_) => ErrorKind::Conflict,
            EngineError::ResourceUnavailable { .. } => ErrorKind::Unavailable,
            EngineError::StorageFailure(_) => ErrorKind::StorageFailure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StorageFailure
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation { field: "resources.name", value } => EngineError::DuplicateName(value),
            StoreError::ForeignKeyViolation(id) => EngineError::ResourceNotFound(id),
            // Generated ids never collide; a clash here means the store is inconsistent.
            other => EngineError::StorageFailure(other.to_string()),
        }
    }
}
