use thiserror::Error;

use crate::types::{BranchId, DurableLockingId, LockType, ObjectId, SessionId, Timestamp, ViewId};

/// Convenience alias for `Result<T, ArborError>`.
pub type ArborResult<T> = Result<T, ArborError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`: the request itself is wrong (dangling reference, bad branch name)
/// - `Retryable`: a concurrent commit won; re-read and retry
/// - `Transient`: timeout or saturation; retry after back-off
/// - `InternalBug`: should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum ArborError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Branch error: {0}")]
    Branch(#[from] BranchError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Timestamp error: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("Commit failed: {0}")]
    Commit(#[from] CommitError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Read rejected: {0}")]
    ReadRejected(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Persistence backend and revision bookkeeping errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("Branch not found: {0}")]
    BranchNotFound(BranchId),

    #[error("Invalid delta for {id}: {reason}")]
    InvalidDelta { id: ObjectId, reason: String },

    #[error("Lock area already exists: {0}")]
    LockAreaAlreadyExists(DurableLockingId),

    #[error("Lock area not found: {0}")]
    LockAreaNotFound(DurableLockingId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Branch tree errors.
#[derive(Error, Debug)]
pub enum BranchError {
    #[error("Branch not found: {0}")]
    NotFound(BranchId),

    #[error("Branch name already used under the same parent: {0}")]
    DuplicateName(String),

    #[error("Invalid branch name: {0:?}")]
    InvalidName(String),

    #[error("Base {base} precedes creation of parent {parent} at {parent_created}")]
    BaseBeforeParent {
        parent: BranchId,
        base: Timestamp,
        parent_created: Timestamp,
    },

    #[error("The main branch cannot be renamed")]
    RenameMain,
}

/// Lock table and durable locking errors.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("{lock_type} lock on {key} is not held by {holder}")]
    NotHeld {
        lock_type: LockType,
        key: String,
        holder: String,
    },

    #[error("Object {0} not found (possibly detached)")]
    ObjectNotFound(ObjectId),

    #[error("Durable view is already open: {0}")]
    AreaAlreadyOpen(DurableLockingId),

    #[error("Durable read-only state does not match the request: {0}")]
    ReadOnlyMismatch(DurableLockingId),

    #[error("Read-only view {0} cannot take write or option locks")]
    ReadOnlyView(ViewId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Timestamp authority errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("Timestamp issuance cancelled")]
    Cancelled,

    #[error("Override {requested} is not after last issued {last_issued}")]
    OverrideNotMonotonic {
        requested: Timestamp,
        last_issued: Timestamp,
    },

    #[error("Timestamp {0} is in the future")]
    InFuture(Timestamp),

    #[error("Timestamp {requested} is before repository creation at {created}")]
    BeforeCreation {
        requested: Timestamp,
        created: Timestamp,
    },
}

/// Commit pipeline failures. `Display` is the rollback message handed to the client.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("Could not lock all objects within {timeout_ms}ms")]
    LockTimeout { timeout_ms: u64 },

    #[error("Attempt by {view} to modify historical revision: {reason}")]
    ConcurrentModification { view: ViewId, reason: String },

    #[error("Referential integrity violated: {0}")]
    ReferentialIntegrityViolation(String),

    #[error("Containment cycle detected: {0}")]
    ContainmentCycle(String),

    #[error("Commit vetoed: {0}")]
    Vetoed(String),

    #[error("Invalid id mapping: {0}")]
    InvalidIdMapping(String),

    #[error("Invalid commit state transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Commit rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Timestamp(#[from] TimestampError),

    #[error("Storage failure: {0}")]
    Storage(#[source] StorageError),
}

impl CommitError {
    /// Human-readable rollback message.
    pub fn rollback_message(&self) -> String {
        self.to_string()
    }
}

/// Session and view registry errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("View not found: {0}")]
    ViewNotFound(ViewId),

    #[error("View {0} is read-only")]
    ReadOnlyView(ViewId),
}

/// Query executor errors.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Query queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Query executor is shut down")]
    ExecutorShutdown,

    #[error("Unknown class: {0}")]
    UnknownClass(String),

    #[error("Query failed: {0}")]
    Failed(String),
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── ArborError classification ───────────────────────────────────────────────

impl ArborError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArborError::Commit(e) => e.kind(),
            ArborError::Storage(StorageError::ConcurrentModification(_)) => ErrorKind::Retryable,
            ArborError::Storage(StorageError::Io(_)) => ErrorKind::Transient,
            ArborError::Storage(StorageError::Backend(_)) => ErrorKind::Transient,
            ArborError::Storage(StorageError::ObjectNotFound(_))
            | ArborError::Storage(StorageError::BranchNotFound(_))
            | ArborError::Storage(StorageError::LockAreaNotFound(_))
            | ArborError::Storage(StorageError::LockAreaAlreadyExists(_))
            | ArborError::Storage(StorageError::InvalidDelta { .. }) => ErrorKind::UserError,
            ArborError::Branch(_) => ErrorKind::UserError,
            ArborError::Lock(LockError::Storage(_)) => ErrorKind::Transient,
            ArborError::Lock(_) => ErrorKind::UserError,
            ArborError::Timestamp(TimestampError::Cancelled) => ErrorKind::Transient,
            ArborError::Timestamp(_) => ErrorKind::UserError,
            ArborError::Session(_) => ErrorKind::UserError,
            ArborError::Query(QueryError::QueueFull { .. }) => ErrorKind::Transient,
            ArborError::Query(QueryError::UnknownClass(_)) => ErrorKind::UserError,
            ArborError::InvalidArgument(_) | ArborError::ReadRejected(_) => ErrorKind::UserError,
            ArborError::Config(_) => ErrorKind::UserError,
            _ => ErrorKind::InternalBug,
        }
    }

    /// Returns true if the client should retry this operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if this is a transient resource/timeout error.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Short error code used in logs and metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            ArborError::Storage(_) => "STORAGE",
            ArborError::Branch(_) => "BRANCH",
            ArborError::Lock(_) => "LOCK",
            ArborError::Timestamp(_) => "TIMESTAMP",
            ArborError::Commit(e) => e.reason_code(),
            ArborError::Session(_) => "SESSION",
            ArborError::Query(_) => "QUERY",
            ArborError::Config(_) => "CONFIG",
            ArborError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ArborError::ReadRejected(_) => "READ_REJECTED",
            ArborError::Internal(_) => "INTERNAL",
        }
    }
}

impl CommitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommitError::LockTimeout { .. } => ErrorKind::Transient,
            CommitError::ConcurrentModification { .. } => ErrorKind::Retryable,
            CommitError::ReferentialIntegrityViolation(_)
            | CommitError::ContainmentCycle(_)
            | CommitError::Vetoed(_)
            | CommitError::InvalidIdMapping(_)
            | CommitError::Rejected(_) => ErrorKind::UserError,
            CommitError::Timestamp(TimestampError::Cancelled) => ErrorKind::Transient,
            CommitError::Timestamp(_) => ErrorKind::UserError,
            CommitError::Storage(StorageError::ConcurrentModification(_)) => ErrorKind::Retryable,
            CommitError::Storage(_) => ErrorKind::Transient,
            CommitError::InvalidTransition { .. } => ErrorKind::InternalBug,
        }
    }

    /// Stable label for the rollback reason, used as a metric label.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CommitError::LockTimeout { .. } => "lock_timeout",
            CommitError::ConcurrentModification { .. } => "concurrent_modification",
            CommitError::ReferentialIntegrityViolation(_) => "referential_integrity",
            CommitError::ContainmentCycle(_) => "containment_cycle",
            CommitError::Vetoed(_) => "vetoed",
            CommitError::InvalidIdMapping(_) => "invalid_id_mapping",
            CommitError::InvalidTransition { .. } => "invalid_transition",
            CommitError::Rejected(_) => "rejected",
            CommitError::Timestamp(_) => "timestamp",
            CommitError::Storage(_) => "storage_failure",
        }
    }
}
