//! Crate-wide typed error kinds.
//!
//! Each layer gets its own variant set rather than one grab-bag enum, mirroring
//! how the storage and transport concerns carry genuinely different recovery
//! policies (§7 of the design notes): validation and quota errors are reported
//! straight back to the caller, version conflicts are retried internally by
//! [`crate::storage::Storage::transform`], and circuit-open/internal errors are
//! surfaced immediately.

use std::fmt;

use thiserror::Error;

/// A single path-qualified validation failure, e.g. `nodes[3].position.x`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// JSON-pointer-ish path to the offending field.
    pub path: String,
    /// Human-readable description of what's wrong.
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Errors raised by the spec validator (C1) in strict mode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("validation failed: {} issue(s)", issues.len())]
pub struct SpecError {
    /// All issues found; strict validation does not stop at the first one.
    pub issues: Vec<ValidationIssue>,
}

impl SpecError {
    /// Build a validation error from a single issue.
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ValidationIssue {
                path: path.into(),
                message: message.into(),
            }],
        }
    }
}

/// A resource-quota kind enforced by the quota guard (C2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaResource {
    /// Serialized spec byte size.
    SpecBytes,
    /// Node count.
    Nodes,
    /// Edge count.
    Edges,
    /// Group count.
    Groups,
    /// Sequence-message count.
    Messages,
    /// ER-relationship count.
    Relationships,
    /// Diagrams owned by a single user.
    DiagramsPerUser,
    /// `add_node` operations in one `change` batch.
    BatchAddNodes,
    /// `add_edge` operations in one `change` batch.
    BatchAddEdges,
}

impl QuotaResource {
    /// The stable machine-readable code used in the API error envelope.
    pub fn code(self) -> &'static str {
        match self {
            QuotaResource::SpecBytes => "SPEC_TOO_LARGE",
            QuotaResource::Nodes => "TOO_MANY_NODES",
            QuotaResource::Edges => "TOO_MANY_EDGES",
            QuotaResource::Groups => "TOO_MANY_GROUPS",
            QuotaResource::Messages => "TOO_MANY_MESSAGES",
            QuotaResource::Relationships => "TOO_MANY_RELATIONSHIPS",
            QuotaResource::DiagramsPerUser => "TOO_MANY_DIAGRAMS",
            QuotaResource::BatchAddNodes => "TOO_MANY_CHANGES",
            QuotaResource::BatchAddEdges => "TOO_MANY_CHANGES",
        }
    }
}

/// Raised when a write would exceed a configured quota (C2).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("quota exceeded for {resource:?}: {actual} > {limit}")]
pub struct QuotaError {
    /// Which resource was over budget.
    pub resource: QuotaResource,
    /// The configured limit.
    pub limit: usize,
    /// The actual count/size that triggered the rejection.
    pub actual: usize,
}

impl QuotaError {
    /// Stable machine-readable code for the API error envelope.
    pub fn code(&self) -> &'static str {
        self.resource.code()
    }
}

/// Errors surfaced by the storage engine (C4) and its circuit-breaker wrapper (C5).
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Spec (de)serialization failure.
    #[error("spec (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Filesystem failure (thumbnail I/O, data dir creation).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Strict spec validation rejected the write.
    #[error(transparent)]
    Validation(#[from] SpecError),
    /// A quota was exceeded.
    #[error(transparent)]
    Quota(#[from] QuotaError),
    /// Optimistic-concurrency write lost the race.
    #[error("version conflict, current version is {current_version}")]
    VersionConflict {
        /// The version the row is actually at right now.
        current_version: i64,
    },
    /// `Transform` exhausted its retry budget under contention.
    #[error("max retries ({attempts}) exceeded while transforming diagram")]
    MaxRetriesExceeded {
        /// Number of attempts made before giving up.
        attempts: u32,
    },
    /// A `userId` failed the hygiene regex; the call must not touch state.
    #[error("invalid user id")]
    InvalidUserId,
    /// The storage engine's circuit breaker is open.
    #[error("circuit open, retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Suggested backoff before retrying, in milliseconds.
        retry_after_ms: u64,
    },
}

impl StorageError {
    /// Stable machine-readable code for the API error envelope (§6.3).
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::Validation(_) => "VALIDATION_ERROR",
            StorageError::Quota(q) => q.code(),
            StorageError::VersionConflict { .. } => "VERSION_CONFLICT",
            StorageError::MaxRetriesExceeded { .. } => "VERSION_CONFLICT",
            StorageError::InvalidUserId => "INVALID_INPUT",
            StorageError::CircuitOpen { .. } => "SERVICE_UNAVAILABLE",
            StorageError::Sqlite(_) | StorageError::Json(_) | StorageError::Io(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result alias used throughout the storage layer.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised while decoding/validating a hub message (C6) or adapting a
/// transport frame (C8).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The frame exceeded `MAX_MESSAGE_SIZE`.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The frame was not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// The frame was valid JSON but did not match any known message schema.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// A `change` batch's `DiagramChange` payloads failed schema validation.
    #[error("invalid change data: {0}")]
    InvalidChangeData(String),
    /// A `change` batch exceeded the per-batch add quotas.
    #[error(transparent)]
    TooManyChanges(#[from] QuotaError),
}

impl TransportError {
    /// The hub error code (§6.2) corresponding to this failure.
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            TransportError::InvalidJson(_) => "INVALID_JSON",
            TransportError::InvalidMessage(_) => "INVALID_MESSAGE",
            TransportError::InvalidChangeData(_) => "INVALID_CHANGE_DATA",
            TransportError::TooManyChanges(_) => "TOO_MANY_CHANGES",
        }
    }
}

/// Errors raised by the room hub (C7) that are not expressed as a typed
/// `error` frame sent back to one client (those are handled inline).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The connection has not called `Register` yet.
    #[error("connection not registered")]
    NotRegistered,
    /// The connection is not currently a member of any room.
    #[error("connection not in a room")]
    NotInRoom,
    /// The target room is at `MAX_PARTICIPANTS` capacity.
    #[error("room is full")]
    RoomFull,
}

impl HubError {
    /// The hub error code (§6.2) corresponding to this failure.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::NotRegistered => "NOT_REGISTERED",
            HubError::NotInRoom => "NOT_IN_ROOM",
            HubError::RoomFull => "ROOM_FULL",
        }
    }
}
