// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are grouped by what the caller has to do about them. Collaborator
//! failures (remote/local store calls) arrive as [`StoreError`] and are
//! wrapped in [`ReplicationError::Store`].
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Connection` | No | Bad credentials, unreachable host |
//! | `EmptyPassphrase` | No | Encryption enabled without a passphrase |
//! | `PendingNotice` | No | A version-up notice must be acknowledged first |
//! | `Incompatible` | No | Remote protocol too new, corrupted, or chunk formats disjoint |
//! | `NodeLocked` | No | Remote rebuilt by another node; this node not accepted |
//! | `NodeCleaned` | No | Remote cleaned up; acknowledgement required |
//! | `Mismatched` | No | Configuration fingerprints disagree |
//! | `AlreadyRunning` | Yes | Another session is open on this replicator |
//! | `Busy` | Yes | Admission controller did not grant a permit in time |
//! | `RetryExhausted` | No | Batch parameters cannot shrink any further |
//! | `PayloadTooLarge` | No | Remote rejected a request body as too large |
//! | `Denied` | No | Authorization failure during replication |
//! | `Cancelled` | No | Session was cancelled before it settled |
//! | `MilestoneMissing` | No | The milestone document does not exist |
//! | `MissingChunks` | No | Requested chunks absent on the remote |
//! | `Store` | Depends | See [`StoreError::is_retryable()`] |
//! | `Config` | No | Configuration invalid |
//! | `Internal` | No | Unexpected internal error |
//!
//! Every variant is `Clone`: coalesced operations hand one result to many
//! callers.

use crate::model::TweakValues;
use thiserror::Error;

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Result type for collaborator (store) calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure reported by a remote or local store collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The document does not exist (or was deleted).
    #[error("not found: {0}")]
    NotFound(String),

    /// A write was based on a stale revision.
    #[error("document update conflict: {0}")]
    Conflict(String),

    /// The store answered with an HTTP-like error status.
    #[error("status {status}: {message}")]
    Status { status: u16, message: String },

    /// Anything else (transport failure, malformed response).
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Check if this is a missing-document error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Status { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Check if this is a stale-revision error.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Status { status, .. } => *status == 409,
            _ => false,
        }
    }

    /// Check if retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound(_) => false,
            Self::Conflict(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 409 || *status == 429,
            Self::Other(_) => true,
        }
    }
}

/// Errors that can occur while replicating.
#[derive(Error, Debug, Clone)]
pub enum ReplicationError {
    /// Could not open the remote database.
    #[error("could not connect to {uri}: {message}")]
    Connection { uri: String, message: String },

    /// Encryption is enabled but the passphrase is empty and not permitted.
    #[error("Empty passphrases cannot be used without explicit permission")]
    EmptyPassphrase,

    /// The settings carry a version-up notice the operator has not read.
    #[error("pending notice must be acknowledged: {0}")]
    PendingNotice(String),

    /// Remote protocol or chunk format is not understood by this engine.
    #[error("incompatible remote database: {0}")]
    Incompatible(String),

    /// Remote is locked and this node is not among the accepted nodes.
    #[error("remote database has been rebuilt since this node last synchronized; fetch or unlock required")]
    NodeLocked,

    /// Remote was cleaned up and this node has not acknowledged it.
    #[error("remote database has been cleaned up; fetch or unlock required")]
    NodeCleaned,

    /// Configuration fingerprints of two nodes disagree.
    ///
    /// Carries the first remote fingerprint that differed.
    #[error("configuration mismatch between nodes")]
    Mismatched { remote: Box<TweakValues> },

    /// A replication session is already open on this replicator.
    #[error("another replication is in progress")]
    AlreadyRunning,

    /// The admission controller refused within its timeout.
    #[error("replication stopped for busy")]
    Busy,

    /// Transient failures persisted down to the smallest batch parameters.
    #[error("retry exhausted at batch_size={batch_size}, batches_limit={batches_limit}")]
    RetryExhausted { batch_size: u32, batches_limit: u32 },

    /// Remote rejected a request as too large.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Remote denied a document write or read.
    #[error("replication denied: {0}")]
    Denied(String),

    /// The session was cancelled before it completed.
    #[error("replication cancelled")]
    Cancelled,

    /// The milestone document is absent where it must exist.
    #[error("could not retrieve remote milestone")]
    MilestoneMissing,

    /// Some requested chunks do not exist on the remote.
    #[error("chunks missing on remote: {}", .0.join(","))]
    MissingChunks(Vec<String>),

    /// A store call failed.
    #[error("store error ({operation}): {source}")]
    Store {
        operation: String,
        #[source]
        source: StoreError,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Wrap a store failure with the operation that produced it.
    pub fn store(operation: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            operation: operation.into(),
            source,
        }
    }

    /// Check if this error is retryable by simply re-invoking later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AlreadyRunning | Self::Busy => true,
            Self::Store { source, .. } => source.is_retryable(),
            Self::Connection { .. }
            | Self::EmptyPassphrase
            | Self::PendingNotice(_)
            | Self::Incompatible(_)
            | Self::NodeLocked
            | Self::NodeCleaned
            | Self::Mismatched { .. }
            | Self::RetryExhausted { .. }
            | Self::PayloadTooLarge(_)
            | Self::Denied(_)
            | Self::Cancelled
            | Self::MilestoneMissing
            | Self::MissingChunks(_)
            | Self::Config(_)
            | Self::Internal(_) => false,
        }
    }

    /// Check if this error blocks transfer until an operator acts
    /// (unlock, reset tweak values, upgrade).
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Self::Incompatible(_)
                | Self::NodeLocked
                | Self::NodeCleaned
                | Self::Mismatched { .. }
                | Self::PendingNotice(_)
        )
    }
}

impl From<StoreError> for ReplicationError {
    fn from(e: StoreError) -> Self {
        Self::store("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_not_found() {
        assert!(StoreError::NotFound("x".into()).is_not_found());
        assert!(StoreError::Status {
            status: 404,
            message: "missing".into()
        }
        .is_not_found());
        assert!(!StoreError::Other("boom".into()).is_not_found());
    }

    #[test]
    fn test_store_error_conflict() {
        assert!(StoreError::Conflict("rev".into()).is_conflict());
        assert!(StoreError::Status {
            status: 409,
            message: "conflict".into()
        }
        .is_conflict());
        assert!(!StoreError::NotFound("x".into()).is_conflict());
    }

    #[test]
    fn test_store_error_retryable() {
        assert!(StoreError::Status {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!StoreError::Status {
            status: 401,
            message: "unauthorized".into()
        }
        .is_retryable());
        assert!(!StoreError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_busy_and_running_are_retryable() {
        assert!(ReplicationError::Busy.is_retryable());
        assert!(ReplicationError::AlreadyRunning.is_retryable());
    }

    #[test]
    fn test_incompatibility_not_retryable() {
        for err in [
            ReplicationError::NodeLocked,
            ReplicationError::NodeCleaned,
            ReplicationError::Incompatible("newer".into()),
            ReplicationError::Mismatched {
                remote: Box::default(),
            },
        ] {
            assert!(!err.is_retryable());
            assert!(err.requires_operator());
        }
    }

    #[test]
    fn test_store_wrapping_delegates_retry() {
        let err = ReplicationError::store("put milestone", StoreError::Conflict("stale".into()));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("put milestone"));

        let err: ReplicationError = StoreError::NotFound("doc".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_empty_passphrase_message() {
        assert_eq!(
            ReplicationError::EmptyPassphrase.to_string(),
            "Empty passphrases cannot be used without explicit permission"
        );
    }

    #[test]
    fn test_retry_exhausted_formatting() {
        let err = ReplicationError::RetryExhausted {
            batch_size: 5,
            batches_limit: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("batch_size=5"));
        assert!(msg.contains("batches_limit=5"));
    }

    #[test]
    fn test_missing_chunks_formatting() {
        let err = ReplicationError::MissingChunks(vec!["h:a".into(), "h:b".into()]);
        assert_eq!(err.to_string(), "chunks missing on remote: h:a,h:b");
    }
}
