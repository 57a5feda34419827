//! Error types for the WAL and transaction subsystem.
//!
//! A single crate-level enum using `thiserror`. The writer thread never
//! propagates errors across the bus as panics or out-of-band traps: it turns
//! every failure into a per-request `res = -1` and the transaction thread
//! converts that into [`Error::WalIo`]. User errors (API misuse) are reported
//! to the caller and leave state unchanged where that is safe.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::common::TransactionId;

/// Result type alias for WAL and transaction operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // =========================================================================
    // Transaction state errors
    // =========================================================================
    /// A transaction is already active on this task.
    #[error("Operation is not permitted when there is an active transaction")]
    ActiveTransaction,

    /// No transaction is active on this task.
    #[error("No active transaction")]
    NoActiveTransaction,

    /// Too many nested sub-statements.
    #[error("Can not execute a nested statement: nesting limit reached")]
    SubStmtMax,

    /// A second storage engine was bound to a multi-statement transaction.
    #[error("A multi-statement transaction can not use multiple storage engines")]
    CrossEngineTransaction,

    /// A statement was attempted on an already prepared transaction.
    #[error("Transaction {0} is prepared and can not be changed")]
    ChangePrepared(TransactionId),

    /// `prepare` called twice on the same two-phase transaction.
    #[error("Transaction {0} is already prepared")]
    AlreadyPrepared(TransactionId),

    /// `commit` issued from inside a sub-statement.
    #[error("Commit is not allowed in a sub-statement")]
    CommitInSubStmt,

    /// `rollback` issued from inside a sub-statement.
    #[error("Rollback is not allowed in a sub-statement")]
    RollbackInSubStmt,

    /// `commit` on a two-phase transaction that was never prepared.
    #[error("Two-phase transaction must be prepared prior to commit")]
    CommitBeforePrepare,

    /// The requested operation is not supported in this context.
    #[error("{0} does not support {1}")]
    Unsupported(String, String),

    // =========================================================================
    // Write-ahead log errors
    // =========================================================================
    /// The writer failed to persist the request; the transaction has been
    /// rolled back as part of a cascading rollback.
    #[error("Failed to write to disk")]
    WalIo,

    /// A frame failed its checksum or structural validation.
    #[error("Corrupt frame in {file} at offset {offset}")]
    CorruptFrame { file: PathBuf, offset: u64 },

    /// A log file header could not be parsed.
    #[error("Invalid log file header in {file}: {reason}")]
    InvalidHeader { file: PathBuf, reason: String },

    /// A log file belongs to a different server.
    #[error("Log file {file} has server UUID {found}, expected {expected}")]
    ServerUuidMismatch {
        file: PathBuf,
        found: uuid::Uuid,
        expected: uuid::Uuid,
    },

    /// A gap between consecutive log files (reader side only).
    #[error("Missing log rows between signatures {from} and {to}")]
    Gap { from: i64, to: i64 },

    /// The vector clock was asked to move backwards.
    #[error("Vector clock component {replica_id} can not go from {from} to {to}")]
    VClockOrder { replica_id: u32, from: i64, to: i64 },

    // =========================================================================
    // Wrapped lower-level failures
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Codec(String),
}

impl Error {
    /// True for errors raised by the disk path, as opposed to API misuse.
    pub fn is_wal_failure(&self) -> bool {
        matches!(self, Error::WalIo | Error::Io(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
