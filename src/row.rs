//! Log row: the atomic unit of logging.
//!
//! A row carries the operation kind, the originating replica, the log
//! sequence number assigned on submission, a server-clock timestamp, the
//! two-phase transaction identifiers, and an ordered list of body byte
//! slices. Rows are constructed by the transaction manager, owned by the
//! submitting request until the writer consumes them, and borrowed read-only
//! during the disk write.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::{CoordinatorId, Lsn, ReplicaId, TransactionId};
use crate::error::Result;

/// Operation kind recorded in a row header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Replace,
    Update,
    Upsert,
    Delete,
    /// Durable intent marker of a two-phase transaction.
    Prepare,
    /// Durable outcome marker: the prepared transaction committed.
    Commit,
    /// Durable outcome marker: the prepared transaction was aborted.
    Rollback,
}

impl OpKind {
    /// True for the two-phase bookkeeping markers, which carry no payload.
    pub fn is_marker(&self) -> bool {
        matches!(self, OpKind::Prepare | OpKind::Commit | OpKind::Rollback)
    }
}

/// A single log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub op: OpKind,
    /// Originating replica; 0 until the LSN assigner fills it.
    pub replica_id: ReplicaId,
    /// Log sequence number; 0 until assigned at submission.
    pub lsn: Lsn,
    /// Server clock, unix microseconds; stamped at submission.
    pub tm: u64,
    /// Two-phase transaction id; 0 for one-phase transactions.
    pub tx_id: TransactionId,
    /// Two-phase coordinator id; 0 for one-phase transactions.
    pub coordinator_id: CoordinatorId,
    /// Ordered body byte slices, operation specific.
    pub bodies: Vec<Bytes>,
}

impl Row {
    /// Creates a row with identifiers unassigned. The transaction manager
    /// fills `tx_id`/`coordinator_id`; the LSN assigner fills
    /// `replica_id`/`lsn`/`tm` at submission time.
    pub fn new(op: OpKind, bodies: Vec<Bytes>) -> Self {
        Self {
            op,
            replica_id: 0,
            lsn: 0,
            tm: 0,
            tx_id: 0,
            coordinator_id: 0,
            bodies,
        }
    }

    /// Builds a PREPARE/COMMIT/ROLLBACK marker row for a two-phase
    /// transaction. Marker rows carry an empty body so that readers can
    /// treat every row uniformly.
    pub fn two_phase_marker(
        op: OpKind,
        tx_id: TransactionId,
        coordinator_id: CoordinatorId,
    ) -> Self {
        debug_assert!(op.is_marker());
        Self {
            op,
            replica_id: 0,
            lsn: 0,
            tm: 0,
            tx_id,
            coordinator_id,
            bodies: vec![Bytes::new()],
        }
    }

    /// Serializes the row for inclusion in a frame payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes one row from the front of `buf`, returning the row and
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let row: Row = bincode::deserialize(buf)?;
        let consumed = bincode::serialized_size(&row)? as usize;
        Ok((row, consumed))
    }
}

/// Current server clock in unix microseconds.
pub fn server_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
