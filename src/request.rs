//! DML request: the input of `commit_statement`.
//!
//! A request describes one mutation against a space. The transaction manager
//! turns it into a redo [`Row`] at commit-statement time, reusing a header
//! row the request may already carry (e.g. one received from a replication
//! peer) and encoding the body through the engine-neutral encoder otherwise.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::row::{OpKind, Row};

/// A single update operation inside an UPDATE/UPSERT request.
///
/// `op` is the operation symbol (`=`, `+`, `-`, `!`, `#`, `:`, ...); the
/// splice operation `:` carries an extra string position that is numbered in
/// the same base as field numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOp {
    pub op: u8,
    pub field_no: i64,
    pub splice_pos: Option<i64>,
    pub arg: Bytes,
}

/// Operation to apply and the data it needs.
#[derive(Debug, Clone)]
pub struct DmlRequest {
    pub op: OpKind,
    pub space_id: u32,
    /// New tuple for INSERT/REPLACE/UPSERT.
    pub tuple: Option<Bytes>,
    /// Primary key for UPDATE/DELETE.
    pub key: Option<Bytes>,
    /// Encoded [`UpdateOp`] list for UPDATE/UPSERT.
    pub ops: Option<Bytes>,
    /// Base of field numbering in `ops`: 0 or 1. Non-zero bases are
    /// normalized away before the request reaches the log.
    pub index_base: i64,
    /// Pre-built redo row, present when the request arrived with one (e.g.
    /// from replication). Reused verbatim instead of re-encoding.
    pub header: Option<Row>,
}

impl DmlRequest {
    pub fn insert(space_id: u32, key: Bytes, tuple: Bytes) -> Self {
        Self {
            op: OpKind::Insert,
            space_id,
            tuple: Some(tuple),
            key: Some(key),
            ops: None,
            index_base: 0,
            header: None,
        }
    }

    pub fn replace(space_id: u32, key: Bytes, tuple: Bytes) -> Self {
        Self {
            op: OpKind::Replace,
            ..Self::insert(space_id, key, tuple)
        }
    }

    pub fn update(space_id: u32, key: Bytes, ops: &[UpdateOp], index_base: i64) -> Result<Self> {
        Ok(Self {
            op: OpKind::Update,
            space_id,
            tuple: None,
            key: Some(key),
            ops: Some(encode_ops(ops)?),
            index_base,
            header: None,
        })
    }

    pub fn upsert(
        space_id: u32,
        key: Bytes,
        tuple: Bytes,
        ops: &[UpdateOp],
        index_base: i64,
    ) -> Result<Self> {
        Ok(Self {
            op: OpKind::Upsert,
            space_id,
            tuple: Some(tuple),
            key: Some(key),
            ops: Some(encode_ops(ops)?),
            index_base,
            header: None,
        })
    }

    pub fn delete(space_id: u32, key: Bytes) -> Self {
        Self {
            op: OpKind::Delete,
            space_id,
            tuple: None,
            key: Some(key),
            ops: None,
            index_base: 0,
            header: None,
        }
    }

    /// Normalizes field numbering if the request still carries a non-zero
    /// base. Run before the engine executes the request and again (as a
    /// no-op) before the redo row is built.
    pub fn ensure_normalized(&mut self) -> Result<()> {
        if matches!(self.op, OpKind::Update | OpKind::Upsert) && self.index_base != 0 {
            self.normalize_ops()?;
        }
        Ok(())
    }

    /// Rewrites the update operations of an UPDATE/UPSERT so that all field
    /// numbers (and splice positions) are zero-based, then clears
    /// `index_base`. Negative numbers index from the tuple end and are left
    /// untouched. Any cached header row is dropped so the redo row is
    /// rebuilt from the normalized operations at commit time.
    pub fn normalize_ops(&mut self) -> Result<()> {
        debug_assert!(matches!(self.op, OpKind::Update | OpKind::Upsert));
        debug_assert!(self.index_base != 0);
        let encoded = self
            .ops
            .as_ref()
            .ok_or_else(|| Error::Codec("update request without operations".into()))?;
        let mut ops = decode_ops(encoded)?;
        for op in &mut ops {
            if op.field_no >= 0 {
                op.field_no -= self.index_base;
            }
            if op.op == b':' {
                if let Some(pos) = op.splice_pos.as_mut() {
                    if *pos >= 0 {
                        *pos -= self.index_base;
                    }
                }
            }
        }
        self.ops = Some(encode_ops(&ops)?);
        self.index_base = 0;
        // The header caches the old operation encoding; rebuild at commit.
        self.header = None;
        Ok(())
    }

    /// Encodes the request body into row body slices: the engine-neutral
    /// encoder used when no pre-built header row is available. The first
    /// slice names the target space so replay can route the row.
    pub fn encode_body(&self) -> Result<Vec<Bytes>> {
        let mut bodies = Vec::with_capacity(4);
        match self.op {
            OpKind::Insert | OpKind::Replace => {
                bodies.push(space_body(self.space_id));
                bodies.push(require(&self.key, "key")?);
                bodies.push(require(&self.tuple, "tuple")?);
            }
            OpKind::Update => {
                bodies.push(space_body(self.space_id));
                bodies.push(require(&self.key, "key")?);
                bodies.push(require(&self.ops, "ops")?);
            }
            OpKind::Upsert => {
                bodies.push(space_body(self.space_id));
                bodies.push(require(&self.key, "key")?);
                bodies.push(require(&self.tuple, "tuple")?);
                bodies.push(require(&self.ops, "ops")?);
            }
            OpKind::Delete => {
                bodies.push(space_body(self.space_id));
                bodies.push(require(&self.key, "key")?);
            }
            OpKind::Prepare | OpKind::Commit | OpKind::Rollback => {
                bodies.push(Bytes::new());
            }
        }
        Ok(bodies)
    }
}

fn space_body(space_id: u32) -> Bytes {
    Bytes::copy_from_slice(&space_id.to_le_bytes())
}

fn require(field: &Option<Bytes>, name: &str) -> Result<Bytes> {
    field
        .clone()
        .ok_or_else(|| Error::Codec(format!("request is missing {name}")))
}

pub fn encode_ops(ops: &[UpdateOp]) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(ops)?))
}

pub fn decode_ops(encoded: &[u8]) -> Result<Vec<UpdateOp>> {
    Ok(bincode::deserialize(encoded)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(field_no: i64, arg: &'static [u8]) -> UpdateOp {
        UpdateOp {
            op: b'=',
            field_no,
            splice_pos: None,
            arg: Bytes::from_static(arg),
        }
    }

    #[test]
    fn test_normalize_shifts_field_numbers() {
        let ops = [assign(3, b"commit")];
        let mut req = DmlRequest::update(1, Bytes::from_static(b"k"), &ops, 1).unwrap();
        req.normalize_ops().unwrap();
        assert_eq!(req.index_base, 0);
        let normalized = decode_ops(req.ops.as_ref().unwrap()).unwrap();
        assert_eq!(normalized[0].field_no, 2);
    }

    #[test]
    fn test_normalize_splice_and_negative() {
        let ops = [
            UpdateOp {
                op: b':',
                field_no: 2,
                splice_pos: Some(5),
                arg: Bytes::from_static(b"x"),
            },
            assign(-1, b"tail"),
        ];
        let mut req = DmlRequest::update(1, Bytes::from_static(b"k"), &ops, 1).unwrap();
        req.header = Some(Row::new(OpKind::Update, vec![]));
        req.normalize_ops().unwrap();
        let normalized = decode_ops(req.ops.as_ref().unwrap()).unwrap();
        assert_eq!(normalized[0].field_no, 1);
        assert_eq!(normalized[0].splice_pos, Some(4));
        // Negative numbers index from the end and keep their value.
        assert_eq!(normalized[1].field_no, -1);
        // The cached header must be rebuilt from the normalized ops.
        assert!(req.header.is_none());
    }

    #[test]
    fn test_body_layout_per_op() {
        let ins = DmlRequest::insert(1, Bytes::from_static(b"k"), Bytes::from_static(b"t"));
        let bodies = ins.encode_body().unwrap();
        assert_eq!(bodies.len(), 3);
        assert_eq!(&bodies[0][..], &1u32.to_le_bytes());
        let del = DmlRequest::delete(1, Bytes::from_static(b"k"));
        assert_eq!(del.encode_body().unwrap().len(), 2);
        let ops = [assign(0, b"v")];
        let ups = DmlRequest::upsert(
            1,
            Bytes::from_static(b"k"),
            Bytes::from_static(b"t"),
            &ops,
            0,
        )
        .unwrap();
        assert_eq!(ups.encode_body().unwrap().len(), 4);
    }

    #[test]
    fn test_update_without_ops_is_codec_error() {
        let mut req = DmlRequest::delete(1, Bytes::from_static(b"k"));
        req.op = OpKind::Update;
        req.index_base = 1;
        assert!(matches!(req.normalize_ops(), Err(Error::Codec(_))));
    }
}
