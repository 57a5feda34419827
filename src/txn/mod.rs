// Transaction manager: accumulates per-task mutations into an atomic unit,
// coordinates with the storage engine, builds redo rows and submits them to
// the WAL writer, including the two-phase commit protocol with in-log
// PREPARE/COMMIT/ROLLBACK markers.
//
// # Module Organization
//
// | Module | Responsibility |
// |--------|----------------|
// | [`types`] | `Txn`, `TxnStmt`, `Region`, triggers |
// | [`two_phase`] | Bookkeeping-table writes of the 2PC protocol |
//
// The operations themselves live on [`TxnContext`], the environment shared
// by every task: the writer handle, the LSN assigner and the bookkeeping
// space. The per-task boundary around them is [`crate::session::Session`].

pub mod two_phase;
pub mod types;

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use crate::common::{CoordinatorId, ReplicaId, Signature, TransactionId};
use crate::error::{Error, Result};
use crate::request::DmlRequest;
use crate::row::{server_clock_micros, OpKind, Row};
use crate::space::Space;
use crate::vclock::VClock;
use crate::wal::{Wal, WalMode};

use types::{Txn, TxnStmt, TXN_SUB_STMT_MAX};

/// Assigns tentative LSNs on the transaction side. The writer's clock
/// follows these once rows are durable; an LSN whose transaction rolls back
/// is simply abandoned.
pub struct LsnAssigner {
    replica_id: ReplicaId,
    vclock: Mutex<VClock>,
}

impl LsnAssigner {
    pub fn new(replica_id: ReplicaId, vclock: VClock) -> Self {
        Self {
            replica_id,
            vclock: Mutex::new(vclock),
        }
    }

    /// Stamps `replica_id`, `lsn` and `tm` on a row about to be submitted.
    /// A row that already names its replica comes from a remote master and
    /// keeps its LSN; the local clock follows it instead.
    pub fn fill(&self, row: &mut Row) {
        let mut vclock = self.vclock.lock();
        if row.replica_id == 0 {
            row.replica_id = self.replica_id;
            row.lsn = vclock.advance(self.replica_id);
        } else if let Err(err) = vclock.follow(row.replica_id, row.lsn) {
            warn!(error = %err, "remote row does not advance the local vclock");
        }
        row.tm = server_clock_micros();
    }

    pub fn sum(&self) -> Signature {
        self.vclock.lock().sum()
    }

    pub fn vclock(&self) -> VClock {
        self.vclock.lock().clone()
    }
}

/// Shared environment of the transaction manager.
pub struct TxnContext {
    wal: Option<Arc<Wal>>,
    assigner: LsnAssigner,
    /// The system space recording two-phase state transitions, keyed by
    /// transaction id. Set once the schema is up.
    txn_log_space: Mutex<Option<Arc<Space>>>,
}

impl TxnContext {
    pub fn new(wal: Option<Arc<Wal>>, replica_id: ReplicaId, vclock: VClock) -> Arc<Self> {
        Arc::new(Self {
            wal,
            assigner: LsnAssigner::new(replica_id, vclock),
            txn_log_space: Mutex::new(None),
        })
    }

    pub fn assigner(&self) -> &LsnAssigner {
        &self.assigner
    }

    /// The writer, when one exists and actually writes (`wal_mode != none`).
    pub fn wal(&self) -> Option<&Arc<Wal>> {
        self.wal.as_ref().filter(|wal| wal.mode() != WalMode::None)
    }

    pub fn set_txn_log_space(&self, space: Arc<Space>) {
        *self.txn_log_space.lock() = Some(space);
    }

    pub(crate) fn txn_log_space(&self) -> Result<Arc<Space>> {
        self.txn_log_space
            .lock()
            .clone()
            .ok_or_else(|| Error::Storage("the transaction bookkeeping space is not set".into()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn begin(&self, is_autocommit: bool) -> Box<Txn> {
        Box::new(Txn::new(is_autocommit))
    }

    pub fn begin_two_phase(
        &self,
        tx_id: TransactionId,
        coordinator_id: CoordinatorId,
    ) -> Box<Txn> {
        Box::new(Txn::new_two_phase(tx_id, coordinator_id))
    }

    /// Opens a statement, creating an auto-commit transaction if the task
    /// has none. Binds the space's engine on first use.
    pub fn begin_stmt(&self, slot: &mut Option<Box<Txn>>, space: &Arc<Space>) -> Result<()> {
        if slot.is_none() {
            *slot = Some(self.begin(true));
        }
        let txn = slot.as_mut().expect("just created");
        if txn.in_sub_stmt > TXN_SUB_STMT_MAX {
            return Err(Error::SubStmtMax);
        }
        if txn.in_prepare {
            debug_assert!(txn.is_two_phase);
            return Err(Error::ChangePrepared(txn.tx_id));
        }
        let engine = space.engine();
        txn.bind_engine(&engine)?;
        txn.stmts.push(TxnStmt::new(Arc::clone(space)));
        txn.in_sub_stmt += 1;
        engine.begin_statement(txn)
    }

    /// Ends a statement: builds (or reuses) the redo row, runs replace
    /// triggers, and in auto-commit mode commits the transaction once the
    /// sub-statement depth returns to zero.
    pub async fn commit_stmt(
        &self,
        slot: &mut Option<Box<Txn>>,
        request: &mut DmlRequest,
    ) -> Result<()> {
        {
            let txn = slot.as_mut().ok_or(Error::NoActiveTransaction)?;
            debug_assert!(txn.in_sub_stmt > 0);
            debug_assert!(!txn.in_prepare);

            // Field numbers must be zero-based before the redo row exists.
            request.ensure_normalized()?;

            let index = txn.stmts.len() - 1;
            if !txn.stmts[index].space.is_temporary() {
                add_redo(txn, index, request)?;
                txn.n_rows += 1;
            }
            let stmt = &txn.stmts[index];
            if stmt.space.has_replace_triggers()
                && stmt.space.run_triggers_enabled()
                && (stmt.old_tuple.is_some() || stmt.new_tuple.is_some())
            {
                let space = Arc::clone(&stmt.space);
                space.run_replace_triggers(txn, &txn.stmts[index]);
            }
            txn.in_sub_stmt -= 1;
        }
        let autocommit = slot
            .as_ref()
            .is_some_and(|txn| txn.is_autocommit && txn.in_sub_stmt == 0);
        if autocommit {
            let txn = slot.take().expect("checked above");
            self.commit(txn).await?;
        }
        Ok(())
    }

    /// Voids the effects of the last statement but keeps it in the list, so
    /// the statement count limit still applies. An auto-commit transaction
    /// rolls back entirely.
    pub async fn rollback_stmt(&self, slot: &mut Option<Box<Txn>>) {
        let Some(txn) = slot.as_mut() else {
            return;
        };
        if txn.is_autocommit {
            let txn = slot.take().expect("checked above");
            self.rollback(txn).await;
            return;
        }
        if txn.in_sub_stmt == 0 {
            return;
        }
        if let Some(engine) = txn.engine() {
            engine.rollback_statement(txn);
        }
        let detached = txn
            .stmts
            .last_mut()
            .is_some_and(|stmt| stmt.row.take().is_some());
        if detached {
            txn.n_rows -= 1;
        }
        txn.in_sub_stmt -= 1;
    }

    /// Two-phase prepare: logs durable intent. Writes the bookkeeping
    /// record, then one atomic frame of the PREPARE header followed by every
    /// transactional row. `header` may carry a PREPARE row received from the
    /// coordinator; a local one is built otherwise.
    pub async fn prepare_two_phase(&self, txn: &mut Txn, header: Option<Row>) -> Result<()> {
        if txn.in_prepare {
            return Err(Error::AlreadyPrepared(txn.tx_id));
        }
        if !txn.is_two_phase {
            return Err(Error::Unsupported(
                "transaction".to_string(),
                "prepare of a one-phase transaction".to_string(),
            ));
        }
        if let Some(engine) = txn.engine() {
            if self.wal().is_some() {
                two_phase::log_prepare(self, txn.tx_id, txn.coordinator_id).await?;
            }
            engine.begin_prepare_two_phase(txn)?;
            let mut signature = -1;
            if txn.n_rows > 0 {
                let mut prepare_row = match header {
                    Some(row) => {
                        debug_assert!(row.op == OpKind::Prepare);
                        debug_assert!(row.tx_id == txn.tx_id);
                        row
                    }
                    None => Row::two_phase_marker(OpKind::Prepare, txn.tx_id, txn.coordinator_id),
                };
                self.assigner.fill(&mut prepare_row);
                let mut rows = Vec::with_capacity(txn.n_rows + 1);
                rows.push(prepare_row);
                self.collect_rows(txn, &mut rows);
                signature = self.submit(rows).await?;
            }
            engine.end_prepare_two_phase(txn, signature)?;
        }
        txn.in_prepare = true;
        Ok(())
    }

    /// Commits a transaction. For one-phase transactions all redo rows go to
    /// the log as one atomic frame; for two-phase transactions only the
    /// COMMIT marker is written, the data being durable since prepare.
    ///
    /// On a WAL failure the transaction is rolled back and the task yields
    /// to the back of the run queue so pending cascading rollbacks finish
    /// before any new work.
    pub async fn commit(&self, mut txn: Box<Txn>) -> Result<Signature> {
        debug_assert!(txn.stmts.is_empty() || txn.engine.is_some());
        debug_assert!(!txn.is_two_phase || txn.in_prepare);

        let Some(engine) = txn.engine() else {
            // Read-only transaction: nothing to log, nothing to commit.
            return Ok(self.assigner.sum());
        };
        if !txn.is_two_phase {
            if let Err(err) = engine.prepare(&mut txn) {
                self.rollback(txn).await;
                return Err(err);
            }
        }
        let mut signature = -1;
        // A prepared two-phase transaction always writes its outcome, even
        // with zero redo rows: the prepare left a durable bookkeeping entry
        // that must reach a terminal state.
        let written = if txn.is_two_phase {
            Some(self.finish_two_phase(&mut txn, OpKind::Commit).await)
        } else if txn.n_rows > 0 {
            let mut rows = Vec::with_capacity(txn.n_rows);
            self.collect_rows(&mut txn, &mut rows);
            Some(self.submit(rows).await)
        } else {
            None
        };
        match written {
            Some(Ok(res)) if !txn.is_two_phase => signature = res,
            Some(Ok(_)) | None => {}
            Some(Err(err)) => {
                self.unwind(txn).await;
                tokio::task::yield_now().await;
                return Err(err);
            }
        }
        // The transaction is in the log. Nothing below may fail.
        for trigger in std::mem::take(&mut txn.on_commit) {
            trigger(&txn);
        }
        engine.commit(&mut txn, signature);
        Ok(if signature >= 0 {
            signature
        } else {
            self.assigner.sum()
        })
    }

    /// Rolls a transaction back. For a prepared two-phase transaction the
    /// durable ROLLBACK marker is written first, so recovery knows the
    /// prepare was abandoned.
    pub async fn rollback(&self, mut txn: Box<Txn>) {
        for trigger in std::mem::take(&mut txn.on_rollback) {
            trigger(&txn);
        }
        if let Some(engine) = txn.engine() {
            if txn.is_two_phase {
                if let Err(err) = self.finish_two_phase(&mut txn, OpKind::Rollback).await {
                    warn!(
                        tx_id = txn.tx_id,
                        error = %err,
                        "failed to log the two-phase rollback"
                    );
                }
            }
            engine.rollback(&mut txn);
        }
    }

    /// The local part of a cascading rollback: the log already refused the
    /// write, so no further markers are attempted.
    async fn unwind(&self, mut txn: Box<Txn>) {
        for trigger in std::mem::take(&mut txn.on_rollback) {
            trigger(&txn);
        }
        if let Some(engine) = txn.engine() {
            engine.rollback(&mut txn);
        }
    }

    // =========================================================================
    // WAL plumbing
    // =========================================================================

    /// Detaches every redo row from the transaction, stamping LSNs and
    /// timestamps. LSNs advance even with `wal_mode = none` so snapshots
    /// stay consistent without a log.
    fn collect_rows(&self, txn: &mut Txn, rows: &mut Vec<Row>) {
        let tx_id = txn.tx_id;
        for stmt in &mut txn.stmts {
            if let Some(mut row) = stmt.row.take() {
                self.assigner.fill(&mut row);
                row.tx_id = tx_id;
                rows.push(row);
            }
        }
    }

    /// Hands one atomic write unit to the writer and waits for the verdict.
    async fn submit(&self, rows: Vec<Row>) -> Result<Signature> {
        debug_assert!(!rows.is_empty());
        let Some(wal) = self.wal() else {
            return Ok(self.assigner.sum());
        };
        let start = Instant::now();
        let res = wal.write(rows).await;
        let elapsed = start.elapsed();
        if elapsed > wal.config().too_long_threshold {
            warn!(elapsed_secs = elapsed.as_secs_f64(), "too long WAL write");
        }
        if res < 0 {
            return Err(Error::WalIo);
        }
        Ok(res)
    }

    /// Writes the durable outcome of a two-phase transaction: the marker
    /// frame, then the bookkeeping end-state update, then the bookkeeping
    /// delete once the end is durable. A rollback before prepare has no
    /// durable intent to revoke and only scrubs the bookkeeping row.
    async fn finish_two_phase(&self, txn: &mut Txn, end: OpKind) -> Result<Signature> {
        debug_assert!(txn.is_two_phase);
        debug_assert!(matches!(end, OpKind::Commit | OpKind::Rollback));
        debug_assert!(txn.in_prepare || end == OpKind::Rollback);

        let logged = self.wal().is_some();
        if end == OpKind::Rollback && !txn.in_prepare {
            if logged {
                two_phase::log_delete(self, txn.tx_id).await?;
            }
            return Ok(-1);
        }

        let mut marker = Row::two_phase_marker(end, txn.tx_id, txn.coordinator_id);
        if logged {
            // Recovery does not advance the clock by COMMIT/ROLLBACK rows,
            // but the writer does follow them like any other row.
            self.assigner.fill(&mut marker);
        } else {
            marker.tm = server_clock_micros();
        }
        let res = self.submit(vec![marker]).await?;

        if logged {
            two_phase::log_end(self, txn.tx_id, end).await?;
            two_phase::log_delete(self, txn.tx_id).await?;
        }
        Ok(res)
    }
}

/// Builds or reuses the redo row of a finished statement. A request that
/// already carries a header row keeps it untouched; otherwise the body is
/// encoded through the engine-neutral encoder and the two-phase identifiers
/// are stamped. `replica_id`, `lsn` and `tm` stay zero until submission.
fn add_redo(txn: &mut Txn, index: usize, request: &DmlRequest) -> Result<()> {
    let row = match &request.header {
        Some(header) => header.clone(),
        None => {
            let mut row = Row::new(request.op, request.encode_body()?);
            row.tx_id = txn.tx_id;
            row.coordinator_id = txn.coordinator_id;
            row
        }
    };
    txn.stmts[index].row = Some(row);
    Ok(())
}
