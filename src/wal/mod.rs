//! The WAL writer: a dedicated thread that owns the current log file and
//! serializes every durable mutation of the instance.
//!
//! The transaction side submits [`WalRequest`]s over the bus; the writer
//! appends each request as one transactional block, acknowledges the
//! committed prefix of every batch in FIFO order, and on any disk failure
//! drives a cascading rollback that unwinds the failed request and every
//! later in-flight request in LIFO order.
//!
//! # Thread model
//!
//! All writer state (current file, vector clock, rollback flag) is mutated
//! only on the writer thread. The transaction side of the crate talks to it
//! exclusively through [`bus`] messages; the only shared state is the
//! watcher list (mutex), the rollback valve (mutex) and the current-file
//! slot (mutex, shared so `atfork` can invalidate the handle from the
//! forking thread).

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::sync::Parker;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::{
    Batch, Bus, CheckpointMsg, Envelope, Handler, MsgBody, PipeId, WalRequest, ROUTE_CHECKPOINT,
    ROUTE_ROLLBACK, ROUTE_STOP,
};
use crate::error::{Error, Result};
use crate::row::Row;
use crate::vclock::VClock;
use crate::xlog::{DirType, LogDir, LogFile};

/// Durability mode of the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalMode {
    /// No log is written at all.
    None,
    /// Rows are written but not fsynced.
    Write,
    /// Every flush reaches stable storage before it is acknowledged.
    Fsync,
}

impl FromStr for WalMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(WalMode::None),
            "write" => Ok(WalMode::Write),
            "fsync" => Ok(WalMode::Fsync),
            other => Err(format!("unknown wal mode {other:?}")),
        }
    }
}

/// Writer configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    pub mode: WalMode,
    /// Directory the log files live in.
    pub dir: PathBuf,
    /// Rotation threshold: a file reaching this many rows is closed before
    /// the next write. Must be greater than 1.
    pub rows_per_wal: i64,
    /// A single write taking longer than this is reported with a warning.
    pub too_long_threshold: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            mode: WalMode::Write,
            dir: PathBuf::from("./wal"),
            rows_per_wal: 500_000,
            too_long_threshold: Duration::from_millis(500),
        }
    }
}

/// Registration token returned by [`Wal::set_watcher`].
#[derive(Debug)]
pub struct WalWatcher {
    id: u64,
}

/// The process-facing WAL facade. Holds the bus, the rollback valve, the
/// watcher registry and the handle of the writer thread.
pub struct Wal {
    config: WalConfig,
    pub(crate) bus: Bus,
    /// The rollback queue: an accumulator for every request that must be
    /// rolled back. A non-empty queue also acts as a valve in [`Wal::write`]
    /// so that new requests never enter the bus during a cascading rollback
    /// and are refused on arrival instead.
    rollback: Mutex<Vec<WalRequest>>,
    watchers: Mutex<Vec<(u64, mpsc::UnboundedSender<()>)>>,
    next_watcher_id: AtomicU64,
    /// Shared slot for the current log file so `atfork` can invalidate the
    /// handle from the forking thread.
    current: Arc<Mutex<Option<LogFile>>>,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Validates the configuration, scans the log directory and starts the
    /// writer thread plus the transaction-side pump task.
    ///
    /// Must be called from within a tokio runtime. `vclock` is the position
    /// recovery stopped at; the writer's clock follows from there.
    pub fn start(config: WalConfig, server_uuid: Uuid, vclock: VClock) -> Result<Arc<Wal>> {
        if config.rows_per_wal <= 1 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "rows_per_wal must be greater than 1",
            )));
        }
        let (bus, parker, tx_recv) = Bus::new();
        let wal = Arc::new(Wal {
            config,
            bus,
            rollback: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            next_watcher_id: AtomicU64::new(1),
            current: Arc::new(Mutex::new(None)),
            writer_thread: Mutex::new(None),
        });

        if wal.config.mode != WalMode::None {
            let mut dir = LogDir::new(&wal.config.dir, DirType::Log, server_uuid);
            if wal.config.mode == WalMode::Fsync {
                dir.set_open_sync(true);
            }
            dir.check()?;
            dir.scan()?;
            let writer = WalWriter {
                rows_per_wal: wal.config.rows_per_wal,
                dir,
                vclock,
                current: Arc::clone(&wal.current),
                in_rollback: false,
                wal: Arc::clone(&wal),
            };
            let handle = thread::Builder::new()
                .name("wal".into())
                .spawn(move || writer_loop(writer, parker))?;
            *wal.writer_thread.lock() = Some(handle);
            tokio::spawn(tx_loop(Arc::downgrade(&wal), tx_recv));
        }
        Ok(wal)
    }

    pub fn mode(&self) -> WalMode {
        self.config.mode
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Queues one request to be written to disk and waits for the writer's
    /// verdict. Returns the assigned signature, or -1 if the request was
    /// rolled back.
    ///
    /// The await must not be interrupted: a caller that abandons the wait
    /// would ignore the writer's verdict and leave its transaction state
    /// inconsistent with the log.
    pub async fn write(&self, rows: Vec<Row>) -> i64 {
        debug_assert!(self.config.mode != WalMode::None);
        debug_assert!(!rows.is_empty());
        if !self.rollback.lock().is_empty() {
            // Roll back this request immediately: it may have observed
            // changes that are themselves about to be rolled back.
            warn!("aborting transaction during cascading rollback");
            return -1;
        }
        let (request, ack) = WalRequest::new(rows);
        self.bus.wal_pipe.push_request(request);
        match ack.await {
            Ok(res) => res,
            // The writer is gone (shutdown); treat as an I/O failure.
            Err(_) => -1,
        }
    }

    /// Asks the writer thread for a copy of its vector clock, optionally
    /// closing the current file so the next write opens a new one. Suspends
    /// the calling task until the writer answers.
    pub async fn checkpoint(&self, rotate: bool) -> Result<VClock> {
        if self.config.mode == WalMode::None {
            return Err(Error::Unsupported(
                "wal".into(),
                "checkpoint with wal_mode = none".into(),
            ));
        }
        let (done, ack) = tokio::sync::oneshot::channel();
        let msg = CheckpointMsg {
            rotate,
            vclock: VClock::new(),
            done: Some(done),
        };
        self.bus
            .wal_pipe
            .push(Envelope::new(MsgBody::Checkpoint(msg), ROUTE_CHECKPOINT));
        ack.await.map_err(|_| Error::WalIo)
    }

    /// Registers a watcher notified (non-blocking) after every batch the
    /// writer processes. Watchers are typically replication relays.
    pub fn set_watcher(&self, notify: mpsc::UnboundedSender<()>) -> WalWatcher {
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().push((id, notify));
        WalWatcher { id }
    }

    pub fn clear_watcher(&self, watcher: &WalWatcher) {
        self.watchers.lock().retain(|(id, _)| *id != watcher.id);
    }

    fn notify_watchers(&self) {
        let watchers = self.watchers.lock();
        for (_, notify) in watchers.iter() {
            let _ = notify.send(());
        }
    }

    /// Stops the writer thread, closing the current log with an EOF marker.
    pub fn stop(&self) {
        let handle = self.writer_thread.lock().take();
        if let Some(handle) = handle {
            self.bus
                .wal_pipe
                .push(Envelope::new(MsgBody::Control, ROUTE_STOP));
            if handle.join().is_err() {
                error!("wal writer thread panicked during shutdown");
            }
        }
    }

    /// Invalidates the current log file handle without closing it. Called in
    /// a forked child: the writer thread does not exist there, and the
    /// child's exit path must not flush or EOF-mark the parent's log.
    pub fn invalidate_current_file(&self) {
        if let Some(log) = self.current.lock().as_mut() {
            log.atfork();
        }
    }

    fn tx_schedule_commit(&self, batch: &mut Batch) {
        if !batch.rollback.is_empty() {
            // Closes the input valve.
            self.rollback.lock().extend(batch.rollback.drain(..));
        }
        // Wake submitters in strict FIFO submission order.
        for request in batch.commit.drain(..) {
            request.complete();
        }
    }

    fn tx_schedule_rollback(&self) {
        let queue = std::mem::take(&mut *self.rollback.lock());
        debug!(requests = queue.len(), "cascading rollback reached the tx side");
        // Unwind in reverse submission order, replaying the in-memory state
        // backwards. Each result stays -1.
        for request in queue.into_iter().rev() {
            request.complete();
        }
    }
}

/// Transaction-side pump: runs the tx hops of every route. Holds the
/// facade weakly so a stopped writer can be dropped.
async fn tx_loop(wal: std::sync::Weak<Wal>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(mut envelope) = rx.recv().await {
        let Some(wal) = wal.upgrade() else {
            break;
        };
        let Some(hop) = envelope.current_hop() else {
            continue;
        };
        match hop.handler {
            Handler::ScheduleCommit => {
                if let MsgBody::Batch(batch) = &mut envelope.body {
                    wal.tx_schedule_commit(batch);
                }
            }
            Handler::ScheduleRollback => wal.tx_schedule_rollback(),
            Handler::ClearBus => {}
            Handler::CheckpointDone => {
                if let MsgBody::Checkpoint(msg) = &mut envelope.body {
                    if let Some(done) = msg.done.take() {
                        let _ = done.send(std::mem::take(&mut msg.vclock));
                    }
                }
            }
            other => debug_assert!(false, "handler {other:?} is not a tx-side handler"),
        }
        if let Some(next) = envelope.advance() {
            wal.bus.forward(next, envelope);
        }
    }
}

/// Writer-thread state. Owned exclusively by the writer thread.
struct WalWriter {
    rows_per_wal: i64,
    dir: LogDir,
    /// The authoritative vector clock. It trails the transaction-side clock:
    /// a tentative LSN assigned at submission becomes real only once the row
    /// is written and the writer follows it.
    vclock: VClock,
    current: Arc<Mutex<Option<LogFile>>>,
    /// While set, no request may enter the committed path: `write_batch`
    /// steers every arriving request straight to rollback.
    in_rollback: bool,
    wal: Arc<Wal>,
}

/// Writer thread main loop.
fn writer_loop(mut writer: WalWriter, parker: Parker) {
    'outer: loop {
        let mut queue = writer.wal.bus.wal_pipe.pop_all();
        if queue.is_empty() {
            parker.park();
            continue;
        }
        while let Some(mut envelope) = queue.pop_front() {
            let Some(hop) = envelope.current_hop() else {
                continue;
            };
            match hop.handler {
                Handler::WriteBatch => {
                    if let MsgBody::Batch(batch) = &mut envelope.body {
                        writer.write_batch(batch);
                    }
                }
                Handler::Checkpoint => {
                    if let MsgBody::Checkpoint(msg) = &mut envelope.body {
                        writer.checkpoint(msg);
                    }
                }
                Handler::ClearBus => {}
                Handler::EndRollback => {
                    debug!("leaving rollback mode");
                    writer.in_rollback = false;
                }
                Handler::Stop => {
                    writer.shutdown();
                    break 'outer;
                }
                other => debug_assert!(false, "handler {other:?} is not a writer handler"),
            }
            if let Some(next) = envelope.advance() {
                writer.wal.bus.forward(next, envelope);
            }
        }
    }
}

impl WalWriter {
    /// Main handler: writes a batch of requests, acknowledging the committed
    /// prefix and steering everything after the first failure to rollback.
    fn write_batch(&mut self, batch: &mut Batch) {
        if self.in_rollback {
            // A failed write is still being unwound; everything arriving now
            // joins it.
            batch.rollback.extend(batch.commit.drain(..));
            return;
        }

        let current = Arc::clone(&self.current);
        let mut slot = current.lock();
        if let Err(err) = self.opt_rotate(&mut slot) {
            error!(error = %err, "failed to open a log for writing");
            batch.rollback.extend(batch.commit.drain(..));
            drop(slot);
            self.begin_rollback();
            return;
        }
        let log = slot.as_mut().expect("rotation leaves an open log");

        // Each request becomes one transactional block. `commit_tx` reports
        // a positive byte count once a block (and everything buffered before
        // it) has reached the file; `last_written` tracks the last request
        // covered by such a write. A huge block can exceed what one write
        // call covers, so a failed write truncates the file back to the last
        // complete frame before the error surfaces here.
        let mut last_written: Option<usize> = None;
        let mut failed = false;
        'requests: for (index, request) in batch.commit.iter().enumerate() {
            log.begin_tx();
            for row in &request.rows {
                if let Err(err) = log.write_row(row) {
                    error!(error = %err, "failed to encode a row");
                    log.rollback_tx();
                    failed = true;
                    break 'requests;
                }
            }
            match log.commit_tx() {
                Ok(0) => {}
                Ok(_) => last_written = Some(index),
                Err(err) => {
                    error!(error = %err, "failed to write a transaction block");
                    failed = true;
                    break 'requests;
                }
            }
        }
        if !failed {
            match log.flush() {
                Ok(_) => {
                    last_written = batch.commit.len().checked_sub(1);
                }
                Err(err) => {
                    error!(error = %err, "failed to flush the log");
                }
            }
        }

        // Acknowledge the committed prefix: follow each request's last row,
        // bump the file's row count and stamp the signature.
        let committed = last_written.map_or(0, |index| index + 1);
        for request in batch.commit.iter_mut().take(committed) {
            let last_row = request
                .rows
                .last()
                .expect("a request carries at least one row");
            if let Err(err) = self.vclock.follow(last_row.replica_id, last_row.lsn) {
                error!(error = %err, "acknowledged row does not advance the vclock");
            }
            log.add_rows(request.rows.len() as i64);
            request.res = self.vclock.sum();
        }

        // Everything past the committed prefix rolls back, along with any of
        // its rows still sitting in the accumulation buffer.
        if committed < batch.commit.len() {
            batch.rollback.extend(batch.commit.drain(committed..));
            log.discard_buffered();
            drop(slot);
            self.begin_rollback();
        } else {
            drop(slot);
        }
        self.wal.notify_watchers();
    }

    /// Closes a full file and opens the next one. The old file is closed
    /// first so an external reader sees its EOF marker before the new file
    /// appears in the directory.
    fn opt_rotate(&mut self, slot: &mut Option<LogFile>) -> Result<()> {
        if slot
            .as_ref()
            .is_some_and(|log| log.rows() >= self.rows_per_wal)
        {
            if let Some(log) = slot.take() {
                // A close failure here leaves nothing to recover; the data
                // is flushed and the next file is independent.
                if let Err(err) = log.close(false) {
                    warn!(error = %err, "failed to close a rotated log");
                }
            }
        }
        if slot.is_none() {
            *slot = Some(self.dir.create_log(&self.vclock)?);
        }
        Ok(())
    }

    /// Enters rollback mode and launches the bus-clearing control message.
    /// While it travels writer -> tx -> writer -> tx, the non-empty rollback
    /// queue on the tx side refuses new submissions, so the bus is
    /// guaranteed to drain.
    fn begin_rollback(&mut self) {
        self.in_rollback = true;
        self.wal
            .bus
            .forward(PipeId::Tx, Envelope::new(MsgBody::Control, ROUTE_ROLLBACK));
    }

    /// Checkpoint handler: optionally rotates, then reports the vclock.
    /// An empty current file (header vclock equal to the writer's) is kept
    /// open rather than closed and deleted.
    fn checkpoint(&mut self, msg: &mut CheckpointMsg) {
        if msg.rotate {
            let mut slot = self.current.lock();
            let has_rows = slot
                .as_ref()
                .is_some_and(|log| log.vclock().sum() != self.vclock.sum());
            if has_rows {
                if let Some(log) = slot.take() {
                    if let Err(err) = log.close(false) {
                        warn!(error = %err, "failed to close the log at checkpoint");
                    }
                }
            }
        }
        msg.vclock = self.vclock.clone();
    }

    fn shutdown(&mut self) {
        let log = self.current.lock().take();
        if let Some(log) = log {
            if let Err(err) = log.close(false) {
                warn!(error = %err, "failed to close the log at shutdown");
            }
        }
    }
}

// =============================================================================
// Process-wide facade
// =============================================================================

static WAL: Lazy<RwLock<Option<Arc<Wal>>>> = Lazy::new(|| RwLock::new(None));

/// Initializes the process-wide writer. The instance must have completed
/// recovery: `vclock` is where the log left off.
pub fn wal_init(config: WalConfig, server_uuid: Uuid, vclock: VClock) -> Result<Arc<Wal>> {
    let mut slot = WAL.write();
    if slot.is_some() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "the wal writer is already initialized",
        )));
    }
    let wal = Wal::start(config, server_uuid, vclock)?;
    *slot = Some(Arc::clone(&wal));
    Ok(wal)
}

/// The process-wide writer, if initialized.
pub fn wal() -> Option<Arc<Wal>> {
    WAL.read().clone()
}

/// Stops the process-wide writer thread and waits for it to exit.
pub fn wal_thread_stop() {
    let wal = WAL.write().take();
    if let Some(wal) = wal {
        wal.stop();
    }
}

/// Fork handler: in the child the writer thread does not exist. Drop the
/// global facade and invalidate the open file handle so the child's exit
/// path cannot write a second EOF marker into the parent's log.
pub fn wal_atfork() {
    let wal = WAL.write().take();
    if let Some(wal) = wal {
        wal.invalidate_current_file();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::OpKind;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn row(replica_id: u32, lsn: i64) -> Row {
        let mut row = Row::new(OpKind::Insert, vec![Bytes::from_static(b"body")]);
        row.replica_id = replica_id;
        row.lsn = lsn;
        row
    }

    async fn start(dir: &std::path::Path, rows_per_wal: i64) -> Arc<Wal> {
        let config = WalConfig {
            mode: WalMode::Write,
            dir: dir.to_path_buf(),
            rows_per_wal,
            ..Default::default()
        };
        Wal::start(config, Uuid::new_v4(), VClock::new()).unwrap()
    }

    #[tokio::test]
    async fn test_single_row_write() {
        let tmp = tempdir().unwrap();
        let wal = start(tmp.path(), 10).await;
        let res = wal.write(vec![row(1, 1)]).await;
        assert_eq!(res, 1);
        wal.stop();
        assert!(tmp.path().join("00000000000000000000.xlog").exists());
    }

    #[tokio::test]
    async fn test_signatures_advance_monotonically() {
        let tmp = tempdir().unwrap();
        let wal = start(tmp.path(), 100).await;
        let mut last = 0;
        for lsn in 1..=5 {
            let res = wal.write(vec![row(1, lsn)]).await;
            assert!(res > last);
            last = res;
        }
        assert_eq!(last, 5);
        wal.stop();
    }

    #[tokio::test]
    async fn test_rotation_after_rows_per_wal() {
        let tmp = tempdir().unwrap();
        let wal = start(tmp.path(), 2).await;
        for lsn in 1..=3 {
            assert_eq!(wal.write(vec![row(1, lsn)]).await, lsn);
        }
        wal.stop();
        // First file filled up and rotated; the rest went to the second.
        assert!(tmp.path().join("00000000000000000000.xlog").exists());
        assert!(tmp.path().join("00000000000000000002.xlog").exists());
    }

    #[tokio::test]
    async fn test_checkpoint_reports_vclock() {
        let tmp = tempdir().unwrap();
        let wal = start(tmp.path(), 10).await;
        wal.write(vec![row(1, 1), row(1, 2)]).await;
        let vclock = wal.checkpoint(false).await.unwrap();
        assert_eq!(vclock.get(1), 2);
        wal.stop();
    }

    #[tokio::test]
    async fn test_checkpoint_rotate_skips_empty_file() {
        let tmp = tempdir().unwrap();
        let wal = start(tmp.path(), 10).await;
        wal.write(vec![row(1, 1)]).await;
        // First rotate closes the file with one row.
        wal.checkpoint(true).await.unwrap();
        // Second rotate has nothing to close and must not create files.
        wal.checkpoint(true).await.unwrap();
        wal.stop();
        assert!(tmp.path().join("00000000000000000000.xlog").exists());
        let logs = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|x| x == "xlog")
            })
            .count();
        assert_eq!(logs, 1);
    }

    #[tokio::test]
    async fn test_watcher_notified_per_batch() {
        let tmp = tempdir().unwrap();
        let wal = start(tmp.path(), 10).await;
        let (notify, mut events) = mpsc::unbounded_channel();
        let watcher = wal.set_watcher(notify);
        for lsn in 1..=3 {
            wal.write(vec![row(1, lsn)]).await;
        }
        let mut seen = 0;
        while events.try_recv().is_ok() {
            seen += 1;
        }
        assert!(seen >= 1, "watcher never notified");
        wal.clear_watcher(&watcher);
        wal.stop();
    }

    #[tokio::test]
    async fn test_global_facade_lifecycle() {
        let tmp = tempdir().unwrap();
        let config = WalConfig {
            mode: WalMode::Write,
            dir: tmp.path().to_path_buf(),
            rows_per_wal: 10,
            ..Default::default()
        };
        assert!(wal().is_none());
        let handle = wal_init(config.clone(), Uuid::new_v4(), VClock::new()).unwrap();
        // A second initialization is refused.
        assert!(wal_init(config, Uuid::new_v4(), VClock::new()).is_err());
        assert_eq!(wal().unwrap().write(vec![row(1, 1)]).await, 1);
        wal_thread_stop();
        assert!(wal().is_none());
        drop(handle);
        // After shutdown the fork handler has nothing to do.
        wal_atfork();
    }

    #[tokio::test]
    async fn test_cascading_rollback_and_recovery() {
        let tmp = tempdir().unwrap();
        let logs = tmp.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        let wal = start(&logs, 2).await;

        assert_eq!(wal.write(vec![row(1, 1)]).await, 1);
        assert_eq!(wal.write(vec![row(1, 2)]).await, 2);

        // The first file is full; make the rotation fail.
        let hidden = tmp.path().join("hidden");
        std::fs::rename(&logs, &hidden).unwrap();
        assert_eq!(wal.write(vec![row(1, 3)]).await, -1);
        assert_eq!(wal.write(vec![row(1, 4)]).await, -1);

        // Restore the directory; the writer must have recovered.
        std::fs::rename(&hidden, &logs).unwrap();
        let res = wal.write(vec![row(1, 3)]).await;
        assert_eq!(res, 3);
        wal.stop();
    }
}
