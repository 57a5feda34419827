// End-to-end scenarios: the full path from the session boundary through the
// transaction manager, the bus and the writer thread down to the log files
// on disk, verified by reading the files back.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tempfile::{tempdir, TempDir};
use uuid::Uuid;

use rusty_wal::engine::{decode_tuple, encode_tuple};
use rusty_wal::request::UpdateOp;
use rusty_wal::xlog::LogCursor;
use rusty_wal::{
    DmlRequest, Error, MemoryEngine, OpKind, Row, Session, Space, TxnContext, VClock, Wal,
    WalConfig, WalMode,
};

const DATA_SPACE: u32 = 512;
const TXN_LOG_SPACE: u32 = 296;

struct Harness {
    _tmp: TempDir,
    wal: Arc<Wal>,
    ctx: Arc<TxnContext>,
    engine: Arc<MemoryEngine>,
    data: Arc<Space>,
    dir: std::path::PathBuf,
}

impl Harness {
    fn new(rows_per_wal: i64) -> Self {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("wal");
        std::fs::create_dir(&dir).unwrap();
        let config = WalConfig {
            mode: WalMode::Write,
            dir: dir.clone(),
            rows_per_wal,
            ..Default::default()
        };
        let wal = Wal::start(config, Uuid::new_v4(), VClock::new()).unwrap();
        let ctx = TxnContext::new(Some(Arc::clone(&wal)), 1, VClock::new());
        let engine = MemoryEngine::new();
        let data = Space::new(DATA_SPACE, "data", engine.clone());
        let txn_log = Space::new(TXN_LOG_SPACE, "txn_log", engine.clone());
        ctx.set_txn_log_space(txn_log);
        Self {
            _tmp: tmp,
            wal,
            ctx,
            engine,
            data,
            dir,
        }
    }

    fn session(&self) -> Session {
        Session::new(Arc::clone(&self.ctx))
    }

    fn tuple(&self, value: &'static [u8]) -> Bytes {
        encode_tuple(&[Bytes::from_static(value)]).unwrap()
    }

    async fn seed(&self, key: &'static [u8], value: &'static [u8]) {
        let mut session = self.session();
        let mut request = DmlRequest::insert(
            DATA_SPACE,
            Bytes::from_static(key),
            self.tuple(value),
        );
        session.apply(&self.data, &mut request).await.unwrap();
    }

    fn update_request(&self, key: &'static [u8], value: &'static [u8]) -> DmlRequest {
        let ops = [UpdateOp {
            op: b'=',
            field_no: 0,
            splice_pos: None,
            arg: Bytes::from_static(value),
        }];
        DmlRequest::update(DATA_SPACE, Bytes::from_static(key), &ops, 0).unwrap()
    }
}

/// Reads every frame of every log file, in file order.
fn read_frames(dir: &Path) -> Vec<Vec<Row>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "xlog"))
        .collect();
    paths.sort();
    let mut frames = Vec::new();
    for path in paths {
        let mut cursor = LogCursor::open(&path).unwrap();
        while let Some(rows) = cursor.next_frame().unwrap() {
            frames.push(rows);
        }
    }
    frames
}

// =============================================================================
// Scenario 1: single-row insert, mode = write
// =============================================================================

#[tokio::test]
async fn test_single_row_insert() {
    let harness = Harness::new(100);
    let mut session = harness.session();
    session.begin().unwrap();
    let mut request = DmlRequest::insert(
        DATA_SPACE,
        Bytes::from_static(b"k"),
        harness.tuple(b"hello"),
    );
    session.apply(&harness.data, &mut request).await.unwrap();
    let signature = session.commit().await.unwrap();
    assert_eq!(signature, 1);

    let vclock = harness.wal.checkpoint(false).await.unwrap();
    assert_eq!(vclock.get(1), 1);
    assert_eq!(vclock.sum(), 1);

    harness.wal.stop();
    assert!(harness.dir.join("00000000000000000000.xlog").exists());
    let frames = read_frames(&harness.dir);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), 1);
    assert_eq!(frames[0][0].op, OpKind::Insert);
    assert_eq!(frames[0][0].replica_id, 1);
    assert_eq!(frames[0][0].lsn, 1);
}

// =============================================================================
// Scenario 2: transactional multi-statement commit
// =============================================================================

#[tokio::test]
async fn test_multi_statement_commit_is_one_frame() {
    let harness = Harness::new(100);
    harness.seed(b"k", b"initial").await;

    let mut session = harness.session();
    session.begin().unwrap();
    let mut first = harness.update_request(b"k", b"second");
    session.apply(&harness.data, &mut first).await.unwrap();
    let mut second = harness.update_request(b"k", b"third");
    session.apply(&harness.data, &mut second).await.unwrap();
    let signature = session.commit().await.unwrap();
    assert_eq!(signature, 3);

    harness.wal.stop();
    let frames = read_frames(&harness.dir);
    // The seed frame, then both updates in a single frame.
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].len(), 2);
    assert_eq!(frames[1][0].lsn, 2);
    assert_eq!(frames[1][1].lsn, 3);
    assert!(frames[1].iter().all(|row| row.op == OpKind::Update));
    assert_eq!(
        harness.engine.get(DATA_SPACE, b"k").unwrap(),
        harness.tuple(b"third")
    );
}

// =============================================================================
// Scenario 3: rotation
// =============================================================================

#[tokio::test]
async fn test_rotation_after_rows_per_wal() {
    let harness = Harness::new(2);
    let (notify, mut events) = tokio::sync::mpsc::unbounded_channel();
    let watcher = harness.wal.set_watcher(notify);

    for key in [b"a" as &[u8; 1], b"b", b"c"] {
        let mut session = harness.session();
        let mut request = DmlRequest::insert(
            DATA_SPACE,
            Bytes::copy_from_slice(&key[..]),
            harness.tuple(b"v"),
        );
        session.apply(&harness.data, &mut request).await.unwrap();
    }
    harness.wal.clear_watcher(&watcher);
    harness.wal.stop();

    let first = harness.dir.join("00000000000000000000.xlog");
    let second = harness.dir.join("00000000000000000002.xlog");
    assert!(first.exists());
    assert!(second.exists());

    // The first file holds two rows and a clean EOF marker; the third row
    // landed in the second file.
    let mut cursor = LogCursor::open(&first).unwrap();
    let mut rows = 0;
    while let Some(frame) = cursor.next_frame().unwrap() {
        rows += frame.len();
    }
    assert_eq!(rows, 2);
    assert!(cursor.eof_marker_seen());

    let mut cursor = LogCursor::open(&second).unwrap();
    assert_eq!(cursor.next_frame().unwrap().unwrap().len(), 1);

    let mut notified = 0;
    while events.try_recv().is_ok() {
        notified += 1;
    }
    assert!(notified >= 3, "expected one notification per batch");
}

// =============================================================================
// Scenario 4: cascading rollback
// =============================================================================

#[tokio::test]
async fn test_cascading_rollback() {
    let harness = Harness::new(2);
    let mut session = harness.session();

    let mut sig1 = 0;
    let mut sig2 = 0;
    for (key, sig) in [(b"a" as &[u8; 1], &mut sig1), (b"b", &mut sig2)] {
        session.begin().unwrap();
        let mut request = DmlRequest::insert(
            DATA_SPACE,
            Bytes::copy_from_slice(&key[..]),
            harness.tuple(b"v"),
        );
        session.apply(&harness.data, &mut request).await.unwrap();
        *sig = session.commit().await.unwrap();
    }
    assert!(sig1 < sig2);

    // The first file is full; hide the directory so the rotation fails.
    let hidden = harness.dir.with_file_name("hidden");
    std::fs::rename(&harness.dir, &hidden).unwrap();

    let mut third = DmlRequest::insert(DATA_SPACE, Bytes::from_static(b"c"), harness.tuple(b"v"));
    let err = session.apply(&harness.data, &mut third).await.unwrap_err();
    assert!(matches!(err, Error::WalIo));
    assert!(
        harness.engine.get(DATA_SPACE, b"c").is_none(),
        "the failed statement must be rolled back"
    );

    let mut fourth = DmlRequest::insert(DATA_SPACE, Bytes::from_static(b"d"), harness.tuple(b"v"));
    let err = session.apply(&harness.data, &mut fourth).await.unwrap_err();
    assert!(matches!(err, Error::WalIo));
    assert!(harness.engine.get(DATA_SPACE, b"d").is_none());

    // Restore the directory: the writer must be back to normal.
    std::fs::rename(&hidden, &harness.dir).unwrap();
    let mut fifth = DmlRequest::insert(DATA_SPACE, Bytes::from_static(b"e"), harness.tuple(b"v"));
    session.apply(&harness.data, &mut fifth).await.unwrap();
    assert!(harness.engine.get(DATA_SPACE, b"e").is_some());
    harness.wal.stop();
}

// =============================================================================
// Scenario 5: two-phase commit, happy path
// =============================================================================

#[tokio::test]
async fn test_two_phase_commit_log_sequence() {
    let harness = Harness::new(100);
    harness.seed(b"k", b"initial").await;

    let mut session = harness.session();
    session.begin_two_phase(7, 2).unwrap();
    let mut update = harness.update_request(b"k", b"updated");
    session.apply(&harness.data, &mut update).await.unwrap();
    session.prepare_two_phase().await.unwrap();
    session.commit().await.unwrap();

    assert_eq!(
        harness.engine.get(DATA_SPACE, b"k").unwrap(),
        harness.tuple(b"updated")
    );
    // The bookkeeping row was scrubbed after the durable outcome.
    assert!(harness
        .engine
        .get(TXN_LOG_SPACE, &7u64.to_le_bytes())
        .is_none());

    harness.wal.stop();
    let frames = read_frames(&harness.dir);
    assert_eq!(frames.len(), 6);

    // Seed.
    assert_eq!(frames[0][0].op, OpKind::Insert);
    // Bookkeeping insert (tx_id, coordinator, "prepare").
    assert_eq!(frames[1][0].op, OpKind::Insert);
    let fields = decode_tuple(&frames[1][0].bodies[2]).unwrap();
    assert_eq!(&fields[0][..], &7u64.to_le_bytes());
    assert_eq!(&fields[1][..], &2u32.to_le_bytes());
    assert_eq!(&fields[2][..], b"prepare");
    // One atomic frame: the PREPARE header followed by the update row.
    assert_eq!(frames[2].len(), 2);
    assert_eq!(frames[2][0].op, OpKind::Prepare);
    assert_eq!(frames[2][0].tx_id, 7);
    assert_eq!(frames[2][0].coordinator_id, 2);
    assert_eq!(frames[2][1].op, OpKind::Update);
    assert_eq!(frames[2][1].tx_id, 7);
    // The COMMIT marker for transaction 7.
    assert_eq!(frames[3][0].op, OpKind::Commit);
    assert_eq!(frames[3][0].tx_id, 7);
    // Bookkeeping update of the state field to "commit".
    assert_eq!(frames[4][0].op, OpKind::Update);
    // Bookkeeping delete.
    assert_eq!(frames[5][0].op, OpKind::Delete);
}

#[tokio::test]
async fn test_two_phase_commit_without_redo_rows_reaches_terminal_state() {
    let harness = Harness::new(100);
    let scratch = Space::temporary(600, "scratch", harness.engine.clone());

    // The transaction binds an engine but logs nothing: temporary-space
    // mutations produce no redo rows.
    let mut session = harness.session();
    session.begin_two_phase(11, 2).unwrap();
    let mut request = DmlRequest::insert(600, Bytes::from_static(b"k"), harness.tuple(b"v"));
    session.apply(&scratch, &mut request).await.unwrap();
    assert_eq!(session.txn().unwrap().n_rows(), 0);
    session.prepare_two_phase().await.unwrap();
    session.commit().await.unwrap();

    assert!(harness.engine.get(600, b"k").is_some());
    // The prepare's bookkeeping entry must not dangle.
    assert!(harness
        .engine
        .get(TXN_LOG_SPACE, &11u64.to_le_bytes())
        .is_none());

    harness.wal.stop();
    let frames = read_frames(&harness.dir);
    // Bookkeeping insert, COMMIT marker (no prepare data frame), then the
    // bookkeeping update and delete.
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0][0].op, OpKind::Insert);
    assert_eq!(frames[1][0].op, OpKind::Commit);
    assert_eq!(frames[1][0].tx_id, 11);
    assert_eq!(frames[2][0].op, OpKind::Update);
    assert_eq!(frames[3][0].op, OpKind::Delete);
}

// =============================================================================
// Scenario 6: two-phase rollback after prepare
// =============================================================================

#[tokio::test]
async fn test_two_phase_rollback_after_prepare() {
    let harness = Harness::new(100);
    harness.seed(b"k", b"initial").await;

    let mut session = harness.session();
    session.begin_two_phase(9, 2).unwrap();
    let mut update = harness.update_request(b"k", b"doomed");
    session.apply(&harness.data, &mut update).await.unwrap();
    session.prepare_two_phase().await.unwrap();
    session.rollback().await.unwrap();

    // The engine rolled the speculative update back.
    assert_eq!(
        harness.engine.get(DATA_SPACE, b"k").unwrap(),
        harness.tuple(b"initial")
    );
    assert!(harness
        .engine
        .get(TXN_LOG_SPACE, &9u64.to_le_bytes())
        .is_none());

    harness.wal.stop();
    let frames = read_frames(&harness.dir);
    assert_eq!(frames.len(), 6);
    assert_eq!(frames[2][0].op, OpKind::Prepare);
    assert_eq!(frames[3][0].op, OpKind::Rollback);
    assert_eq!(frames[3][0].tx_id, 9);
    // Bookkeeping state update, then the delete.
    assert_eq!(frames[4][0].op, OpKind::Update);
    assert_eq!(frames[5][0].op, OpKind::Delete);
}

// =============================================================================
// Laws
// =============================================================================

#[tokio::test]
async fn test_empty_commit_writes_no_frame() {
    let harness = Harness::new(100);
    harness.seed(b"k", b"v").await;

    let mut session = harness.session();
    session.begin().unwrap();
    let signature = session.commit().await.unwrap();
    assert_eq!(signature, 1, "signature is the current vclock sum");

    harness.wal.stop();
    assert_eq!(read_frames(&harness.dir).len(), 1, "only the seed frame");
}

#[tokio::test]
async fn test_acknowledgements_are_fifo_per_task() {
    let harness = Harness::new(1000);
    let mut signatures = Vec::new();
    for i in 0..10u8 {
        let mut session = harness.session();
        let mut request = DmlRequest::insert(
            DATA_SPACE,
            Bytes::copy_from_slice(&[i]),
            harness.tuple(b"v"),
        );
        session.begin().unwrap();
        session.apply(&harness.data, &mut request).await.unwrap();
        signatures.push(session.commit().await.unwrap());
    }
    let mut sorted = signatures.clone();
    sorted.sort_unstable();
    assert_eq!(signatures, sorted, "signatures must be monotone");
    harness.wal.stop();
}
