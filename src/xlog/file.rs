//! Append-only log file.
//!
//! Rows accumulate in an in-memory block. An auto-commit block may be
//! flushed to disk whenever it grows past a threshold; a transactional block
//! (opened with [`LogFile::begin_tx`]) is flushed only as a whole, so a
//! transaction is never split across frames. The file records the byte
//! offset of the last fully written frame; a partial write truncates the
//! file back to that offset, which is what makes the "a transaction is
//! entirely in the file or not at all" contract hold even when a single
//! write call cannot cover the whole frame.
//!
//! New files carry the `.inprogress` suffix. A clean close writes the EOF
//! marker and renames the file to its final name if it holds at least one
//! committed row; an empty file is deleted instead.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Seek, SeekFrom, Write};
use std::mem;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::row::{server_clock_micros, Row};
use crate::vclock::VClock;
use crate::xlog::frame::{self, EncodedFrame};

/// File format name written on the first header line.
pub const LOG_FILETYPE: &str = "XLOG";
/// Snapshot format name.
pub const SNAP_FILETYPE: &str = "SNAP";
/// Format version written on the second header line.
pub const LOG_VERSION: &str = "1.0";
/// Suffix of files still open for writing.
pub const INPROGRESS_SUFFIX: &str = ".inprogress";

/// An auto-commit block is written out once it grows past this.
const BLOCK_FLUSH_THRESHOLD: usize = 64 * 1024;

/// The current in-memory accumulation block.
#[derive(Debug)]
struct Block {
    /// When true the block may be flushed at any point; when false the
    /// block holds an open transaction and must reach the file whole.
    is_autocommit: bool,
    /// Rollback marks taken at `begin_tx`.
    tx_start: usize,
    tx_rows_start: u32,
    n_rows: u32,
    buf: Vec<u8>,
}

impl Block {
    fn new() -> Self {
        Self {
            is_autocommit: true,
            tx_start: 0,
            tx_rows_start: 0,
            n_rows: 0,
            buf: Vec::new(),
        }
    }
}

/// A single log file open for writing.
#[derive(Debug)]
pub struct LogFile {
    /// None after `atfork`: the handle is invalidated without being closed.
    file: Option<File>,
    path: PathBuf,
    final_path: PathBuf,
    is_inprogress: bool,
    fsync_on_flush: bool,
    server_uuid: Uuid,
    vclock: VClock,
    /// Committed row count; bumped by the writer after acknowledgement
    /// bookkeeping, used for rotation decisions.
    rows: i64,
    /// Current write position.
    offset: u64,
    /// End of the last fully written frame. Everything at or below this
    /// offset survives a partial-write truncation.
    committed_offset: u64,
    block: Block,
}

impl LogFile {
    /// Creates `final_path.inprogress`, writes the text header and primes an
    /// empty block. `open_sync` requests `O_SYNC` semantics (fsync mode).
    pub fn create(
        final_path: &Path,
        server_uuid: Uuid,
        vclock: &VClock,
        fsync_on_flush: bool,
        open_sync: bool,
    ) -> Result<Self> {
        let mut path = final_path.as_os_str().to_owned();
        path.push(INPROGRESS_SUFFIX);
        let path = PathBuf::from(path);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        if open_sync {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_SYNC);
        }
        #[cfg(not(unix))]
        let _ = open_sync;
        let mut file = options.open(&path)?;

        let filetype = if final_path.extension().is_some_and(|e| e == "snap") {
            SNAP_FILETYPE
        } else {
            LOG_FILETYPE
        };
        let header = format!(
            "{filetype}\n{LOG_VERSION}\nServer: {server_uuid}\nVClock: {vclock}\n\n"
        );
        file.write_all(header.as_bytes())?;
        let offset = header.len() as u64;

        Ok(Self {
            file: Some(file),
            path,
            final_path: final_path.to_path_buf(),
            is_inprogress: true,
            fsync_on_flush,
            server_uuid,
            vclock: vclock.clone(),
            rows: 0,
            offset,
            committed_offset: offset,
            block: Block::new(),
        })
    }

    /// Vector clock the file was created with.
    pub fn vclock(&self) -> &VClock {
        &self.vclock
    }

    pub fn server_uuid(&self) -> Uuid {
        self.server_uuid
    }

    /// Committed rows in this file.
    pub fn rows(&self) -> i64 {
        self.rows
    }

    /// True while the file still carries the `.inprogress` suffix.
    pub fn is_inprogress(&self) -> bool {
        self.is_inprogress
    }

    /// Called by the writer once a request's rows have been acknowledged.
    pub fn add_rows(&mut self, n: i64) {
        self.rows += n;
    }

    /// Marks the current block non-autocommit: rows appended from here on
    /// form one transactional frame that reaches the file atomically.
    pub fn begin_tx(&mut self) {
        debug_assert!(self.block.is_autocommit, "nested begin_tx");
        self.block.is_autocommit = false;
        self.block.tx_start = self.block.buf.len();
        self.block.tx_rows_start = self.block.n_rows;
    }

    /// Appends an encoded row to the block. Returns the number of bytes
    /// written to the file, 0 while the block keeps accumulating.
    pub fn write_row(&mut self, row: &Row) -> Result<usize> {
        let encoded = row.encode()?;
        self.block.buf.extend_from_slice(&encoded);
        self.block.n_rows += 1;
        if self.block.is_autocommit && self.block.buf.len() >= BLOCK_FLUSH_THRESHOLD {
            return self.flush_block();
        }
        Ok(0)
    }

    /// Closes the transactional section of the block. The block is written
    /// out if it crossed the flush threshold; otherwise it stays buffered
    /// (and may be joined by later small transactions) until [`flush`].
    ///
    /// Returns the number of bytes written to the file, 0 if still buffered.
    ///
    /// [`flush`]: LogFile::flush
    pub fn commit_tx(&mut self) -> Result<usize> {
        debug_assert!(!self.block.is_autocommit, "commit_tx without begin_tx");
        self.block.is_autocommit = true;
        if self.block.buf.len() >= BLOCK_FLUSH_THRESHOLD {
            return self.flush_block();
        }
        Ok(0)
    }

    /// Discards the rows appended since [`begin_tx`] without touching the
    /// file.
    ///
    /// [`begin_tx`]: LogFile::begin_tx
    pub fn rollback_tx(&mut self) {
        self.block.buf.truncate(self.block.tx_start);
        self.block.n_rows = self.block.tx_rows_start;
        self.block.is_autocommit = true;
    }

    /// Drops every buffered row that has not reached the file. Used by the
    /// writer when it abandons the requests those rows belong to: without
    /// this, a later flush would leak rows of rolled-back transactions into
    /// the log.
    pub fn discard_buffered(&mut self) {
        self.block = Block::new();
    }

    /// Drains the block to the file and syncs when the file was opened in
    /// fsync mode. Any truncation caused by a partial write has already been
    /// applied when this returns.
    pub fn flush(&mut self) -> Result<usize> {
        debug_assert!(self.block.is_autocommit, "flush inside an open tx");
        let written = self.flush_block()?;
        if self.fsync_on_flush {
            self.handle()?.sync_data()?;
        }
        Ok(written)
    }

    /// Writes the EOF marker, flushes, syncs and renames the file to its
    /// final name. A file with zero committed rows is deleted instead of
    /// renamed. With `drop_inprogress` the file is discarded outright.
    pub fn close(mut self, drop_inprogress: bool) -> Result<()> {
        if drop_inprogress {
            self.file = None;
            std::fs::remove_file(&self.path)?;
            return Ok(());
        }
        self.flush_block()?;
        let marker = frame::eof_marker();
        let file = self.handle()?;
        file.write_all(&marker)?;
        file.sync_all()?;
        self.file = None;
        if self.rows > 0 {
            std::fs::rename(&self.path, &self.final_path)?;
        } else {
            std::fs::remove_file(&self.path)?;
        }
        self.is_inprogress = false;
        Ok(())
    }

    /// Invalidates the file handle without closing it. Called in a forked
    /// child so its exit path cannot flush or EOF-mark the parent's log.
    /// The descriptor is deliberately leaked.
    pub fn atfork(&mut self) {
        if let Some(file) = self.file.take() {
            mem::forget(file);
        }
    }

    fn handle(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "log file handle was invalidated",
            ))
        })
    }

    /// Encodes the accumulated block as one frame and writes it out.
    fn flush_block(&mut self) -> Result<usize> {
        if self.block.buf.is_empty() {
            return Ok(0);
        }
        let payload = mem::take(&mut self.block.buf);
        let n_rows = self.block.n_rows;
        self.block = Block::new();
        let encoded = frame::encode_frame(payload, n_rows, server_clock_micros())?;
        self.write_frame(&encoded)
    }

    /// Writes one frame with a vectored write, falling back to plain writes
    /// for any remainder. On failure the file is truncated back to the last
    /// fully written frame before the error is returned.
    fn write_frame(&mut self, encoded: &EncodedFrame) -> Result<usize> {
        let total = encoded.len();
        let result = (|| -> std::io::Result<()> {
            let file = match self.file.as_mut() {
                Some(f) => f,
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "log file handle was invalidated",
                    ))
                }
            };
            let parts: [&[u8]; 3] = [&encoded.head, &encoded.payload, &encoded.crc];
            let slices = [
                IoSlice::new(parts[0]),
                IoSlice::new(parts[1]),
                IoSlice::new(parts[2]),
            ];
            let mut written = file.write_vectored(&slices)?;
            while written < total {
                let (part, offset) = locate(&parts, written);
                let n = file.write(&parts[part][offset..])?;
                if n == 0 {
                    return Err(std::io::ErrorKind::WriteZero.into());
                }
                written += n;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.offset += total as u64;
                self.committed_offset = self.offset;
                Ok(total)
            }
            Err(err) => {
                self.truncate_to_committed();
                Err(Error::Io(err))
            }
        }
    }

    /// Shrinks the file back to the end of the last fully written frame.
    fn truncate_to_committed(&mut self) {
        let committed = self.committed_offset;
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = file
                .set_len(committed)
                .and_then(|()| file.seek(SeekFrom::Start(committed)).map(|_| ()))
            {
                warn!(
                    file = %self.path.display(),
                    error = %err,
                    "failed to truncate log after a partial write"
                );
            }
        }
        self.offset = committed;
    }
}

/// Maps a byte count already written into (part index, offset inside part).
fn locate(parts: &[&[u8]; 3], written: usize) -> (usize, usize) {
    let mut remaining = written;
    for (i, part) in parts.iter().enumerate() {
        if remaining < part.len() {
            return (i, remaining);
        }
        remaining -= part.len();
    }
    (parts.len() - 1, parts[parts.len() - 1].len())
}
