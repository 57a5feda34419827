//! Read cursor over a log file.
//!
//! The cursor is the boundary consumed by recovery and replication relays:
//! it parses the text header into [`LogMeta`] and iterates frames into rows.
//! A truncated tail (the writer crashed mid-frame, or the file is still being
//! appended to) reads as end-of-file; only a checksum or structure mismatch
//! inside a complete frame is reported as corruption.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::row::Row;
use crate::vclock::VClock;
use crate::xlog::frame::{self, FLAG_ZLIB, FRAME_HEADER_SIZE};

/// Parsed text header of a log file.
#[derive(Debug, Clone)]
pub struct LogMeta {
    pub filetype: String,
    pub version: String,
    pub server_uuid: Uuid,
    pub vclock: VClock,
}

/// Sequential reader over one log file.
pub struct LogCursor {
    reader: BufReader<File>,
    path: PathBuf,
    meta: LogMeta,
    offset: u64,
    eof_marker_seen: bool,
    pending: VecDeque<Row>,
}

impl LogCursor {
    /// Opens a log file and parses its text header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut offset = 0u64;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                return Err(Error::InvalidHeader {
                    file: path.to_path_buf(),
                    reason: "unterminated text header".into(),
                });
            }
            offset += n as u64;
            let line = line.trim_end_matches('\n');
            if line.is_empty() {
                break;
            }
            lines.push(line.to_string());
        }

        let meta = parse_meta(path, &lines)?;
        Ok(Self {
            reader,
            path: path.to_path_buf(),
            meta,
            offset,
            eof_marker_seen: false,
            pending: VecDeque::new(),
        })
    }

    pub fn meta(&self) -> &LogMeta {
        &self.meta
    }

    /// True once the clean end-of-file marker has been read.
    pub fn eof_marker_seen(&self) -> bool {
        self.eof_marker_seen
    }

    /// Reads the next frame, returning all of its rows. `None` at end of
    /// file, whether clean (EOF marker) or truncated.
    pub fn next_frame(&mut self) -> Result<Option<Vec<Row>>> {
        if self.eof_marker_seen {
            return Ok(None);
        }
        let frame_offset = self.offset;

        let mut magic_buf = [0u8; 4];
        match read_exact_or_eof(&mut self.reader, &mut magic_buf)? {
            ReadTail::Complete => {}
            ReadTail::Truncated => return Ok(None),
        }
        let magic = u32::from_le_bytes(magic_buf);
        if magic == frame::EOF_MAGIC {
            self.eof_marker_seen = true;
            self.offset += 4;
            return Ok(None);
        }
        if magic != frame::FRAME_MAGIC {
            return Err(self.corrupt(frame_offset));
        }

        let mut head = [0u8; FRAME_HEADER_SIZE];
        head[0..4].copy_from_slice(&magic_buf);
        if matches!(
            read_exact_or_eof(&mut self.reader, &mut head[4..])?,
            ReadTail::Truncated
        ) {
            return Ok(None);
        }
        let payload_len = u32::from_le_bytes(head[4..8].try_into().unwrap()) as usize;
        let n_rows = u32::from_le_bytes(head[8..12].try_into().unwrap());
        let flags = head[20];

        let mut payload = vec![0u8; payload_len];
        if matches!(
            read_exact_or_eof(&mut self.reader, &mut payload)?,
            ReadTail::Truncated
        ) {
            return Ok(None);
        }
        let mut crc_buf = [0u8; 4];
        if matches!(
            read_exact_or_eof(&mut self.reader, &mut crc_buf)?,
            ReadTail::Truncated
        ) {
            return Ok(None);
        }

        if !frame::verify_crc(&head, &payload, u32::from_le_bytes(crc_buf)) {
            return Err(self.corrupt(frame_offset));
        }
        let payload = if flags & FLAG_ZLIB != 0 {
            frame::decompress(&payload).map_err(|_| self.corrupt(frame_offset))?
        } else {
            payload
        };
        let rows =
            frame::parse_rows(&payload, n_rows).map_err(|_| self.corrupt(frame_offset))?;

        self.offset = frame_offset + FRAME_HEADER_SIZE as u64 + payload_len as u64 + 4;
        Ok(Some(rows))
    }

    /// Reads the next row, crossing frame boundaries transparently.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            match self.next_frame()? {
                Some(rows) => self.pending.extend(rows),
                None => return Ok(None),
            }
        }
    }

    fn corrupt(&self, offset: u64) -> Error {
        Error::CorruptFrame {
            file: self.path.clone(),
            offset,
        }
    }
}

enum ReadTail {
    Complete,
    Truncated,
}

/// `read_exact` that reports a clean "ran off the end" instead of an error.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadTail> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(ReadTail::Truncated);
        }
        filled += n;
    }
    Ok(ReadTail::Complete)
}

fn parse_meta(path: &Path, lines: &[String]) -> Result<LogMeta> {
    let invalid = |reason: &str| Error::InvalidHeader {
        file: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if lines.len() < 2 {
        return Err(invalid("missing filetype or version line"));
    }
    let filetype = lines[0].clone();
    let version = lines[1].clone();
    let mut server_uuid = None;
    let mut vclock = None;
    for line in &lines[2..] {
        let Some((key, value)) = line.split_once(':') else {
            return Err(invalid(&format!("malformed header line: {line:?}")));
        };
        match key.trim() {
            "Server" => {
                server_uuid = Some(
                    Uuid::parse_str(value.trim())
                        .map_err(|e| invalid(&format!("bad server uuid: {e}")))?,
                );
            }
            "VClock" => {
                vclock = Some(
                    value
                        .trim()
                        .parse::<VClock>()
                        .map_err(|e| invalid(&format!("bad vclock: {e}")))?,
                );
            }
            // Unknown keys are carried by newer writers; skip them.
            _ => {}
        }
    }
    Ok(LogMeta {
        filetype,
        version,
        server_uuid: server_uuid.ok_or_else(|| invalid("missing Server line"))?,
        vclock: vclock.ok_or_else(|| invalid("missing VClock line"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::OpKind;
    use crate::xlog::file::LogFile;
    use bytes::Bytes;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_log(dir: &Path, rows: &[i64]) -> PathBuf {
        let final_path = dir.join("00000000000000000000.xlog");
        let mut vclock = VClock::new();
        vclock.follow(1, 7).unwrap();
        let mut log =
            LogFile::create(&final_path, Uuid::new_v4(), &vclock, false, false).unwrap();
        for &lsn in rows {
            log.begin_tx();
            let mut row = Row::new(OpKind::Insert, vec![Bytes::from_static(b"x")]);
            row.replica_id = 1;
            row.lsn = lsn;
            log.write_row(&row).unwrap();
            log.commit_tx().unwrap();
        }
        log.flush().unwrap();
        log.add_rows(rows.len() as i64);
        log.close(false).unwrap();
        final_path
    }

    #[test]
    fn test_meta_round_trip() {
        let dir = tempdir().unwrap();
        let path = write_log(dir.path(), &[8]);
        let cursor = LogCursor::open(&path).unwrap();
        assert_eq!(cursor.meta().filetype, "XLOG");
        assert_eq!(cursor.meta().vclock.get(1), 7);
    }

    #[test]
    fn test_rows_and_clean_eof() {
        let dir = tempdir().unwrap();
        let path = write_log(dir.path(), &[8, 9, 10]);
        let mut cursor = LogCursor::open(&path).unwrap();
        let mut lsns = Vec::new();
        while let Some(row) = cursor.next_row().unwrap() {
            lsns.push(row.lsn);
        }
        assert_eq!(lsns, vec![8, 9, 10]);
        assert!(cursor.eof_marker_seen());
    }

    #[test]
    fn test_truncated_tail_is_eof_not_corruption() {
        let dir = tempdir().unwrap();
        let path = write_log(dir.path(), &[8]);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        // Chop the EOF marker and half of the frame's checksum.
        file.set_len(len - 6).unwrap();
        let mut cursor = LogCursor::open(&path).unwrap();
        assert!(cursor.next_frame().unwrap().is_none());
        assert!(!cursor.eof_marker_seen());
    }

    #[test]
    fn test_bit_flip_is_corruption() {
        let dir = tempdir().unwrap();
        let path = write_log(dir.path(), &[8]);
        let data = std::fs::read(&path).unwrap();
        let mut mangled = data.clone();
        // Flip a payload byte inside the only frame.
        let idx = mangled.len() - 10;
        mangled[idx] ^= 0x01;
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(&mangled).unwrap();
        let mut cursor = LogCursor::open(&path).unwrap();
        assert!(matches!(
            cursor.next_frame(),
            Err(Error::CorruptFrame { .. })
        ));
    }

    #[test]
    fn test_garbage_header_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.xlog");
        std::fs::write(&path, b"XLOG\n1.0\nServer: not-a-uuid\nVClock: {}\n\n").unwrap();
        assert!(matches!(
            LogCursor::open(&path),
            Err(Error::InvalidHeader { .. })
        ));
    }
}
