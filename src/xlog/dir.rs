//! Typed log directory.
//!
//! A directory object sees only the files matching its type (write-ahead
//! logs or snapshots) and keeps a sorted index of their vector-clock
//! signatures. `scan` populates the index; `create_log` allocates
//! `<signature>.<ext>.inprogress` for a new file and never reuses an
//! existing signature.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::common::Signature;
use crate::error::{Error, Result};
use crate::vclock::VClock;
use crate::xlog::cursor::LogCursor;
use crate::xlog::file::{LogFile, INPROGRESS_SUFFIX, LOG_FILETYPE, SNAP_FILETYPE};

/// What a directory object looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirType {
    Log,
    Snapshot,
}

impl DirType {
    fn extension(&self) -> &'static str {
        match self {
            DirType::Log => "xlog",
            DirType::Snapshot => "snap",
        }
    }

    fn filetype(&self) -> &'static str {
        match self {
            DirType::Log => LOG_FILETYPE,
            DirType::Snapshot => SNAP_FILETYPE,
        }
    }
}

/// A handle for a data directory with write-ahead logs or snapshots.
#[derive(Debug)]
pub struct LogDir {
    path: PathBuf,
    dir_type: DirType,
    server_uuid: Uuid,
    /// When false, files that fail to parse during `scan` are skipped with a
    /// warning; when true the scan fails on the first bad file.
    pub panic_if_error: bool,
    /// Open new files with synchronous-write semantics (fsync mode).
    open_sync: bool,
    /// Files present in the directory, keyed by vclock signature.
    index: BTreeMap<Signature, VClock>,
}

impl LogDir {
    pub fn new(path: &Path, dir_type: DirType, server_uuid: Uuid) -> Self {
        Self {
            path: path.to_path_buf(),
            dir_type,
            server_uuid,
            panic_if_error: false,
            open_sync: false,
            index: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn server_uuid(&self) -> Uuid {
        self.server_uuid
    }

    /// Request `O_SYNC` on files created in this directory.
    pub fn set_open_sync(&mut self, on: bool) {
        self.open_sync = on;
    }

    /// Checks that the directory exists and is writable.
    pub fn check(&self) -> Result<()> {
        let meta = fs::metadata(&self.path)?;
        if !meta.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a directory", self.path.display()),
            )));
        }
        let probe = self.path.join(".writable_check");
        fs::File::create(&probe)?;
        fs::remove_file(&probe)?;
        Ok(())
    }

    /// Enumerates files matching the directory type, parses each header and
    /// rebuilds the signature index.
    pub fn scan(&mut self) -> Result<()> {
        let mut index = BTreeMap::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(INPROGRESS_SUFFIX) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(self.dir_type.extension()) {
                continue;
            }
            match self.examine(&path) {
                Ok((signature, vclock)) => {
                    index.insert(signature, vclock);
                }
                Err(err) if self.panic_if_error => return Err(err),
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping unreadable log file");
                }
            }
        }
        self.index = index;
        Ok(())
    }

    /// Signatures currently in the index, ascending.
    pub fn signatures(&self) -> impl Iterator<Item = Signature> + '_ {
        self.index.keys().copied()
    }

    /// The greatest signature in the index.
    pub fn last_signature(&self) -> Option<Signature> {
        self.index.keys().next_back().copied()
    }

    /// Vector clock of the file with the given signature.
    pub fn lookup(&self, signature: Signature) -> Option<&VClock> {
        self.index.get(&signature)
    }

    /// Returns the path a file with this signature lives at.
    pub fn format_filename(&self, signature: Signature, inprogress: bool) -> PathBuf {
        let mut name = format!("{:020}.{}", signature, self.dir_type.extension());
        if inprogress {
            name.push_str(INPROGRESS_SUFFIX);
        }
        self.path.join(name)
    }

    /// Creates a new log at the given vector clock. The signature must not
    /// collide with an existing file: old files are never appended to.
    pub fn create_log(&mut self, vclock: &VClock) -> Result<LogFile> {
        let signature = vclock.sum();
        let final_path = self.format_filename(signature, false);
        if self.index.contains_key(&signature) || final_path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("log with signature {signature} already exists"),
            )));
        }
        LogFile::create(
            &final_path,
            self.server_uuid,
            vclock,
            self.open_sync,
            self.open_sync,
        )
    }

    /// Opens the file with the given signature for reading.
    pub fn open_log(&self, signature: Signature) -> Result<LogCursor> {
        LogCursor::open(&self.format_filename(signature, false))
    }

    /// Parses one file's header enough to index it.
    fn examine(&self, path: &Path) -> Result<(Signature, VClock)> {
        let cursor = LogCursor::open(path)?;
        let meta = cursor.meta();
        if meta.filetype != self.dir_type.filetype() {
            return Err(Error::InvalidHeader {
                file: path.to_path_buf(),
                reason: format!(
                    "filetype {} does not match directory type {}",
                    meta.filetype,
                    self.dir_type.filetype()
                ),
            });
        }
        if meta.server_uuid != self.server_uuid {
            return Err(Error::ServerUuidMismatch {
                file: path.to_path_buf(),
                found: meta.server_uuid,
                expected: self.server_uuid,
            });
        }
        let signature = meta.vclock.sum();
        let from_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<Signature>().ok());
        if from_name != Some(signature) {
            warn!(
                file = %path.display(),
                signature,
                "log file name does not match its header vclock"
            );
        }
        Ok((signature, meta.vclock.clone()))
    }
}
