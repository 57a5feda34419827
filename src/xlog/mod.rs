// On-disk log layer: frame codec, append-only log files, the typed log
// directory, and the read cursor.
//
// # Module Organization
//
// | Module | Responsibility |
// |--------|----------------|
// | [`frame`] | Frame encoding: magic, header, optional compression, CRC32 |
// | [`file`] | `LogFile`: append path with transactional block accumulation |
// | [`dir`] | `LogDir`: scan, signature index, new-file allocation |
// | [`cursor`] | `LogCursor`: read side, header meta and frame iteration |

pub mod cursor;
pub mod dir;
pub mod file;
pub mod frame;

pub use cursor::{LogCursor, LogMeta};
pub use dir::{DirType, LogDir};
pub use file::LogFile;
