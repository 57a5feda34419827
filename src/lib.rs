// rusty-wal - Durability core for in-memory databases
//
// Write-ahead logging and transaction management: every mutation that must
// survive a crash is serialized into a framed, checksummed record, appended
// to a log file by a dedicated writer thread, and acknowledged back to the
// originating task before its effects become visible.

pub mod bus;
pub mod common;
pub mod engine;
pub mod error;
pub mod request;
pub mod row;
pub mod session;
pub mod space;
pub mod txn;
pub mod vclock;
pub mod wal;
pub mod xlog;

pub use engine::{MemoryEngine, StorageEngine};
pub use error::{Error, Result};
pub use request::DmlRequest;
pub use row::{OpKind, Row};
pub use session::Session;
pub use space::Space;
pub use txn::{LsnAssigner, TxnContext};
pub use vclock::VClock;
pub use wal::{Wal, WalConfig, WalMode};
pub use xlog::{LogCursor, LogDir};
