//! Embedded transactional key-value store in a single memory-mapped file.
//!
//! Keys are kept in a copy-on-write B+Tree. Any number of read transactions
//! run against stable snapshots while one write transaction at a time
//! prepares the next version, published atomically on commit.

mod btree;
mod constants;
mod cursor;
mod env;
mod error;
mod freelist;
mod lock;
mod map;
mod meta;
mod midl;
mod page;
mod reader;
mod transaction;
mod types;

pub use constants::{EnvFlags, Pgno, Txnid, WriteFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_READERS, MAX_KEY_SIZE, PAGE_SIZE};
pub use cursor::Cursor;
pub use env::Environment;
pub use error::{Error, Result};
pub use transaction::Transaction;
pub use types::{CursorOp, EnvInfo, ReaderInfo, Stat};
