//! # Stratum Storage Engine
//! An embedded, single-process, disk-backed ordered key-value store.
//! Keys and values are typed through pluggable codecs; data lives in a paged
//! B+ tree behind a pinned buffer pool, and every mutation is recorded in a
//! write-ahead log before it is acknowledged.

/// The B+ tree index over pages.
pub mod btree;
/// The buffer pool manager.
pub mod buffer_pool;
/// Key/value codecs and key ordering.
pub mod codec;
/// The database facade with transactions.
pub mod db;
/// Disk I/O for fixed-size pages.
pub mod disk;
/// Error types.
pub mod error;
/// Node layout and page body encoding.
pub mod node;
/// The page structure and pin accounting.
pub mod page;
/// Offline tree rebalancing.
pub mod rebalance;
/// Transactions and the transaction manager.
pub mod transaction;
/// The Write-Ahead Log.
pub mod wal;

/// The size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;

pub use btree::{BPlusTree, TreeStats};
pub use codec::{
    Codec, DoubleCodec, DoubleOrder, IntCodec, KeyOrder, LongCodec, NaturalOrder, OrderFn,
    SerdeCodec, StringCodec,
};
pub use db::{Database, Options};
pub use error::{Error, Result};
pub use page::{Page, PageId};
pub use rebalance::Rebalancer;
pub use transaction::{Transaction, TxState};
pub use wal::{OpKind, Wal, WalEntry};
