//! Error types for the storage engine.

use std::fmt;

use thiserror::Error;

use crate::page::PageId;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in storage engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid page id")]
    InvalidPageId,

    #[error("page {0} was never loaded into the buffer pool")]
    UnknownPage(PageId),

    #[error("buffer pool is full and all pages are pinned")]
    BufferPoolExhausted,

    #[error("cannot unpin page {0}: pin count is already zero")]
    PinUnderflow(PageId),

    #[error("data of {len} bytes exceeds the page size")]
    PageOverflow { len: usize },

    #[error("database is closed")]
    Closed,

    #[error("transaction {0} is not active")]
    TransactionNotActive(u64),

    #[error("corrupted data: {0}")]
    Corruption(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("compare-and-set failed for key {key}: expected {expected} but found {actual}")]
    CompareAndSetFailed {
        key: String,
        expected: String,
        actual: String,
    },
}

impl Error {
    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption(message.into())
    }

    pub(crate) fn cas_failed<K: fmt::Debug, V: fmt::Debug>(
        key: &K,
        expected: &Option<V>,
        actual: &Option<V>,
    ) -> Self {
        fn render<T: fmt::Debug>(value: &Option<T>) -> String {
            match value {
                Some(v) => format!("{v:?}"),
                None => "<absent>".to_string(),
            }
        }

        Error::CompareAndSetFailed {
            key: format!("{key:?}"),
            expected: render(expected),
            actual: render(actual),
        }
    }
}
