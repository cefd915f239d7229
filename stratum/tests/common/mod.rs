use std::path::Path;
use std::sync::Arc;

use stratum::{Database, Options, StringCodec};

/// Opens a string-keyed database in `dir` with a small tree order so splits
/// happen early.
pub fn open_db(dir: &Path) -> Database<String, String> {
    Database::open_with(
        dir.join("data.db"),
        dir.join("wal.log"),
        Options {
            order: 4,
            buffer_pool_size: 128,
        },
        Arc::new(StringCodec),
        Arc::new(StringCodec),
        Arc::new(stratum::NaturalOrder),
    )
    .expect("open database")
}

pub fn s(value: &str) -> String {
    value.to_string()
}
