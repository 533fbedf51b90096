use std::path::PathBuf;

/// Errors produced by cache operations and maintenance.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache directory {} does not exist and could not be created", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("key not found")]
    KeyNotFound,

    #[error("value is not an opaque serialized payload")]
    NotOpaque,

    #[error("unknown eviction policy {name:?}")]
    UnknownEvictionPolicy { name: String },

    #[error("cache row {rowid} is malformed (storage mode {mode})")]
    MalformedRow { rowid: i64, mode: i64 },
}

impl CacheError {
    /// A payload file that disappeared between the row lookup and the read.
    ///
    /// Treated as a miss by the read protocol: another process may have
    /// deleted the entry after we fetched its row.
    pub(crate) fn is_missing_file(&self) -> bool {
        matches!(self, CacheError::Io(err) if err.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
