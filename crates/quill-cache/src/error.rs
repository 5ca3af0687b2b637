use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache management and persistence.
///
/// Read-side failures are handled internally (a corrupt or unreadable entry
/// is a cache miss); only write-side and programming errors reach callers.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("stored entry for key {key} failed to decode")]
    CorruptEntry { key: u32 },

    #[error("cache entry of {len} bytes exceeds the {limit} byte payload limit")]
    EntryTooLarge { len: usize, limit: usize },

    #[error("cache {name:?} is already open for this scope in this process")]
    AlreadyOpen { name: String },

    #[error("cache map at {path} is locked by another process")]
    MapLocked { path: PathBuf },

    #[error("invalid cache name {name:?}: expected a non-empty single path component")]
    InvalidCacheName { name: String },

    #[error("cache has already been closed")]
    Closed,
}
