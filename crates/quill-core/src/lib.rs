//! Core shared types for Quill.
//!
//! This crate is intentionally small and dependency-free.

/// The Quill application version, taken from the workspace manifest.
pub const QUILL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A stable identifier for a file, allocated by the virtual file system.
///
/// Ids are small non-negative integers that stay stable for the lifetime of
/// the owning registry; consumers (caches, indexes) treat them as opaque
/// keys and never allocate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl FileId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }
}
