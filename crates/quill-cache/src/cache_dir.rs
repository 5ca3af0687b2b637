use crate::error::{CacheError, Result};
use crate::fingerprint::ScopeId;
use std::path::PathBuf;

/// Configuration for selecting the on-disk cache root.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Override the global cache root (per-scope directories are still
    /// appended underneath it).
    pub cache_root_override: Option<PathBuf>,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            cache_root_override: std::env::var_os("QUILL_CACHE_DIR").map(PathBuf::from),
        }
    }

    pub(crate) fn cache_root(&self) -> Result<PathBuf> {
        match &self.cache_root_override {
            Some(root) => Ok(root.clone()),
            None => default_cache_root(),
        }
    }

    /// The directory holding every logical cache of one scope, named by the
    /// scope's stable hash so it survives project renames.
    pub(crate) fn scope_dir(&self, scope: &ScopeId) -> Result<PathBuf> {
        Ok(self.cache_root()?.join(scope.as_str()))
    }
}

fn default_cache_root() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".quill").join("cache"))
}
