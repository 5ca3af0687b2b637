use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// A caller-supplied staleness token for one cached artifact.
///
/// The cache never computes fingerprints on its own: producers derive one
/// from whatever state produced the artifact (a content hash, a document
/// revision counter) and compare the stored value against a fresh one to
/// decide whether the artifact is safe to reuse.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Serialized width of a fingerprint inside a cache entry.
    pub(crate) const ENCODED_LEN: usize = 8;

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Content-hash convenience: the first 8 bytes of the SHA-256 digest.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(bytes.as_ref());
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&digest[..8]);
        Self(u64::from_le_bytes(raw))
    }

    pub(crate) fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub(crate) fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Rename-resistant identity of an owning scope (a project, or the whole
/// application), stored as a lowercase hex SHA-256 digest.
///
/// The digest names the scope's on-disk cache directory, so it must stay
/// stable when the project is renamed or moved between checkouts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeId(String);

impl ScopeId {
    /// Derive a scope id from any stable key string.
    pub fn from_stable_key(key: &str) -> Self {
        Self(hex::encode(Sha256::digest(key.as_bytes())))
    }

    /// Derive a scope id for a project directory.
    ///
    /// Fallback order:
    /// 1. `QUILL_PROJECT_ID` environment variable (if set and non-empty)
    /// 2. git `remote "origin"` url, walking up from `project_root`
    /// 3. the canonicalized `project_root` path
    pub fn for_project_root(project_root: impl AsRef<Path>) -> Result<Self> {
        if let Some(id) = std::env::var_os("QUILL_PROJECT_ID") {
            let id = id.to_string_lossy();
            if !id.trim().is_empty() {
                return Ok(Self::from_stable_key(&id));
            }
        }

        let canonical = std::fs::canonicalize(project_root)?;

        if let Some(origin) = git_origin_url(&canonical) {
            return Ok(Self::from_stable_key(&origin));
        }

        Ok(Self::from_stable_key(&canonical.to_string_lossy()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn git_origin_url(start: &Path) -> Option<String> {
    for dir in start.ancestors() {
        let config = dir.join(".git").join("config");
        let Ok(text) = std::fs::read_to_string(&config) else {
            continue;
        };
        // Stop at the first repository found, whether or not it has an origin.
        return parse_git_origin(&text);
    }
    None
}

fn parse_git_origin(config: &str) -> Option<String> {
    let mut in_origin = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin = line == "[remote \"origin\"]";
            continue;
        }
        if !in_origin {
            continue;
        }
        if let Some(rest) = line.strip_prefix("url") {
            if let Some(value) = rest.trim_start().strip_prefix('=') {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}
