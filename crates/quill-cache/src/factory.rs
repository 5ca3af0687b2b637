use crate::cache::{ArtifactCache, CacheBackend};
use crate::cache_dir::CacheConfig;
use crate::codec::ArtifactCodec;
use crate::error::{CacheError, Result};
use crate::fingerprint::ScopeId;
use crate::persistent_map::PersistentMap;
use crate::util::{now_millis, replace_file_atomic};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Process-wide registry of open caches.
///
/// The registry is owned by the application lifetime and passed explicitly
/// to [`open_cache`]; there is no ambient singleton. Its job is to guarantee
/// at most one open persistent map per (scope, logical name) in this
/// process: two live handles to the same files would corrupt the on-disk
/// structure under concurrent writers.
#[derive(Debug, Clone, Default)]
pub struct CacheRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    open: Mutex<HashSet<(ScopeId, String)>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, scope: &ScopeId, name: &str) -> Result<CacheRegistration> {
        let key = (scope.clone(), name.to_string());
        let mut open = self
            .inner
            .open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !open.insert(key.clone()) {
            return Err(CacheError::AlreadyOpen {
                name: name.to_string(),
            });
        }
        Ok(CacheRegistration {
            inner: Arc::clone(&self.inner),
            key,
        })
    }
}

/// Releases the (scope, name) slot when the owning cache closes or drops.
#[derive(Debug)]
pub(crate) struct CacheRegistration {
    inner: Arc<RegistryInner>,
    key: (ScopeId, String),
}

impl Drop for CacheRegistration {
    fn drop(&mut self) {
        self.inner
            .open
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

/// Opens (or creates) the logical cache `name` for `scope`, bound to `codec`.
///
/// Resolves `<cache_root>/<scope hash>/<name>/<name>` and opens the
/// persistent map there with the codec's format version; a stale version tag
/// on disk discards the old data transparently. Codecs that declare
/// themselves non-durable get a process-lifetime in-memory backend instead
/// and never touch disk.
///
/// One call per logical cache per scope per process lifetime: a second open
/// while the first cache is still live fails with
/// [`CacheError::AlreadyOpen`].
pub fn open_cache<C: ArtifactCodec>(
    registry: &CacheRegistry,
    config: &CacheConfig,
    scope: &ScopeId,
    name: &str,
    codec: C,
) -> Result<ArtifactCache<C>> {
    validate_cache_name(name)?;
    let registration = registry.register(scope, name)?;

    if !codec.durable() {
        tracing::debug!(
            target = "quill.cache",
            cache = name,
            scope = %scope,
            "opening memory-backed cache"
        );
        return Ok(ArtifactCache::new(
            name.to_string(),
            codec,
            CacheBackend::Memory(HashMap::new()),
            registration,
        ));
    }

    let dir = config.scope_dir(scope)?.join(name);
    std::fs::create_dir_all(&dir)?;

    let format_version = codec.format_version();
    let map = PersistentMap::open(dir.join(name), format_version)?;
    write_map_info(&dir, name, format_version);

    tracing::info!(
        target = "quill.cache",
        cache = name,
        scope = %scope,
        format_version,
        entries = map.len(),
        "opened persistent cache"
    );

    Ok(ArtifactCache::new(
        name.to_string(),
        codec,
        CacheBackend::Disk(map),
        registration,
    ))
}

fn validate_cache_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(CacheError::InvalidCacheName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Human-readable sidecar describing the map; written for debugging only and
/// never read back as the source of truth (the map header is authoritative).
#[derive(Debug, Serialize, Deserialize)]
struct MapInfo {
    name: String,
    format_version: u32,
    app_version: String,
    created_at_millis: u64,
}

fn write_map_info(dir: &Path, name: &str, format_version: u32) {
    let path = dir.join(format!("{name}.json"));

    // Skip the write when an up-to-date sidecar is already there.
    if let Ok(bytes) = std::fs::read(&path) {
        if let Ok(existing) = serde_json::from_slice::<MapInfo>(&bytes) {
            if existing.format_version == format_version && existing.name == name {
                return;
            }
        }
    }

    let info = MapInfo {
        name: name.to_string(),
        format_version,
        app_version: quill_core::QUILL_VERSION.to_string(),
        created_at_millis: now_millis(),
    };

    let result = replace_file_atomic(&path, |file| {
        let bytes = serde_json::to_vec_pretty(&info).map_err(std::io::Error::other)?;
        file.write_all(&bytes)?;
        Ok(())
    });
    if let Err(err) = result {
        tracing::debug!(
            target = "quill.cache",
            path = %path.display(),
            error = %err,
            "failed to write cache sidecar (best effort)"
        );
    }
}
