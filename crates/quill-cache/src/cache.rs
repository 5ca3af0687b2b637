use crate::codec::ArtifactCodec;
use crate::envelope;
use crate::error::{CacheError, Result};
use crate::factory::CacheRegistration;
use crate::fingerprint::Fingerprint;
use crate::persistent_map::PersistentMap;
use quill_core::FileId;
use std::collections::HashMap;
use std::sync::Mutex;

/// The bound, per-logical-cache object producers use.
///
/// Each entry pairs the caller's fingerprint with the artifact; callers
/// compare the returned fingerprint against a freshly computed one to decide
/// between reuse and recomputation:
///
/// ```ignore
/// match cache.get(file) {
///     Some((fp, artifact)) if fp == current => use artifact,
///     _ => {
///         let artifact = recompute(file);
///         cache.put(file, current, &artifact)?;
///     }
/// }
/// ```
///
/// All operations are safe to call concurrently from multiple threads; an
/// internal mutex serializes access to the backing store. Whether the store
/// is disk-resident or memory-resident is decided by the codec's durability
/// flag at open time and invisible here.
///
/// The owning scope that opened the cache must [`close`](Self::close) it;
/// dropping without closing still syncs and releases the map but skips the
/// final log compaction.
#[derive(Debug)]
pub struct ArtifactCache<C: ArtifactCodec> {
    name: String,
    codec: C,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    backend: Option<CacheBackend>,
    registration: Option<CacheRegistration>,
}

#[derive(Debug)]
pub(crate) enum CacheBackend {
    Disk(PersistentMap),
    Memory(HashMap<u32, Vec<u8>>),
}

impl CacheBackend {
    fn get(&mut self, key: u32) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Disk(map) => map.get(key),
            Self::Memory(map) => Ok(map.get(&key).cloned()),
        }
    }

    fn put(&mut self, key: u32, bytes: Vec<u8>) -> Result<()> {
        match self {
            Self::Disk(map) => map.put(key, &bytes),
            Self::Memory(map) => {
                map.insert(key, bytes);
                Ok(())
            }
        }
    }

    fn remove(&mut self, key: u32) -> Result<()> {
        match self {
            Self::Disk(map) => map.remove(key),
            Self::Memory(map) => {
                map.remove(&key);
                Ok(())
            }
        }
    }
}

impl<C: ArtifactCodec> ArtifactCache<C> {
    pub(crate) fn new(
        name: String,
        codec: C,
        backend: CacheBackend,
        registration: CacheRegistration,
    ) -> Self {
        Self {
            name,
            codec,
            inner: Mutex::new(Inner {
                backend: Some(backend),
                registration: Some(registration),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up the entry for `key`.
    ///
    /// Absent entries, undecodable entries and read failures all surface as
    /// `None`: the cache is never load-bearing for correctness, so the read
    /// path degrades to a miss instead of failing the caller. An entry that
    /// fails to decode is proactively removed so it does not fail again on
    /// every lookup.
    pub fn get(&self, key: FileId) -> Option<(Fingerprint, C::Artifact)> {
        let mut inner = self.lock();
        let backend = inner.backend.as_mut()?;
        let raw_key = key.to_raw();

        let bytes = match backend.get(raw_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                tracing::debug!(
                    target = "quill.cache",
                    cache = %self.name,
                    key = raw_key,
                    error = %err,
                    "cache read failed; treating as miss"
                );
                return None;
            }
        };

        match envelope::decode_entry(&self.codec, raw_key, &bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!(
                    target = "quill.cache",
                    cache = %self.name,
                    key = raw_key,
                    error = %err,
                    "dropping undecodable cache entry"
                );
                let _ = backend.remove(raw_key);
                None
            }
        }
    }

    /// Stores `artifact` under `key`, overwriting any prior entry.
    ///
    /// Unlike [`get`](Self::get), write failures propagate: the caller just
    /// finished an expensive recomputation and should know the result was
    /// not persisted.
    pub fn put(&self, key: FileId, fingerprint: Fingerprint, artifact: &C::Artifact) -> Result<()> {
        let bytes = envelope::encode_entry(&self.codec, fingerprint, artifact)?;
        let mut inner = self.lock();
        let backend = inner.backend.as_mut().ok_or(CacheError::Closed)?;
        backend.put(key.to_raw(), bytes)
    }

    /// Explicitly invalidates `key`, e.g. when the underlying file was
    /// deleted. Absent keys are a no-op.
    pub fn remove(&self, key: FileId) -> Result<()> {
        let mut inner = self.lock();
        let backend = inner.backend.as_mut().ok_or(CacheError::Closed)?;
        backend.remove(key.to_raw())
    }

    /// Flushes and releases the backing store. Idempotent; only the owning
    /// scope may call this. After `close`, the logical cache may be opened
    /// again through the factory.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        // Unregister first so a reopen is possible even if the final flush
        // fails.
        inner.registration.take();
        match inner.backend.take() {
            Some(CacheBackend::Disk(map)) => map.close(),
            Some(CacheBackend::Memory(_)) | None => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
