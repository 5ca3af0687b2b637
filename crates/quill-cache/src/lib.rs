//! Fingerprinted persistent caches for expensive per-file derived artifacts.
//!
//! Producers (highlighters, folding engines, structure analyzers) compute an
//! artifact per file and want it back after a restart without recomputing.
//! Each stored entry pairs the artifact with a caller-supplied
//! [`Fingerprint`]; on lookup the caller compares the stored fingerprint
//! against a fresh one and either reuses the artifact or recomputes and
//! overwrites. The cache itself never decides when to recompute.
//!
//! ## On-disk layout
//!
//! Scope-level caches live under `<cache_root>/<scope hash>/`, one directory
//! per logical cache:
//! - `<name>/<name>`:
//!   - [`PersistentMap`] append log, gated by the codec's format version;
//!     any mismatch at open discards the whole map
//! - `<name>/<name>.lock`:
//!   - exclusive lock held while the map is open
//! - `<name>/<name>.json`:
//!   - human-readable sidecar (format version, app version, creation time)
//!
//! The cache root defaults to `~/.quill/cache` and respects
//! `QUILL_CACHE_DIR`. Scope hashes are rename-resistant (see [`ScopeId`]).
//!
//! Codecs that declare themselves non-durable are backed by a
//! process-lifetime in-memory store behind the same [`ArtifactCache`]
//! interface and leave no files behind.

mod cache;
mod cache_dir;
mod codec;
mod envelope;
mod error;
mod factory;
mod fingerprint;
mod lock;
mod persistent_map;
mod util;

pub use cache::ArtifactCache;
pub use cache_dir::CacheConfig;
pub use codec::{ArtifactCodec, BincodeCodec};
pub use error::{CacheError, Result};
pub use factory::{open_cache, CacheRegistry};
pub use fingerprint::{Fingerprint, ScopeId};
pub use persistent_map::PersistentMap;
pub use quill_core::FileId;
pub use util::{now_millis, PAYLOAD_LIMIT_BYTES};
