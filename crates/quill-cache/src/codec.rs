use crate::error::Result;
use crate::util::{bincode_deserialize, bincode_serialize};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Per-artifact-kind serialization strategy.
///
/// One codec instance is bound to a logical cache when it is opened and is
/// shared across threads for the cache's whole lifetime, so implementations
/// must be stateless.
pub trait ArtifactCodec: Send + Sync + 'static {
    /// The expensive derived value being cached. Opaque to the cache itself;
    /// only the codec knows its shape.
    type Artifact;

    /// On-disk format tag for this artifact kind.
    ///
    /// Any structural change to the encoding must bump this; a mismatch with
    /// the tag stored on disk discards the whole map at open time.
    fn format_version(&self) -> u32;

    /// Durable codecs persist to disk; non-durable ones get a
    /// process-lifetime in-memory backend with identical semantics.
    fn durable(&self) -> bool {
        true
    }

    /// Appends the artifact's bytes to `out`.
    ///
    /// The encoding must be self-delimiting (or the codec must consume
    /// exactly the bytes it wrote in [`decode`](Self::decode)); the cache
    /// hands `decode` exactly the byte range `encode` produced.
    fn encode(&self, artifact: &Self::Artifact, out: &mut Vec<u8>) -> Result<()>;

    /// Inverse of [`encode`](Self::encode); fails on malformed bytes.
    ///
    /// Never invoked for an absent entry, so legitimately-empty input is not
    /// a case implementations need to handle specially.
    fn decode(&self, bytes: &[u8]) -> Result<Self::Artifact>;
}

/// Codec for artifact types that already carry serde impls, using the
/// crate's standard bincode options (fixint, little-endian, bounded reads).
pub struct BincodeCodec<T> {
    format_version: u32,
    durable: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    /// A disk-backed codec with the given format version.
    pub fn new(format_version: u32) -> Self {
        Self {
            format_version,
            durable: true,
            _marker: PhantomData,
        }
    }

    /// A codec whose cache lives only for the current process.
    pub fn in_memory(format_version: u32) -> Self {
        Self {
            format_version,
            durable: false,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BincodeCodec")
            .field("format_version", &self.format_version)
            .field("durable", &self.durable)
            .finish()
    }
}

impl<T> ArtifactCodec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Artifact = T;

    fn format_version(&self) -> u32 {
        self.format_version
    }

    fn durable(&self) -> bool {
        self.durable
    }

    fn encode(&self, artifact: &T, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&bincode_serialize(artifact)?);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        bincode_deserialize(bytes)
    }
}
