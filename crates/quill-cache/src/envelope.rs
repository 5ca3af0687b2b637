//! The fingerprinted entry envelope.
//!
//! Every cache entry is stored as a fixed-width fingerprint immediately
//! followed by the codec's own bytes. Wrapping the codec here keeps the
//! persistent map fingerprint-agnostic while every entry transparently
//! carries one.

use crate::codec::ArtifactCodec;
use crate::error::{CacheError, Result};
use crate::fingerprint::Fingerprint;

pub(crate) fn encode_entry<C: ArtifactCodec>(
    codec: &C,
    fingerprint: Fingerprint,
    artifact: &C::Artifact,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(Fingerprint::ENCODED_LEN + 64);
    out.extend_from_slice(&fingerprint.to_le_bytes());
    codec.encode(artifact, &mut out)?;
    Ok(out)
}

/// Decodes one stored blob back into its `(fingerprint, artifact)` pair.
///
/// A failing inner decode fails the whole entry; we never hand back a valid
/// fingerprint paired with a default artifact.
pub(crate) fn decode_entry<C: ArtifactCodec>(
    codec: &C,
    key: u32,
    bytes: &[u8],
) -> Result<(Fingerprint, C::Artifact)> {
    if bytes.len() < Fingerprint::ENCODED_LEN {
        return Err(CacheError::CorruptEntry { key });
    }
    let (prefix, payload) = bytes.split_at(Fingerprint::ENCODED_LEN);
    let mut raw = [0_u8; Fingerprint::ENCODED_LEN];
    raw.copy_from_slice(prefix);
    let fingerprint = Fingerprint::from_le_bytes(raw);

    let artifact = codec
        .decode(payload)
        .map_err(|_| CacheError::CorruptEntry { key })?;
    Ok((fingerprint, artifact))
}
