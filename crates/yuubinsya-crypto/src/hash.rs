//! Hash capability used by the key schedule.

use hkdf::{Hkdf, InvalidLength};
use sha2::{Digest, Sha256};

/// A hash function plus the HKDF built on top of it.
///
/// Kept side-effect free so tests can swap in fixed vectors without touching
/// the handshake.
pub trait Hash: Send + Sync {
    /// Digest output size in bytes (also the session salt size).
    fn size(&self) -> usize;

    /// Hash the concatenation of `parts`.
    fn digest(&self, parts: &[&[u8]]) -> Vec<u8>;

    /// HKDF-Extract(`salt`, `ikm`) followed by HKDF-Expand over the
    /// concatenation of `info` parts, filling `okm`.
    fn hkdf(
        &self,
        ikm: &[u8],
        salt: Option<&[u8]>,
        info: &[&[u8]],
        okm: &mut [u8],
    ) -> Result<(), InvalidLength>;
}

/// SHA-256 / HKDF-SHA256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hash;

impl Sha256Hash {
    pub const SIZE: usize = 32;
}

impl Hash for Sha256Hash {
    fn size(&self) -> usize {
        Self::SIZE
    }

    fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }

    fn hkdf(
        &self,
        ikm: &[u8],
        salt: Option<&[u8]>,
        info: &[&[u8]],
        okm: &mut [u8],
    ) -> Result<(), InvalidLength> {
        Hkdf::<Sha256>::new(salt, ikm).expand_multi_info(info, okm)
    }
}
