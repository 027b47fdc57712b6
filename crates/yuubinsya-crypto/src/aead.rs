//! Pluggable AEAD suites.
//!
//! A suite's [`AeadSuite::name`] is mixed into the HKDF info of every session
//! key, so two suites over the same shared secret and salt never derive the
//! same key.

use chacha20poly1305::aead::generic_array::typenum::Unsigned;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use yuubinsya_common::CryptoMethod;

use crate::error::CipherError;

/// Poly1305 tag size, shared by both suites.
pub const TAG_SIZE: usize = 16;

/// Constructor and sizing information for one AEAD construction.
pub trait AeadSuite: Send + Sync {
    /// Build a cipher from `key`, which must be [`AeadSuite::key_size`] bytes.
    fn new_cipher(&self, key: &[u8]) -> Result<SessionAead, CipherError>;

    fn key_size(&self) -> usize;

    fn nonce_size(&self) -> usize;

    /// Domain-separation label for key derivation.
    fn name(&self) -> &'static [u8];
}

/// ChaCha20-Poly1305 (RFC 8439).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaCha20Poly1305Suite;

impl AeadSuite for ChaCha20Poly1305Suite {
    fn new_cipher(&self, key: &[u8]) -> Result<SessionAead, CipherError> {
        ChaCha20Poly1305::new_from_slice(key)
            .map(SessionAead::ChaCha20Poly1305)
            .map_err(|_| CipherError::InvalidKeyLength(key.len()))
    }

    fn key_size(&self) -> usize {
        32
    }

    fn nonce_size(&self) -> usize {
        12
    }

    fn name(&self) -> &'static [u8] {
        b"chacha20poly1305-key"
    }
}

/// XChaCha20-Poly1305 (extended 24-byte nonce).
#[derive(Debug, Clone, Copy, Default)]
pub struct XChaCha20Poly1305Suite;

impl AeadSuite for XChaCha20Poly1305Suite {
    fn new_cipher(&self, key: &[u8]) -> Result<SessionAead, CipherError> {
        XChaCha20Poly1305::new_from_slice(key)
            .map(SessionAead::XChaCha20Poly1305)
            .map_err(|_| CipherError::InvalidKeyLength(key.len()))
    }

    fn key_size(&self) -> usize {
        32
    }

    fn nonce_size(&self) -> usize {
        24
    }

    fn name(&self) -> &'static [u8] {
        b"xchacha20poly1305-key"
    }
}

static CHACHA20_POLY1305: ChaCha20Poly1305Suite = ChaCha20Poly1305Suite;
static XCHACHA20_POLY1305: XChaCha20Poly1305Suite = XChaCha20Poly1305Suite;

/// Resolve the configured method to its suite.
pub fn suite_for(method: CryptoMethod) -> &'static dyn AeadSuite {
    match method {
        CryptoMethod::ChaCha20Poly1305 => &CHACHA20_POLY1305,
        CryptoMethod::XChaCha20Poly1305 => &XCHACHA20_POLY1305,
    }
}

/// A keyed AEAD instance for one direction of a session.
///
/// Output layout of every seal is `ciphertext || tag`.
#[derive(Clone)]
pub enum SessionAead {
    ChaCha20Poly1305(ChaCha20Poly1305),
    XChaCha20Poly1305(XChaCha20Poly1305),
}

impl SessionAead {
    pub fn nonce_size(&self) -> usize {
        match self {
            SessionAead::ChaCha20Poly1305(_) => 12,
            SessionAead::XChaCha20Poly1305(_) => 24,
        }
    }

    /// Bytes added to every sealed message.
    pub fn overhead(&self) -> usize {
        TAG_SIZE
    }

    /// Seal `plaintext` under `nonce`, appending ciphertext and tag to `out`.
    pub fn seal_append(
        &self,
        nonce: &[u8],
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CipherError> {
        match self {
            SessionAead::ChaCha20Poly1305(aead) => seal_append_with(aead, nonce, plaintext, out),
            SessionAead::XChaCha20Poly1305(aead) => seal_append_with(aead, nonce, plaintext, out),
        }
    }

    /// Open `ciphertext || tag` in place. Returns the plaintext length; the
    /// plaintext occupies the front of `buf`. On failure the contents of
    /// `buf` are unspecified and must not be used.
    pub fn open_in_place(&self, nonce: &[u8], buf: &mut [u8]) -> Result<usize, CipherError> {
        match self {
            SessionAead::ChaCha20Poly1305(aead) => open_in_place_with(aead, nonce, buf),
            SessionAead::XChaCha20Poly1305(aead) => open_in_place_with(aead, nonce, buf),
        }
    }
}

impl std::fmt::Debug for SessionAead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionAead::ChaCha20Poly1305(_) => f.write_str("SessionAead(chacha20poly1305)"),
            SessionAead::XChaCha20Poly1305(_) => f.write_str("SessionAead(xchacha20poly1305)"),
        }
    }
}

fn seal_append_with<A: AeadInPlace>(
    aead: &A,
    nonce: &[u8],
    plaintext: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), CipherError> {
    if nonce.len() != <A::NonceSize as Unsigned>::USIZE {
        return Err(CipherError::InvalidNonceLength(nonce.len()));
    }

    let start = out.len();
    out.extend_from_slice(plaintext);
    let sealed =
        aead.encrypt_in_place_detached(GenericArray::from_slice(nonce), b"", &mut out[start..]);
    match sealed {
        Ok(tag) => {
            out.extend_from_slice(&tag);
            Ok(())
        }
        Err(_) => {
            out.truncate(start);
            Err(CipherError::EncryptFailed)
        }
    }
}

fn open_in_place_with<A: AeadInPlace>(
    aead: &A,
    nonce: &[u8],
    buf: &mut [u8],
) -> Result<usize, CipherError> {
    if nonce.len() != <A::NonceSize as Unsigned>::USIZE {
        return Err(CipherError::InvalidNonceLength(nonce.len()));
    }

    let tag_size = <A::TagSize as Unsigned>::USIZE;
    let len = buf.len();
    if len < tag_size {
        return Err(CipherError::ShortBuffer { len, min: tag_size });
    }

    let (data, tag) = buf.split_at_mut(len - tag_size);
    aead.decrypt_in_place_detached(
        GenericArray::from_slice(nonce),
        b"",
        data,
        GenericArray::from_slice(tag),
    )
    .map_err(|_| CipherError::DecryptFailed)?;

    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_properties() {
        let chacha = suite_for(CryptoMethod::ChaCha20Poly1305);
        let xchacha = suite_for(CryptoMethod::XChaCha20Poly1305);

        assert_eq!(chacha.key_size(), 32);
        assert_eq!(chacha.nonce_size(), 12);
        assert_eq!(xchacha.key_size(), 32);
        assert_eq!(xchacha.nonce_size(), 24);
        assert_ne!(chacha.name(), xchacha.name());
    }

    #[test]
    fn test_ciphers_wipe_keys_on_drop() {
        fn assert_zeroize_on_drop<T: zeroize::ZeroizeOnDrop>() {}
        assert_zeroize_on_drop::<ChaCha20Poly1305>();
        assert_zeroize_on_drop::<XChaCha20Poly1305>();
    }

    #[test]
    fn test_seal_open() {
        for method in [CryptoMethod::ChaCha20Poly1305, CryptoMethod::XChaCha20Poly1305] {
            let suite = suite_for(method);
            let aead = suite.new_cipher(&[7u8; 32]).unwrap();
            let nonce = vec![1u8; suite.nonce_size()];

            let mut buf = Vec::new();
            aead.seal_append(&nonce, b"sensitive data", &mut buf).unwrap();
            assert_eq!(buf.len(), 14 + aead.overhead());

            let n = aead.open_in_place(&nonce, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"sensitive data");
        }
    }

    #[test]
    fn test_tamper_detection() {
        let aead = suite_for(CryptoMethod::ChaCha20Poly1305)
            .new_cipher(&[7u8; 32])
            .unwrap();
        let nonce = [0u8; 12];

        let mut buf = Vec::new();
        aead.seal_append(&nonce, b"sensitive data", &mut buf).unwrap();
        buf[0] ^= 0xff;

        assert!(matches!(
            aead.open_in_place(&nonce, &mut buf),
            Err(CipherError::DecryptFailed)
        ));
    }

    #[test]
    fn test_wrong_sizes_rejected() {
        let suite = suite_for(CryptoMethod::XChaCha20Poly1305);
        assert!(matches!(
            suite.new_cipher(&[0u8; 16]),
            Err(CipherError::InvalidKeyLength(16))
        ));

        let aead = suite.new_cipher(&[0u8; 32]).unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            aead.seal_append(&[0u8; 12], b"x", &mut out),
            Err(CipherError::InvalidNonceLength(12))
        ));
        assert!(out.is_empty());
        assert!(matches!(
            aead.open_in_place(&[0u8; 24], &mut [0u8; 4]),
            Err(CipherError::ShortBuffer { len: 4, min: 16 })
        ));
    }
}
