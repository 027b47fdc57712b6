//! Ed25519 signer derived from the pre-shared secret.
//!
//! Both peers run the same derivation and end up holding the same keypair,
//! so no key is ever transmitted. A peer with a different secret derives a
//! different public key, and its signatures simply fail to verify; there is
//! no comparison of secrets anywhere in the protocol.
//!
//! # Example
//!
//! ```
//! use yuubinsya_crypto::hash::Sha256Hash;
//! use yuubinsya_crypto::signer::{password_hash, Ed25519Signer, Signer};
//!
//! let hash = Sha256Hash;
//! let a = Ed25519Signer::derive(&hash, &password_hash(&hash, b"secret")).unwrap();
//! let b = Ed25519Signer::derive(&hash, &password_hash(&hash, b"secret")).unwrap();
//!
//! let sig = a.sign(b"header");
//! assert!(b.verify(b"header", &sig));
//! ```

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroizing;

use crate::hash::Hash;

/// Suffix appended to the password before hashing it into signer input.
const PASSWORD_HASH_SUFFIX: &[u8] = b"+s@1t";

/// HKDF info for the Ed25519 seed.
const SIGNATURE_INFO: &[u8] = b"ed25519-signature";

/// Signature capability over handshake headers.
pub trait Signer: Send + Sync {
    /// Size of a signature in bytes.
    fn signature_size(&self) -> usize;

    /// Sign `message`.
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Verify `signature` over `message`. Malformed signatures return false.
    fn verify(&self, message: &[u8], signature: &[u8]) -> bool;
}

/// `H(password || "+s@1t")`, the input the signer is derived from.
pub fn password_hash(hash: &dyn Hash, password: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(hash.digest(&[password, PASSWORD_HASH_SUFFIX]))
}

/// Deterministic Ed25519 keypair.
///
/// The signing key is zeroized on drop by `ed25519-dalek`.
pub struct Ed25519Signer {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519Signer {
    pub const SIGNATURE_SIZE: usize = ed25519_dalek::SIGNATURE_LENGTH;

    /// Derive the keypair: HKDF-Extract with an all-zero salt of hash length,
    /// then Expand with info `"ed25519-signature"` into a 32-byte seed.
    pub fn derive(hash: &dyn Hash, password_hash: &[u8]) -> Result<Self, hkdf::InvalidLength> {
        let salt = vec![0u8; hash.size()];
        let mut seed = Zeroizing::new([0u8; ed25519_dalek::SECRET_KEY_LENGTH]);
        hash.hkdf(password_hash, Some(&salt), &[SIGNATURE_INFO], &mut seed[..])?;

        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    #[cfg(test)]
    fn public_key_bytes(&self) -> [u8; 32] {
        *self.verifying_key.as_bytes()
    }
}

impl Signer for Ed25519Signer {
    fn signature_size(&self) -> usize {
        Self::SIGNATURE_SIZE
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let sig = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.verifying_key.verify(message, &sig).is_ok()
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.verifying_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Sha256Hash;

    fn signer_for(password: &[u8]) -> Ed25519Signer {
        let hash = Sha256Hash;
        Ed25519Signer::derive(&hash, &password_hash(&hash, password)).unwrap()
    }

    #[test]
    fn test_derivation_is_deterministic() {
        assert_eq!(
            signer_for(b"password").public_key_bytes(),
            signer_for(b"password").public_key_bytes()
        );
    }

    #[test]
    fn test_sign_verify() {
        let signer = signer_for(b"password");
        let signature = signer.sign(b"hello yuubinsya");
        assert_eq!(signature.len(), signer.signature_size());
        assert!(signer.verify(b"hello yuubinsya", &signature));

        // Wrong message should fail
        assert!(!signer.verify(b"wrong message", &signature));
    }

    #[test]
    fn test_mismatched_secret_fails() {
        let ours = signer_for(b"password");
        let theirs = signer_for(b"passw0rd");
        assert_ne!(ours.public_key_bytes(), theirs.public_key_bytes());

        let signature = theirs.sign(b"header");
        assert!(!ours.verify(b"header", &signature));
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let signer = signer_for(b"password");
        assert!(!signer.verify(b"header", &[0u8; 10]));
        assert!(!signer.verify(b"header", &[0u8; 64]));
    }
}
