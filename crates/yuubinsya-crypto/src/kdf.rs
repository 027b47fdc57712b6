//! Key schedule: timestamp keystream, directional session keys and the
//! password-only datagram key.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use zeroize::Zeroizing;

use crate::aead::{AeadSuite, SessionAead};
use crate::error::{CipherError, HandshakeError};
use crate::hash::Hash;
use crate::header::TIME_SIZE;
use crate::state::Role;

const TIME_INFO: &[u8] = b"time";
const DATAGRAM_KEY_INFO: &[u8] = b"yuubinsya-salt-";

const TIME_KEY_SIZE: usize = 32;
const TIME_NONCE_SIZE: usize = 12;

/// Encrypt or decrypt an 8-byte timestamp in place.
///
/// The keystream is IETF ChaCha20 keyed by
/// `HKDF(ikm = password, salt = session salt, info = "time")`; XOR makes the
/// operation its own inverse.
pub fn apply_time_keystream(
    hash: &dyn Hash,
    password: &[u8],
    salt: &[u8],
    time: &mut [u8; TIME_SIZE],
) -> Result<(), HandshakeError> {
    let mut okm = Zeroizing::new([0u8; TIME_KEY_SIZE + TIME_NONCE_SIZE]);
    hash.hkdf(password, Some(salt), &[TIME_INFO], &mut okm[..])
        .map_err(|e| HandshakeError::KeyDerivation(e.to_string()))?;

    let mut cipher = ChaCha20::new_from_slices(&okm[..TIME_KEY_SIZE], &okm[TIME_KEY_SIZE..])
        .map_err(|e| HandshakeError::KeyDerivation(e.to_string()))?;
    cipher.apply_keystream(time);
    Ok(())
}

pub fn encrypt_time(
    hash: &dyn Hash,
    password: &[u8],
    salt: &[u8],
    unix_secs: u64,
) -> Result<[u8; TIME_SIZE], HandshakeError> {
    let mut time = unix_secs.to_be_bytes();
    apply_time_keystream(hash, password, salt, &mut time)?;
    Ok(time)
}

pub fn decrypt_time(
    hash: &dyn Hash,
    password: &[u8],
    salt: &[u8],
    encrypted: &[u8; TIME_SIZE],
) -> Result<u64, HandshakeError> {
    let mut time = *encrypted;
    apply_time_keystream(hash, password, salt, &mut time)?;
    Ok(u64::from_be_bytes(time))
}

/// Traffic direction, bound into the HKDF info of each session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    fn tag(self) -> u8 {
        match self {
            Direction::ClientToServer => 0x01,
            Direction::ServerToClient => 0x02,
        }
    }

    /// Direction of traffic written by `role`.
    pub fn outbound(role: Role) -> Self {
        match role {
            Role::Client => Direction::ClientToServer,
            Role::Server => Direction::ServerToClient,
        }
    }

    /// Direction of traffic read by `role`.
    pub fn inbound(role: Role) -> Self {
        match role {
            Role::Client => Direction::ServerToClient,
            Role::Server => Direction::ClientToServer,
        }
    }
}

/// One direction's AEAD and the seed its nonce counter starts from.
pub struct DirectionKey {
    pub aead: SessionAead,
    pub nonce_seed: Zeroizing<Vec<u8>>,
}

impl DirectionKey {
    /// `HKDF(ikm = shared secret, salt = session salt,
    /// info = suite name || sender timestamp || direction)` split into
    /// key and nonce seed.
    pub fn derive(
        hash: &dyn Hash,
        suite: &dyn AeadSuite,
        shared_secret: &[u8],
        salt: &[u8],
        sender_time: &[u8; TIME_SIZE],
        direction: Direction,
    ) -> Result<Self, HandshakeError> {
        let key_size = suite.key_size();
        let mut okm = Zeroizing::new(vec![0u8; key_size + suite.nonce_size()]);
        hash.hkdf(
            shared_secret,
            Some(salt),
            &[suite.name(), &sender_time[..], &[direction.tag()]],
            &mut okm,
        )
        .map_err(|e| HandshakeError::KeyDerivation(e.to_string()))?;

        let aead = suite.new_cipher(&okm[..key_size])?;
        Ok(Self {
            aead,
            nonce_seed: Zeroizing::new(okm[key_size..].to_vec()),
        })
    }
}

impl std::fmt::Debug for DirectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKey")
            .field("aead", &self.aead)
            .finish_non_exhaustive()
    }
}

/// Both directions of one session, oriented for the local role.
#[derive(Debug)]
pub struct SessionKeys {
    pub read: DirectionKey,
    pub write: DirectionKey,
}

impl SessionKeys {
    /// The write key is bound to the timestamp this side sent, the read key
    /// to the one the peer sent.
    pub fn derive(
        hash: &dyn Hash,
        suite: &dyn AeadSuite,
        role: Role,
        shared_secret: &[u8],
        salt: &[u8],
        local_time: &[u8; TIME_SIZE],
        peer_time: &[u8; TIME_SIZE],
    ) -> Result<Self, HandshakeError> {
        let write = DirectionKey::derive(
            hash,
            suite,
            shared_secret,
            salt,
            local_time,
            Direction::outbound(role),
        )?;
        let read = DirectionKey::derive(
            hash,
            suite,
            shared_secret,
            salt,
            peer_time,
            Direction::inbound(role),
        )?;
        Ok(Self { read, write })
    }
}

/// Key for the datagram cipher, derived from the password alone.
///
/// 32-byte suites use `SHA-256(password || "yuubinsya-salt-")`; any other
/// key size falls back to HKDF with the same label as info.
pub fn datagram_key(
    hash: &dyn Hash,
    suite: &dyn AeadSuite,
    password: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let key_size = suite.key_size();
    if key_size == hash.size() {
        return Ok(Zeroizing::new(hash.digest(&[password, DATAGRAM_KEY_INFO])));
    }

    let mut key = Zeroizing::new(vec![0u8; key_size]);
    hash.hkdf(password, None, &[DATAGRAM_KEY_INFO], &mut key)
        .map_err(|_| CipherError::InvalidKeyLength(key_size))?;
    Ok(key)
}
