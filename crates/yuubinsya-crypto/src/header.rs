//! Handshake header codec and the pool its wire buffers come from.
//!
//! Wire layout, 169 bytes:
//!
//! | field        | offset | size |
//! |--------------|--------|------|
//! | signature    | 0      | 64   |
//! | salt         | 64     | 32   |
//! | encrypted time | 96   | 8    |
//! | public key   | 104    | 65   |
//!
//! The signature covers every byte after the signature field.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut, Range};
use std::sync::{Arc, Mutex};

use zeroize::Zeroize;

use crate::error::HandshakeError;

pub const SIGNATURE_SIZE: usize = 64;
pub const SALT_SIZE: usize = 32;
pub const TIME_SIZE: usize = 8;
/// Uncompressed SEC1 P-256 point.
pub const PUBLIC_KEY_SIZE: usize = 65;
pub const HEADER_SIZE: usize = SIGNATURE_SIZE + SALT_SIZE + TIME_SIZE + PUBLIC_KEY_SIZE;

const SIGNATURE_RANGE: Range<usize> = 0..SIGNATURE_SIZE;
const SALT_RANGE: Range<usize> = SIGNATURE_SIZE..SIGNATURE_SIZE + SALT_SIZE;
const TIME_RANGE: Range<usize> = SALT_RANGE.end..SALT_RANGE.end + TIME_SIZE;
const PUBLIC_KEY_RANGE: Range<usize> = TIME_RANGE.end..HEADER_SIZE;

/// Decoded handshake header.
#[derive(Clone, PartialEq, Eq, Zeroize)]
pub struct HandshakeHeader {
    pub signature: [u8; SIGNATURE_SIZE],
    pub salt: [u8; SALT_SIZE],
    pub encrypted_time: [u8; TIME_SIZE],
    pub public_key: [u8; PUBLIC_KEY_SIZE],
}

impl HandshakeHeader {
    /// A header with every field zeroed.
    pub fn zeroed() -> Self {
        Self {
            signature: [0u8; SIGNATURE_SIZE],
            salt: [0u8; SALT_SIZE],
            encrypted_time: [0u8; TIME_SIZE],
            public_key: [0u8; PUBLIC_KEY_SIZE],
        }
    }

    /// Write all four fields into `buf` at their wire offsets.
    pub fn encode(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf[SIGNATURE_RANGE].copy_from_slice(&self.signature);
        buf[SALT_RANGE].copy_from_slice(&self.salt);
        buf[TIME_RANGE].copy_from_slice(&self.encrypted_time);
        buf[PUBLIC_KEY_RANGE].copy_from_slice(&self.public_key);
    }

    /// Parse a header. Anything shorter than [`HEADER_SIZE`] is truncated;
    /// trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, HandshakeError> {
        if buf.len() < HEADER_SIZE {
            return Err(HandshakeError::Truncated);
        }

        let mut header = Self::zeroed();
        header.signature.copy_from_slice(&buf[SIGNATURE_RANGE]);
        header.salt.copy_from_slice(&buf[SALT_RANGE]);
        header.encrypted_time.copy_from_slice(&buf[TIME_RANGE]);
        header.public_key.copy_from_slice(&buf[PUBLIC_KEY_RANGE]);
        Ok(header)
    }
}

impl std::fmt::Debug for HandshakeHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeHeader")
            .field("public_key_prefix", &&self.public_key[..4])
            .finish_non_exhaustive()
    }
}

/// Bounded free-list of header wire buffers.
pub struct HeaderPool {
    available: Mutex<VecDeque<Box<[u8; HEADER_SIZE]>>>,
    max_pool_size: usize,
}

impl HeaderPool {
    pub const DEFAULT_MAX_POOL_SIZE: usize = 16;

    pub fn new(max_pool_size: usize) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(VecDeque::new()),
            max_pool_size,
        })
    }

    /// Take a zeroed buffer, allocating when the pool is empty.
    pub fn acquire(self: &Arc<Self>) -> PooledHeader {
        let reused = self
            .available
            .lock()
            .ok()
            .and_then(|mut available| available.pop_front());

        PooledHeader {
            buf: Some(reused.unwrap_or_else(|| Box::new([0u8; HEADER_SIZE]))),
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently parked in the pool.
    pub fn available_count(&self) -> usize {
        self.available.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn release(&self, mut buf: Box<[u8; HEADER_SIZE]>) {
        buf.zeroize();
        if let Ok(mut available) = self.available.lock() {
            if available.len() < self.max_pool_size {
                available.push_back(buf);
            }
        }
    }
}

impl Default for HeaderPool {
    fn default() -> Self {
        Self {
            available: Mutex::new(VecDeque::new()),
            max_pool_size: Self::DEFAULT_MAX_POOL_SIZE,
        }
    }
}

impl std::fmt::Debug for HeaderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderPool")
            .field("available", &self.available_count())
            .field("max_pool_size", &self.max_pool_size)
            .finish()
    }
}

/// A wire buffer on loan from a [`HeaderPool`].
///
/// Dropping the guard zeroes the buffer and hands it back, whichever way
/// the handshake exits.
pub struct PooledHeader {
    buf: Option<Box<[u8; HEADER_SIZE]>>,
    pool: Arc<HeaderPool>,
}

impl PooledHeader {
    pub fn signature(&self) -> &[u8] {
        &self[SIGNATURE_RANGE]
    }

    pub fn salt(&self) -> &[u8] {
        &self[SALT_RANGE]
    }

    #[cfg(test)]
    fn time(&self) -> &[u8] {
        &self[TIME_RANGE]
    }

    #[cfg(test)]
    fn public_key(&self) -> &[u8] {
        &self[PUBLIC_KEY_RANGE]
    }

    /// `salt || encrypted time || public key`, the bytes the signature covers.
    pub fn signed_region(&self) -> &[u8] {
        &self[SALT_RANGE.start..]
    }

    pub fn signature_mut(&mut self) -> &mut [u8] {
        &mut self[SIGNATURE_RANGE]
    }
}

impl Deref for PooledHeader {
    type Target = [u8; HEADER_SIZE];

    fn deref(&self) -> &Self::Target {
        match &self.buf {
            Some(buf) => &**buf,
            None => unreachable!("header buffer is only taken on drop"),
        }
    }
}

impl DerefMut for PooledHeader {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.buf {
            Some(buf) => &mut **buf,
            None => unreachable!("header buffer is only taken on drop"),
        }
    }
}

impl Drop for PooledHeader {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> HandshakeHeader {
        HandshakeHeader {
            signature: [1u8; SIGNATURE_SIZE],
            salt: [2u8; SALT_SIZE],
            encrypted_time: [3u8; TIME_SIZE],
            public_key: [4u8; PUBLIC_KEY_SIZE],
        }
    }

    #[test]
    fn test_layout() {
        assert_eq!(HEADER_SIZE, 169);

        let pool = HeaderPool::new(2);
        let mut buf = pool.acquire();
        sample_header().encode(&mut buf);

        assert!(buf.signature().iter().all(|&b| b == 1));
        assert!(buf.salt().iter().all(|&b| b == 2));
        assert!(buf.time().iter().all(|&b| b == 3));
        assert!(buf.public_key().iter().all(|&b| b == 4));
        assert_eq!(buf.signed_region().len(), HEADER_SIZE - SIGNATURE_SIZE);
        assert_eq!(buf.signed_region()[0], 2);

        assert_eq!(HandshakeHeader::decode(&buf[..]).unwrap(), sample_header());
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = [0u8; HEADER_SIZE - 1];
        assert!(matches!(
            HandshakeHeader::decode(&bytes),
            Err(HandshakeError::Truncated)
        ));
    }

    #[test]
    fn test_pool_returns_zeroed_buffers() {
        let pool = HeaderPool::new(1);
        {
            let mut buf = pool.acquire();
            buf.fill(0xaa);
        }
        assert_eq!(pool.available_count(), 1);

        let buf = pool.acquire();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(pool.available_count(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = HeaderPool::new(1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn test_released_on_early_return() {
        fn fails(pool: &Arc<HeaderPool>) -> Result<(), HandshakeError> {
            let _buf = pool.acquire();
            Err(HandshakeError::SignatureInvalid)
        }

        let pool = HeaderPool::new(4);
        assert!(fails(&pool).is_err());
        assert_eq!(pool.available_count(), 1);
    }
}
