//! Error taxonomy for the handshake and the two record layers.

use std::io;

use thiserror::Error;

/// Errors that abort connection establishment.
///
/// Every variant is fatal to the handshake attempt. Nothing is retried at
/// this layer; the caller decides whether to redial.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake signature verification failed")]
    SignatureInvalid,

    #[error("peer echoed our own ephemeral key, looks like a replay")]
    ReplayDetected,

    #[error("peer timestamp outside the allowed window (skew {skew_secs}s)")]
    StaleTimestamp { skew_secs: i64 },

    #[error("peer closed the transport mid-handshake")]
    Truncated,

    #[error("handshake timed out")]
    Timeout,

    #[error("invalid peer public key")]
    InvalidPublicKey,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("handshake state machine: {0}")]
    State(#[from] crate::state::StateError),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => HandshakeError::Truncated,
            io::ErrorKind::TimedOut => HandshakeError::Timeout,
            _ => HandshakeError::Io(err),
        }
    }
}

/// Errors raised by the stream and datagram record layers.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("input too short: {len} bytes, need at least {min}")]
    ShortBuffer { len: usize, min: usize },

    #[error("authentication failed")]
    DecryptFailed,

    #[error("payload too large: {len} > {max}")]
    OversizedPacket { len: usize, max: usize },

    #[error("nonce counter exhausted, connection must be closed")]
    NonceExhausted,

    #[error("invalid key length: {0}")]
    InvalidKeyLength(usize),

    #[error("invalid nonce length: {0}")]
    InvalidNonceLength(usize),

    #[error("encryption failed")]
    EncryptFailed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<CipherError> for io::Error {
    fn from(err: CipherError) -> Self {
        let kind = match &err {
            CipherError::Io(inner) => inner.kind(),
            CipherError::DecryptFailed | CipherError::ShortBuffer { .. } => {
                io::ErrorKind::InvalidData
            }
            CipherError::OversizedPacket { .. } => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        match err {
            CipherError::Io(inner) => inner,
            other => io::Error::new(kind, other),
        }
    }
}
