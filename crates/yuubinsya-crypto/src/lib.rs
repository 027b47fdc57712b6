//! Yuubinsya transport security.
//!
//! This crate provides:
//! - A signed P-256 ECDH handshake keyed by a pre-shared secret
//! - An encrypted stream connection with counter nonces per direction
//! - An encrypted datagram socket with a random nonce per packet
//!
//! # Design
//!
//! Both peers derive the same Ed25519 key from the secret, so a header that
//! verifies came from someone holding it. Each header carries a timestamp
//! encrypted under the secret and the session salt; anything more than 30
//! seconds away from the local clock is refused. There is no cache of seen
//! salts: a client header replayed inside that window is answered, but the
//! replayer never holds the ephemeral secret needed to derive session keys.
//!
//! ```no_run
//! use yuubinsya_crypto::{Handshaker, Role};
//! use yuubinsya_common::CryptoMethod;
//! use tokio::io::AsyncWriteExt;
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let handshaker = Handshaker::new(Role::Client, b"secret", CryptoMethod::ChaCha20Poly1305)?;
//! let tcp = TcpStream::connect("127.0.0.1:9000").await?;
//! let mut conn = handshaker.handshake(tcp).await?;
//! conn.write_all(b"hello").await?;
//! conn.flush().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod aead;
pub mod error;
pub mod guard;
pub mod handshake;
pub mod hash;
pub mod header;
pub mod kdf;
pub mod packet;
pub mod signer;
pub mod state;
pub mod stream;

pub use aead::{suite_for, AeadSuite, SessionAead};
pub use error::{CipherError, HandshakeError};
pub use guard::{Clock, SystemClock, TimeGuard};
pub use handshake::Handshaker;
pub use packet::{DatagramConn, PacketCipher, MAX_SEGMENT_SIZE};
pub use state::{HandshakeState, Role};
pub use stream::{NonceCounter, StreamConn};
