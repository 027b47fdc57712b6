//! Datagram cipher.
//!
//! Every packet is sealed on its own under a fresh random nonce and sent as
//! `nonce || ciphertext || tag`. There is no handshake and no shared counter:
//! the key comes from the password, and any number of tasks may send and
//! receive through one [`DatagramConn`] at once.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::debug;
use yuubinsya_common::CryptoMethod;

use crate::aead::{suite_for, SessionAead, TAG_SIZE};
use crate::error::CipherError;
use crate::hash::Sha256Hash;
use crate::kdf::datagram_key;

/// Largest datagram put on the wire.
pub const MAX_SEGMENT_SIZE: usize = 65535;

const MAX_NONCE_SIZE: usize = 24;

/// Per-packet AEAD keyed from the pre-shared secret.
#[derive(Clone, Debug)]
pub struct PacketCipher {
    aead: SessionAead,
    nonce_size: usize,
}

impl PacketCipher {
    pub fn new(password: &[u8], method: CryptoMethod) -> Result<Self, CipherError> {
        let suite = suite_for(method);
        let key = datagram_key(&Sha256Hash, suite, password)?;
        Ok(Self {
            aead: suite.new_cipher(&key)?,
            nonce_size: suite.nonce_size(),
        })
    }

    /// Largest payload accepted by [`PacketCipher::seal`].
    pub fn max_payload(&self) -> usize {
        MAX_SEGMENT_SIZE - self.nonce_size - TAG_SIZE
    }

    /// Smallest packet that can possibly authenticate.
    pub fn min_packet(&self) -> usize {
        self.nonce_size + TAG_SIZE
    }

    /// Seal `payload` into `out`, replacing its contents.
    pub fn seal(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<(), CipherError> {
        if payload.len() > self.max_payload() {
            return Err(CipherError::OversizedPacket {
                len: payload.len(),
                max: self.max_payload(),
            });
        }

        let mut nonce = [0u8; MAX_NONCE_SIZE];
        let nonce = &mut nonce[..self.nonce_size];
        OsRng.fill_bytes(nonce);

        out.clear();
        out.extend_from_slice(nonce);
        self.aead.seal_append(nonce, payload, out)
    }

    /// Open `packet` in place and return the plaintext inside it.
    pub fn open<'a>(&self, packet: &'a mut [u8]) -> Result<&'a [u8], CipherError> {
        if packet.len() < self.min_packet() {
            return Err(CipherError::ShortBuffer {
                len: packet.len(),
                min: self.min_packet(),
            });
        }

        let (nonce, body) = packet.split_at_mut(self.nonce_size);
        let n = self.aead.open_in_place(nonce, body)?;
        Ok(&body[..n])
    }
}

/// A UDP socket whose every datagram goes through a [`PacketCipher`].
#[derive(Clone, Debug)]
pub struct DatagramConn {
    socket: Arc<UdpSocket>,
    cipher: PacketCipher,
}

impl DatagramConn {
    pub fn new(socket: Arc<UdpSocket>, cipher: PacketCipher) -> Self {
        Self { socket, cipher }
    }

    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        password: &[u8],
        method: CryptoMethod,
    ) -> Result<Self, CipherError> {
        let cipher = PacketCipher::new(password, method)?;
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::new(Arc::new(socket), cipher))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn cipher(&self) -> &PacketCipher {
        &self.cipher
    }

    /// Seal and send one datagram. Returns the payload length.
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<usize, CipherError> {
        let mut packet = Vec::with_capacity(payload.len() + self.cipher.min_packet());
        self.cipher.seal(payload, &mut packet)?;
        self.socket.send_to(&packet, target).await?;
        Ok(payload.len())
    }

    /// Receive and open one datagram into `buf`.
    ///
    /// The sealed packet is read into `buf` and decrypted in place, so `buf`
    /// must hold the whole packet; a truncated packet fails authentication.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), CipherError> {
        let (opened, from) = self.recv_packet(buf).await?;
        Ok((opened?, from))
    }

    /// Like [`DatagramConn::recv_from`], but drops packets that are too
    /// short or fail authentication and keeps reading. Only socket errors
    /// are returned.
    pub async fn recv_authenticated(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            match self.recv_packet(buf).await? {
                (Ok(n), from) => return Ok((n, from)),
                (Err(err), from) => {
                    debug!(peer = %from, error = %err, "dropping datagram");
                }
            }
        }
    }

    async fn recv_packet(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(Result<usize, CipherError>, SocketAddr)> {
        let (len, from) = self.socket.recv_from(buf).await?;
        let nonce_size = self.cipher.nonce_size;

        let opened = self.cipher.open(&mut buf[..len]).map(|plain| plain.len());
        if let Ok(n) = opened {
            buf.copy_within(nonce_size..nonce_size + n, 0);
        }
        Ok((opened, from))
    }
}
