//! Stream record cipher.
//!
//! Each write of up to [`MAX_CHUNK_SIZE`] bytes goes out as two sealed
//! records, `seal(u16_be(len))` then `seal(payload)`. Every seal consumes one
//! nonce from a big-endian counter seeded by the key schedule; reader and
//! writer advance in lockstep, so a dropped, reordered or forged record fails
//! authentication and poisons that direction for good.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use zeroize::{Zeroize, Zeroizing};

use crate::aead::{SessionAead, TAG_SIZE};
use crate::error::CipherError;
use crate::kdf::{DirectionKey, SessionKeys};

/// Largest plaintext carried by one length/payload record pair.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

const LENGTH_SIZE: usize = 2;

/// Per-direction nonce, incremented as a big-endian integer.
pub struct NonceCounter {
    bytes: Zeroizing<Vec<u8>>,
    exhausted: bool,
}

impl NonceCounter {
    pub fn new(seed: &[u8]) -> Self {
        Self {
            bytes: Zeroizing::new(seed.to_vec()),
            exhausted: false,
        }
    }

    /// The nonce for the next record, or `NonceExhausted` once the counter
    /// has wrapped.
    pub fn current(&self) -> Result<&[u8], CipherError> {
        if self.exhausted {
            return Err(CipherError::NonceExhausted);
        }
        Ok(&self.bytes)
    }

    /// Advance by one. Carrying out of the most significant byte marks the
    /// counter exhausted.
    pub fn increment(&mut self) {
        for byte in self.bytes.iter_mut().rev() {
            let (next, carry) = byte.overflowing_add(1);
            *byte = next;
            if !carry {
                return;
            }
        }
        self.exhausted = true;
    }

    /// Inverse of [`NonceCounter::increment`]. Only for diagnostics; the
    /// record layer never steps backwards.
    pub fn decrement(&mut self) {
        for byte in self.bytes.iter_mut().rev() {
            let (next, borrow) = byte.overflowing_sub(1);
            *byte = next;
            if !borrow {
                break;
            }
        }
        self.exhausted = false;
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl std::fmt::Debug for NonceCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceCounter")
            .field("len", &self.bytes.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

fn poisoned(kind: io::ErrorKind) -> io::Error {
    io::Error::new(kind, "stream cipher failed earlier, connection must be closed")
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Length { filled: usize },
    Payload { len: usize, filled: usize },
    Plain { pos: usize, end: usize },
    Failed(io::ErrorKind),
}

struct RecordReader {
    aead: SessionAead,
    nonce: NonceCounter,
    state: ReadState,
    buf: Vec<u8>,
}

impl RecordReader {
    fn new(key: DirectionKey) -> Self {
        Self {
            nonce: NonceCounter::new(&key.nonce_seed),
            aead: key.aead,
            state: ReadState::Length { filled: 0 },
            buf: Vec::new(),
        }
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        self.state = ReadState::Failed(err.kind());
        self.buf.zeroize();
        err
    }

    fn open(&mut self, len: usize) -> Result<usize, CipherError> {
        let nonce = self.nonce.current()?;
        let n = self.aead.open_in_place(nonce, &mut self.buf[..len])?;
        self.nonce.increment();
        Ok(n)
    }

    /// Drive the reader until decrypted plaintext is available.
    ///
    /// `Ok(false)` is a clean EOF on a record boundary.
    fn poll_record<S: AsyncRead + Unpin>(
        &mut self,
        inner: &mut S,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<bool>> {
        loop {
            let (target, filled) = match self.state {
                ReadState::Length { filled } => (LENGTH_SIZE + TAG_SIZE, filled),
                ReadState::Payload { len, filled } => (len + TAG_SIZE, filled),
                ReadState::Plain { .. } => return Poll::Ready(Ok(true)),
                ReadState::Failed(kind) => return Poll::Ready(Err(poisoned(kind))),
            };

            if filled < target {
                if self.buf.len() < target {
                    self.buf.resize(target, 0);
                }
                let mut rb = ReadBuf::new(&mut self.buf[filled..target]);
                if let Err(e) = ready!(Pin::new(&mut *inner).poll_read(cx, &mut rb)) {
                    return Poll::Ready(Err(self.fail(e)));
                }
                let n = rb.filled().len();

                if n == 0 {
                    if filled == 0 && matches!(self.state, ReadState::Length { .. }) {
                        return Poll::Ready(Ok(false));
                    }
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed in the middle of a record",
                    );
                    return Poll::Ready(Err(self.fail(err)));
                }

                self.state = match self.state {
                    ReadState::Length { .. } => ReadState::Length { filled: filled + n },
                    ReadState::Payload { len, .. } => ReadState::Payload {
                        len,
                        filled: filled + n,
                    },
                    other => other,
                };
                continue;
            }

            let plain_len = match self.open(target) {
                Ok(n) => n,
                Err(e) => return Poll::Ready(Err(self.fail(e.into()))),
            };

            self.state = match self.state {
                ReadState::Length { .. } => {
                    let len = usize::from(u16::from_be_bytes([self.buf[0], self.buf[1]]));
                    if len == 0 {
                        ReadState::Length { filled: 0 }
                    } else {
                        ReadState::Payload { len, filled: 0 }
                    }
                }
                _ => ReadState::Plain {
                    pos: 0,
                    end: plain_len,
                },
            };
        }
    }
}

struct RecordWriter {
    aead: SessionAead,
    nonce: NonceCounter,
    pending: Vec<u8>,
    written: usize,
    failed: Option<io::ErrorKind>,
}

impl RecordWriter {
    fn new(key: DirectionKey) -> Self {
        Self {
            nonce: NonceCounter::new(&key.nonce_seed),
            aead: key.aead,
            pending: Vec::new(),
            written: 0,
            failed: None,
        }
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        self.failed = Some(err.kind());
        self.pending.clear();
        self.written = 0;
        err
    }

    fn seal_record(&mut self, plaintext: &[u8]) -> Result<(), CipherError> {
        let nonce = self.nonce.current()?;
        self.aead.seal_append(nonce, plaintext, &mut self.pending)?;
        self.nonce.increment();
        Ok(())
    }

    fn seal_chunk(&mut self, chunk: &[u8]) -> Result<(), CipherError> {
        let start = self.pending.len();
        let len = u16::try_from(chunk.len()).map_err(|_| CipherError::OversizedPacket {
            len: chunk.len(),
            max: MAX_CHUNK_SIZE,
        })?;

        let sealed = match self.seal_record(&len.to_be_bytes()) {
            Ok(()) => self.seal_record(chunk),
            Err(e) => Err(e),
        };
        if sealed.is_err() {
            self.pending.truncate(start);
        }
        sealed
    }

    fn poll_drain<S: AsyncWrite + Unpin>(
        &mut self,
        inner: &mut S,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let unsent = &self.pending[self.written..];
            let n = match ready!(Pin::new(&mut *inner).poll_write(cx, unsent)) {
                Ok(n) => n,
                Err(e) => return Poll::Ready(Err(self.fail(e))),
            };
            if n == 0 {
                return Poll::Ready(Err(self.fail(io::ErrorKind::WriteZero.into())));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

/// An encrypted byte stream over `S`.
///
/// Like a socket, one reader and one writer at a time. Use
/// [`tokio::io::split`] to drive both halves from different tasks.
pub struct StreamConn<S> {
    inner: S,
    reader: RecordReader,
    writer: RecordWriter,
}

impl<S> StreamConn<S> {
    pub fn new(inner: S, keys: SessionKeys) -> Self {
        Self {
            inner,
            reader: RecordReader::new(keys.read),
            writer: RecordWriter::new(keys.write),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Nonce the next inbound record must have been sealed with.
    pub fn read_nonce(&self) -> &NonceCounter {
        &self.reader.nonce
    }

    /// Nonce the next outbound record will be sealed with.
    pub fn write_nonce(&self) -> &NonceCounter {
        &self.writer.nonce
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for StreamConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if let ReadState::Plain { pos, end } = this.reader.state {
                let n = (end - pos).min(out.remaining());
                out.put_slice(&this.reader.buf[pos..pos + n]);
                this.reader.state = if pos + n == end {
                    ReadState::Length { filled: 0 }
                } else {
                    ReadState::Plain { pos: pos + n, end }
                };
                return Poll::Ready(Ok(()));
            }

            if !ready!(this.reader.poll_record(&mut this.inner, cx))? {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for StreamConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(kind) = this.writer.failed {
            return Poll::Ready(Err(poisoned(kind)));
        }

        ready!(this.writer.poll_drain(&mut this.inner, cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &buf[..buf.len().min(MAX_CHUNK_SIZE)];
        if let Err(e) = this.writer.seal_chunk(chunk) {
            return Poll::Ready(Err(this.writer.fail(e.into())));
        }

        // The chunk is committed once sealed; flushing it can finish later.
        match this.writer.poll_drain(&mut this.inner, cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            _ => Poll::Ready(Ok(chunk.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(kind) = this.writer.failed {
            return Poll::Ready(Err(poisoned(kind)));
        }
        ready!(this.writer.poll_drain(&mut this.inner, cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.writer.failed.is_none() {
            ready!(this.writer.poll_drain(&mut this.inner, cx))?;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S> std::fmt::Debug for StreamConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConn")
            .field("read_state", &self.reader.state)
            .field("write_pending", &(self.writer.pending.len() - self.writer.written))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::suite_for;
    use crate::hash::Sha256Hash;
    use crate::state::Role;
    use proptest::prelude::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use yuubinsya_common::CryptoMethod;

    fn keys(role: Role, method: CryptoMethod) -> SessionKeys {
        let (local, peer) = match role {
            Role::Client => (10u64, 20u64),
            Role::Server => (20u64, 10u64),
        };
        SessionKeys::derive(
            &Sha256Hash,
            suite_for(method),
            role,
            &[3u8; 32],
            &[4u8; 32],
            &local.to_be_bytes(),
            &peer.to_be_bytes(),
        )
        .unwrap()
    }

    fn pair(method: CryptoMethod) -> (StreamConn<DuplexStream>, StreamConn<DuplexStream>) {
        let (a, b) = duplex(4096);
        (
            StreamConn::new(a, keys(Role::Client, method)),
            StreamConn::new(b, keys(Role::Server, method)),
        )
    }

    #[test]
    fn test_counter_carries() {
        let mut counter = NonceCounter::new(&[0x00, 0x00, 0xff]);
        counter.increment();
        assert_eq!(counter.current().unwrap(), &[0x00, 0x01, 0x00]);
        counter.decrement();
        assert_eq!(counter.current().unwrap(), &[0x00, 0x00, 0xff]);
    }

    #[test]
    fn test_counter_exhaustion() {
        let mut counter = NonceCounter::new(&[0xff; 12]);
        assert!(counter.current().is_ok());
        counter.increment();
        assert!(counter.is_exhausted());
        assert!(matches!(
            counter.current(),
            Err(CipherError::NonceExhausted)
        ));

        counter.decrement();
        assert_eq!(counter.current().unwrap(), &[0xff; 12]);
    }

    proptest! {
        #[test]
        fn prop_decrement_inverts_increment(
            seed in proptest::collection::vec(any::<u8>(), 12),
            steps in 1usize..64,
        ) {
            let mut counter = NonceCounter::new(&seed);
            for _ in 0..steps {
                counter.increment();
            }
            for _ in 0..steps {
                counter.decrement();
            }
            prop_assert_eq!(counter.current().unwrap(), &seed[..]);
        }

        #[test]
        fn prop_stream_fidelity(data in proptest::collection::vec(any::<u8>(), 0..20_000)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let echoed = rt.block_on(async {
                let (mut client, mut server) = pair(CryptoMethod::ChaCha20Poly1305);
                let expected = data.len();
                let send = data.clone();
                let writer = tokio::spawn(async move {
                    client.write_all(&send).await.unwrap();
                    client.shutdown().await.unwrap();
                });
                let mut got = Vec::with_capacity(expected);
                server.read_to_end(&mut got).await.unwrap();
                writer.await.unwrap();
                got
            });
            prop_assert_eq!(echoed, data);
        }
    }

    #[tokio::test]
    async fn test_roundtrip_both_directions() {
        for method in [CryptoMethod::ChaCha20Poly1305, CryptoMethod::XChaCha20Poly1305] {
            let (mut client, mut server) = pair(method);

            client.write_all(b"hello server").await.unwrap();
            client.flush().await.unwrap();
            let mut buf = [0u8; 12];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello server");

            server.write_all(b"hello client").await.unwrap();
            server.flush().await.unwrap();
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello client");
        }
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let (mut client, mut server) = pair(CryptoMethod::XChaCha20Poly1305);
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let send = data.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&send).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, data);

        // 200_000 bytes span four chunks, two records each.
        let client = writer.await.unwrap();
        let seed = keys(Role::Client, CryptoMethod::XChaCha20Poly1305).write.nonce_seed;
        let mut expected = NonceCounter::new(&seed);
        for _ in 0..8 {
            expected.increment();
        }
        assert_eq!(
            client.write_nonce().current().unwrap(),
            expected.current().unwrap()
        );
        assert_eq!(
            server.read_nonce().current().unwrap(),
            expected.current().unwrap()
        );
    }

    #[tokio::test]
    async fn test_tampered_record_poisons_reader() {
        let (raw_client, mut raw_server) = duplex(4096);
        let mut client =
            StreamConn::new(raw_client, keys(Role::Client, CryptoMethod::ChaCha20Poly1305));

        client.write_all(b"payload").await.unwrap();
        client.flush().await.unwrap();

        let mut wire = vec![0u8; (LENGTH_SIZE + TAG_SIZE) + 7 + TAG_SIZE];
        raw_server.read_exact(&mut wire).await.unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let (mut feed, sink) = duplex(4096);
        let mut server =
            StreamConn::new(sink, keys(Role::Server, CryptoMethod::ChaCha20Poly1305));
        feed.write_all(&wire).await.unwrap();

        let mut buf = [0u8; 7];
        let err = server.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // Sticky: later reads fail without touching the transport.
        let err = server.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_eof_mid_record() {
        let (mut feed, sink) = duplex(64);
        let mut server =
            StreamConn::new(sink, keys(Role::Server, CryptoMethod::ChaCha20Poly1305));
        feed.write_all(&[0u8; 5]).await.unwrap();
        drop(feed);

        let mut buf = [0u8; 4];
        let err = server.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (client, mut server) = pair(CryptoMethod::ChaCha20Poly1305);
        drop(client);
        let mut buf = [0u8; 4];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replayed_record_rejected() {
        let (raw_client, mut raw_server) = duplex(4096);
        let mut client =
            StreamConn::new(raw_client, keys(Role::Client, CryptoMethod::ChaCha20Poly1305));

        client.write_all(b"once").await.unwrap();
        client.flush().await.unwrap();
        let mut wire = vec![0u8; (LENGTH_SIZE + TAG_SIZE) + 4 + TAG_SIZE];
        raw_server.read_exact(&mut wire).await.unwrap();

        let (mut feed, sink) = duplex(4096);
        let mut server =
            StreamConn::new(sink, keys(Role::Server, CryptoMethod::ChaCha20Poly1305));
        feed.write_all(&wire).await.unwrap();
        feed.write_all(&wire).await.unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"once");
        assert!(server.read_exact(&mut buf).await.is_err());
    }

    fn near_exhausted_seed() -> Zeroizing<Vec<u8>> {
        let mut seed = vec![0xffu8; 12];
        seed[11] = 0xfe;
        Zeroizing::new(seed)
    }

    #[tokio::test]
    async fn test_exhausted_write_nonce_closes_writer() {
        let (raw_client, mut raw_server) = duplex(4096);
        let mut session = keys(Role::Client, CryptoMethod::ChaCha20Poly1305);
        session.write.nonce_seed = near_exhausted_seed();
        let mut client = StreamConn::new(raw_client, session);

        // One record takes the last two nonces.
        client.write_all(b"x").await.unwrap();
        client.flush().await.unwrap();
        assert!(client.write_nonce().is_exhausted());

        let err = client.write_all(b"y").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(err.to_string().contains("exhausted"), "{err}");

        let err = client.write_all(b"z").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(err.to_string().contains("failed earlier"), "{err}");
        assert!(client.flush().await.is_err());

        drop(client);
        let mut wire = Vec::new();
        raw_server.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), (LENGTH_SIZE + TAG_SIZE) + 1 + TAG_SIZE);
    }

    #[tokio::test]
    async fn test_exhausted_read_nonce_closes_reader() {
        let (raw_client, mut raw_server) = duplex(4096);
        let mut client_keys = keys(Role::Client, CryptoMethod::ChaCha20Poly1305);
        client_keys.write.nonce_seed = near_exhausted_seed();
        let mut client = StreamConn::new(raw_client, client_keys);
        client.write_all(b"x").await.unwrap();
        client.flush().await.unwrap();

        let mut wire = vec![0u8; (LENGTH_SIZE + TAG_SIZE) + 1 + TAG_SIZE];
        raw_server.read_exact(&mut wire).await.unwrap();
        // Whatever follows must not be opened under a wrapped nonce.
        wire.extend_from_slice(&[0u8; LENGTH_SIZE + TAG_SIZE]);

        let (mut feed, sink) = duplex(4096);
        let mut server_keys = keys(Role::Server, CryptoMethod::ChaCha20Poly1305);
        server_keys.read.nonce_seed = near_exhausted_seed();
        let mut server = StreamConn::new(sink, server_keys);
        feed.write_all(&wire).await.unwrap();

        let mut buf = [0u8; 1];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
        assert!(server.read_nonce().is_exhausted());

        let err = server.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(err.to_string().contains("exhausted"), "{err}");

        let err = server.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(err.to_string().contains("failed earlier"), "{err}");
    }
}
