//! Client and server handshake over any byte stream.
//!
//! One header is exchanged in each direction. The client speaks first with a
//! fresh salt; the server answers over the same salt with its own ephemeral
//! key. Each header carries an encrypted timestamp and an Ed25519 signature
//! from the key both sides derive from the pre-shared secret.

use std::sync::Arc;
use std::time::Duration;

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};
use yuubinsya_common::{CryptoMethod, TransportConfig};
use zeroize::Zeroizing;

use crate::aead::{suite_for, AeadSuite};
use crate::error::HandshakeError;
use crate::guard::{check_reflection, Clock, SystemClock, TimeGuard};
use crate::hash::{Hash, Sha256Hash};
use crate::header::{
    HandshakeHeader, HeaderPool, PooledHeader, PUBLIC_KEY_SIZE, SALT_SIZE, TIME_SIZE,
};
use crate::kdf::{decrypt_time, encrypt_time, SessionKeys};
use crate::signer::{password_hash, Ed25519Signer, Signer};
use crate::state::{Handshake, HandshakeTransition, Role};
use crate::stream::StreamConn;

/// Default bound on the whole exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Verified contents of a peer header.
struct PeerHeader {
    public_key: [u8; PUBLIC_KEY_SIZE],
    time: [u8; TIME_SIZE],
}

/// Runs one side of the handshake. Cheap to clone; clones share the signer
/// and the header pool.
#[derive(Clone)]
pub struct Handshaker {
    role: Role,
    method: CryptoMethod,
    password: Arc<Zeroizing<Vec<u8>>>,
    hash: Arc<dyn Hash>,
    signer: Arc<dyn Signer>,
    suite: &'static dyn AeadSuite,
    clock: Arc<dyn Clock>,
    time_guard: TimeGuard,
    timeout: Duration,
    pool: Arc<HeaderPool>,
}

impl Handshaker {
    pub fn new(role: Role, password: &[u8], method: CryptoMethod) -> Result<Self, HandshakeError> {
        let hash = Sha256Hash;
        let signer = Ed25519Signer::derive(&hash, &password_hash(&hash, password))
            .map_err(|e| HandshakeError::KeyDerivation(e.to_string()))?;

        Ok(Self {
            role,
            method,
            password: Arc::new(Zeroizing::new(password.to_vec())),
            hash: Arc::new(hash),
            signer: Arc::new(signer),
            suite: suite_for(method),
            clock: Arc::new(SystemClock),
            time_guard: TimeGuard::default(),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            pool: Arc::new(HeaderPool::default()),
        })
    }

    pub fn from_config(role: Role, config: &TransportConfig) -> Result<Self, HandshakeError> {
        Ok(Self::new(role, config.password_bytes(), config.crypto_method)?
            .with_timeout(config.handshake_timeout()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn method(&self) -> CryptoMethod {
        self.method
    }

    /// Authenticate `conn` and wrap it in the stream record cipher.
    ///
    /// The whole exchange is bounded by the configured timeout. On any
    /// error the caller should drop `conn`; nothing is retried here.
    pub async fn handshake<S>(&self, mut conn: S) -> Result<StreamConn<S>, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let keys = match tokio::time::timeout(self.timeout, self.run(&mut conn)).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(role = %self.role, timeout = ?self.timeout, "handshake timed out");
                return Err(HandshakeError::Timeout);
            }
        };
        Ok(StreamConn::new(conn, keys))
    }

    async fn run<S>(&self, conn: &mut S) -> Result<SessionKeys, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut machine = Handshake::new(self.role);
        let result = match self.role {
            Role::Client => self.client(conn, &mut machine).await,
            Role::Server => self.server(conn, &mut machine).await,
        };

        match result {
            Ok(keys) => {
                self.trace_step(machine.on_finish()?);
                debug!(role = %self.role, method = %self.method, "handshake complete");
                Ok(keys)
            }
            Err(err) => {
                match machine.on_fail() {
                    Ok(step) => debug!(
                        role = %self.role,
                        from = ?step.from,
                        error = %err,
                        "handshake failed"
                    ),
                    Err(state) => {
                        debug!(role = %self.role, error = %err, %state, "handshake failed")
                    }
                }
                Err(err)
            }
        }
    }

    async fn client<S>(
        &self,
        conn: &mut S,
        machine: &mut Handshake,
    ) -> Result<SessionKeys, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let secret = EphemeralSecret::random(&mut OsRng);
        let local_public = encoded_public_key(&secret)?;
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);

        let mut outgoing = self.pool.acquire();
        let local_time = self.seal_header(&mut outgoing, &salt, &local_public)?;
        conn.write_all(&outgoing[..]).await?;
        conn.flush().await?;
        drop(outgoing);
        self.trace_step(machine.on_send_header()?);

        let mut incoming = self.pool.acquire();
        conn.read_exact(&mut incoming[..]).await?;
        self.trace_step(machine.on_receive_header()?);

        // The server must answer over our salt.
        if !bool::from(incoming.salt().ct_eq(&salt)) {
            return Err(HandshakeError::SignatureInvalid);
        }
        let peer = self.open_header(&incoming)?;
        check_reflection(&local_public, &peer.public_key)?;

        let shared = shared_secret(&secret, &peer.public_key)?;
        let keys = SessionKeys::derive(
            self.hash.as_ref(),
            self.suite,
            Role::Client,
            &shared,
            &salt,
            &local_time,
            &peer.time,
        )?;
        self.trace_step(machine.on_derive_keys()?);
        Ok(keys)
    }

    async fn server<S>(
        &self,
        conn: &mut S,
        machine: &mut Handshake,
    ) -> Result<SessionKeys, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut incoming = self.pool.acquire();
        conn.read_exact(&mut incoming[..]).await?;
        self.trace_step(machine.on_receive_header()?);

        let peer = self.open_header(&incoming)?;
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(incoming.salt());
        drop(incoming);

        let secret = EphemeralSecret::random(&mut OsRng);
        let local_public = encoded_public_key(&secret)?;
        check_reflection(&local_public, &peer.public_key)?;

        let mut outgoing = self.pool.acquire();
        let local_time = self.seal_header(&mut outgoing, &salt, &local_public)?;
        conn.write_all(&outgoing[..]).await?;
        conn.flush().await?;
        drop(outgoing);
        self.trace_step(machine.on_send_header()?);

        let shared = shared_secret(&secret, &peer.public_key)?;
        let keys = SessionKeys::derive(
            self.hash.as_ref(),
            self.suite,
            Role::Server,
            &shared,
            &salt,
            &local_time,
            &peer.time,
        )?;
        self.trace_step(machine.on_derive_keys()?);
        Ok(keys)
    }

    fn trace_step(&self, step: HandshakeTransition) {
        trace!(
            role = %self.role,
            from = ?step.from,
            to = ?step.to,
            event = ?step.event,
            "handshake step"
        );
    }

    /// Fill `buf` with a signed header for `salt` and `public_key`, stamped
    /// with the current time. Returns the plaintext timestamp bytes.
    fn seal_header(
        &self,
        buf: &mut PooledHeader,
        salt: &[u8; SALT_SIZE],
        public_key: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<[u8; TIME_SIZE], HandshakeError> {
        let now = self.clock.unix_secs();
        let encrypted_time = encrypt_time(self.hash.as_ref(), &self.password, salt, now)?;

        let mut header = HandshakeHeader::zeroed();
        header.salt = *salt;
        header.encrypted_time = encrypted_time;
        header.public_key = *public_key;
        header.encode(buf);

        let signature = self.signer.sign(buf.signed_region());
        if signature.len() != buf.signature().len() {
            return Err(HandshakeError::KeyDerivation(format!(
                "signature is {} bytes, header holds {}",
                signature.len(),
                buf.signature().len()
            )));
        }
        buf.signature_mut().copy_from_slice(&signature);

        Ok(now.to_be_bytes())
    }

    /// Verify the signature, then the timestamp window.
    fn open_header(&self, buf: &PooledHeader) -> Result<PeerHeader, HandshakeError> {
        if !self.signer.verify(buf.signed_region(), buf.signature()) {
            return Err(HandshakeError::SignatureInvalid);
        }

        let header = HandshakeHeader::decode(&buf[..])?;
        let peer_time = decrypt_time(
            self.hash.as_ref(),
            &self.password,
            &header.salt,
            &header.encrypted_time,
        )?;
        let now = self.clock.unix_secs();
        if let Err(err) = self.time_guard.check(now, peer_time) {
            debug!(role = %self.role, now, peer_time, "peer timestamp outside window");
            return Err(err);
        }

        Ok(PeerHeader {
            public_key: header.public_key,
            time: peer_time.to_be_bytes(),
        })
    }
}

impl std::fmt::Debug for Handshaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshaker")
            .field("role", &self.role)
            .field("method", &self.method)
            .field("timeout", &self.timeout)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

fn encoded_public_key(secret: &EphemeralSecret) -> Result<[u8; PUBLIC_KEY_SIZE], HandshakeError> {
    let point = secret.public_key().to_encoded_point(false);
    <[u8; PUBLIC_KEY_SIZE]>::try_from(point.as_bytes())
        .map_err(|_| HandshakeError::InvalidPublicKey)
}

fn shared_secret(
    secret: &EphemeralSecret,
    peer_public: &[u8],
) -> Result<Zeroizing<Vec<u8>>, HandshakeError> {
    let peer =
        PublicKey::from_sec1_bytes(peer_public).map_err(|_| HandshakeError::InvalidPublicKey)?;
    let shared = secret.diffie_hellman(&peer);
    Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
}
