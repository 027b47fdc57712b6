//! Transport configuration consumed by the handshake and datagram layers.
//!
//! The core only needs two things from the outside world: the pre-shared
//! secret and the AEAD suite. Both sides of a tunnel must agree on both.
//!
//! ```
//! use yuubinsya_common::config::{CryptoMethod, TransportConfig};
//!
//! let config = TransportConfig::from_json_str(
//!     r#"{ "password": "hunter2", "crypto_method": "xchacha20poly1305" }"#,
//! )
//! .unwrap();
//! assert_eq!(config.crypto_method, CryptoMethod::XChaCha20Poly1305);
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default bound on the whole handshake exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// AEAD construction used for session traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoMethod {
    /// ChaCha20-Poly1305 (32-byte key, 12-byte nonce)
    #[default]
    #[serde(alias = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305 (32-byte key, 24-byte nonce)
    #[serde(alias = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl CryptoMethod {
    /// Canonical lowercase name, as accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            CryptoMethod::ChaCha20Poly1305 => "chacha20poly1305",
            CryptoMethod::XChaCha20Poly1305 => "xchacha20poly1305",
        }
    }
}

impl fmt::Display for CryptoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CryptoMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chacha20poly1305" | "chacha20-poly1305" => Ok(CryptoMethod::ChaCha20Poly1305),
            "xchacha20poly1305" | "xchacha20-poly1305" => Ok(CryptoMethod::XChaCha20Poly1305),
            other => Err(Error::config(format!("unknown crypto method: {other}"))),
        }
    }
}

/// Settings shared by both ends of a tunnel.
#[derive(Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Pre-shared secret. Never transmitted.
    pub password: String,

    /// AEAD suite for session traffic.
    #[serde(default)]
    pub crypto_method: CryptoMethod,

    /// Upper bound on the handshake, in seconds.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

impl TransportConfig {
    /// Build a config with the default handshake timeout.
    pub fn new(password: impl Into<String>, crypto_method: CryptoMethod) -> Self {
        Self {
            password: password.into(),
            crypto_method,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loaded transport config");
        Self::from_json_str(&raw)
    }

    /// Reject settings that can never produce a working tunnel.
    pub fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            return Err(Error::config("password must not be empty"));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(Error::config("handshake_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Raw password bytes.
    pub fn password_bytes(&self) -> &[u8] {
        self.password.as_bytes()
    }

    /// Handshake bound as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

// Keep the secret out of logs.
impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("password", &"<redacted>")
            .field("crypto_method", &self.crypto_method)
            .field("handshake_timeout_secs", &self.handshake_timeout_secs)
            .finish()
    }
}
