//! Router session configuration and sealed credentials
//!
//! Passwords are stored as `base64(nonce || AES-256-GCM ciphertext)` and are only
//! opened by a [`SecretStore`] when a session connects.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::{Result, RouterError, API_PORT};

/// Sealed secret as stored in configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedSecret(String);

impl EncryptedSecret {
    pub fn new(sealed: impl Into<String>) -> Self {
        Self(sealed.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptedSecret(..)")
    }
}

/// Opens sealed secrets
pub trait SecretStore: Send + Sync {
    /// Decrypt `secret`; the caller must not keep the result around
    fn reveal(&self, secret: &EncryptedSecret) -> Result<String>;
}

/// AES-256-GCM secret store
pub struct AeadSecretStore {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AeadSecretStore {
    /// Build from a raw 256-bit key
    pub fn new(key: &[u8]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| RouterError::Credential("credential key must be 32 bytes".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build from a hex encoded 256-bit key
    pub fn from_hex(key: &str) -> Result<Self> {
        let raw = hex::decode(key.trim())
            .map_err(|e| RouterError::Credential(format!("credential key is not hex: {}", e)))?;
        Self::new(&raw)
    }

    /// Seal a plaintext secret (used by provisioning tools and tests)
    pub fn seal(&self, plaintext: &str) -> Result<EncryptedSecret> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| RouterError::Credential("random source unavailable".into()))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| RouterError::Credential("seal failed".into()))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&in_out);
        Ok(EncryptedSecret(STANDARD.encode(sealed)))
    }
}

impl SecretStore for AeadSecretStore {
    fn reveal(&self, secret: &EncryptedSecret) -> Result<String> {
        let raw = STANDARD
            .decode(secret.as_str())
            .map_err(|e| RouterError::Credential(format!("sealed secret is not base64: {}", e)))?;
        if raw.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(RouterError::Credential("sealed secret too short".into()));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| RouterError::Credential("bad nonce".into()))?;
        let mut buf = ciphertext.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| RouterError::Credential("sealed secret failed authentication".into()))?;

        String::from_utf8(plain.to_vec())
            .map_err(|_| RouterError::Credential("secret is not UTF-8".into()))
    }
}

/// Login credentials for one router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub username: String,
    pub password: EncryptedSecret,
}

/// Connection settings for one router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session name customers reference
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub credentials: SessionCredentials,
}

fn default_port() -> u16 {
    API_PORT
}

impl SessionConfig {
    /// `host:port` to dial
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject configurations missing host, user or password
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty()
            || self.credentials.username.trim().is_empty()
            || self.credentials.password.is_empty()
        {
            return Err(RouterError::IncompleteCredentials(self.name.clone()));
        }
        Ok(())
    }
}

/// Lookup of router session settings by name
pub trait SessionConfigRepository: Send + Sync {
    fn get(&self, name: &str) -> Option<SessionConfig>;
}

/// In-memory session settings
#[derive(Default)]
pub struct InMemorySessionConfigs {
    configs: RwLock<HashMap<String, SessionConfig>>,
}

impl InMemorySessionConfigs {
    pub fn new(configs: impl IntoIterator<Item = SessionConfig>) -> Self {
        Self {
            configs: RwLock::new(configs.into_iter().map(|c| (c.name.clone(), c)).collect()),
        }
    }

    /// Insert or replace a session's settings
    pub fn upsert(&self, config: SessionConfig) {
        self.configs.write().insert(config.name.clone(), config);
    }
}

impl SessionConfigRepository for InMemorySessionConfigs {
    fn get(&self, name: &str) -> Option<SessionConfig> {
        self.configs.read().get(name).cloned()
    }
}
