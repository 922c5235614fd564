use crate::domain::devices::DevicePublicKey;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Context;
use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::path::Path;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

pub const HKDF_SALT: &[u8] = b"talkie-bridge-v1";
pub const AUTH_KEY_INFO: &[u8] = b"talkie-bridge-auth";
pub const ENCRYPTION_KEY_INFO: &[u8] = b"talkie-bridge-encrypt";
pub const HOST_KEY_FILE: &str = "host_key.json";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("peer public key rejected: {0}")]
    InvalidPeerKey(String),
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("envelope is malformed: {0}")]
    InvalidEnvelope(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostKeyFile {
    secret_key: String,
    public_key: String,
    created_at: DateTime<Utc>,
}

/// The host's long-lived P-256 identity.
pub struct CryptoStore {
    secret: SecretKey,
    public_key: DevicePublicKey,
}

impl CryptoStore {
    /// Loads `host_key.json` from `state_dir`, generating it on first run.
    pub fn load_or_create(state_dir: &Path) -> anyhow::Result<Self> {
        let path = state_dir.join(HOST_KEY_FILE);
        if path.exists() {
            let data = std::fs::read(&path)
                .with_context(|| format!("reading host key {}", path.display()))?;
            let file: HostKeyFile = serde_json::from_slice(&data)
                .with_context(|| format!("parsing host key {}", path.display()))?;
            let bytes = BASE64_STANDARD
                .decode(file.secret_key.trim())
                .with_context(|| format!("decoding host key {}", path.display()))?;
            let secret = SecretKey::from_slice(&bytes)
                .map_err(|_| anyhow::anyhow!("host key {} is not a P-256 scalar", path.display()))?;
            return Ok(Self::from_secret(secret));
        }

        let store = Self::from_secret(SecretKey::random(&mut OsRng));
        store.persist(&path)?;
        info!(path = %path.display(), "generated host key pair");
        Ok(store)
    }

    /// In-memory identity that is never written to disk.
    pub fn ephemeral() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public_key = DevicePublicKey::from_public_key(&secret.public_key());
        Self { secret, public_key }
    }

    fn persist(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }
        let file = HostKeyFile {
            secret_key: BASE64_STANDARD.encode(self.secret.to_bytes()),
            public_key: self.public_key.to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing host key {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("restricting host key {}", path.display()))?;
        }
        Ok(())
    }

    pub fn public_key(&self) -> &DevicePublicKey {
        &self.public_key
    }

    pub fn derive_keys(&self, peer: &DevicePublicKey) -> Result<DerivedKeySet, CryptoError> {
        let peer = peer.to_public_key().map_err(CryptoError::InvalidPeerKey)?;
        derive_key_set(&self.secret, &peer)
    }
}

impl fmt::Debug for CryptoStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoStore")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// ECDH then HKDF-SHA256 twice, once per purpose. Either side of the pair
/// arrives at the same keys.
pub fn derive_key_set(secret: &SecretKey, peer: &PublicKey) -> Result<DerivedKeySet, CryptoError> {
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared.raw_secret_bytes().as_slice());
    let mut auth_key = [0u8; 32];
    let mut encryption_key = [0u8; 32];
    hkdf.expand(AUTH_KEY_INFO, &mut auth_key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    hkdf.expand(ENCRYPTION_KEY_INFO, &mut encryption_key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(DerivedKeySet {
        auth_key,
        encryption_key,
    })
}

/// Per-device keys; recomputed on demand and never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKeySet {
    auth_key: [u8; 32],
    encryption_key: [u8; 32],
}

/// AES-256-GCM payload as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub nonce: String,
    pub ciphertext: String,
}

impl DerivedKeySet {
    pub fn auth_key(&self) -> &[u8; 32] {
        &self.auth_key
    }

    pub fn encryption_key(&self) -> &[u8; 32] {
        &self.encryption_key
    }

    fn mac(&self) -> Result<HmacSha256, CryptoError> {
        <HmacSha256 as Mac>::new_from_slice(&self.auth_key).map_err(|_| CryptoError::KeyDerivation)
    }

    /// Base64 HMAC-SHA256 over `message`.
    pub fn sign(&self, message: &[u8]) -> Result<String, CryptoError> {
        let mut mac = self.mac()?;
        mac.update(message);
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a base64 signature.
    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        let signature = signature.trim();
        let Ok(provided) = BASE64_STANDARD
            .decode(signature)
            .or_else(|_| URL_SAFE_NO_PAD.decode(signature.trim_end_matches('=')))
        else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(message);
        let expected = mac.finalize().into_bytes();
        expected.as_slice().ct_eq(&provided).into()
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        <Aes256Gcm as KeyInit>::new_from_slice(&self.encryption_key).map_err(|_| CryptoError::KeyDerivation)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedEnvelope, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(SealedEnvelope {
            nonce: BASE64_STANDARD.encode(nonce),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
        })
    }

    pub fn open(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>, CryptoError> {
        let nonce = BASE64_STANDARD
            .decode(envelope.nonce.trim())
            .map_err(|err| CryptoError::InvalidEnvelope(format!("nonce: {err}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidEnvelope(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let ciphertext = BASE64_STANDARD
            .decode(envelope.ciphertext.trim())
            .map_err(|err| CryptoError::InvalidEnvelope(format!("ciphertext: {err}")))?;
        self.cipher()?
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl fmt::Debug for DerivedKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKeySet { .. }")
    }
}
