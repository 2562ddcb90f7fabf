use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use binmark_sdk::{KeySigner, Network};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_FILE: &str = "signing_key_encrypted.json";

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Wrong password")]
    WrongPassword,

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

#[derive(Serialize, Deserialize)]
struct EncryptedKeyFile {
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// The signing key (WIF) encrypted at rest with an Argon2-derived
/// AES-256-GCM key, one file per network.
pub struct KeyVault {
    file_path: PathBuf,
    network: Network,
}

impl KeyVault {
    pub fn new(data_dir: &Path, network: Network) -> Self {
        Self {
            file_path: data_dir.join(network.as_str()).join(KEY_FILE),
            network,
        }
    }

    pub fn exists(&self) -> bool {
        self.file_path.exists()
    }

    /// Check that `wif` is a key for this network, then store it.
    pub fn import(&self, wif: &str, password: &str) -> Result<KeySigner, VaultError> {
        let signer = KeySigner::from_wif(wif, self.network)
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        self.save(wif.trim(), password)?;
        log::info!("imported signing key for {}", signer.address());
        Ok(signer)
    }

    pub fn unlock(&self, password: &str) -> Result<KeySigner, VaultError> {
        let wif = self.load(password)?;
        KeySigner::from_wif(&wif, self.network).map_err(|e| VaultError::InvalidKey(e.to_string()))
    }

    /// AES-256-GCM keyed by Argon2 over `password` and `salt`.
    fn cipher(password: &str, salt: &[u8]) -> Result<Aes256Gcm, VaultError> {
        let mut key_bytes = Zeroizing::new([0u8; 32]);
        argon2::Argon2::default()
            .hash_password_into(password.as_bytes(), salt, &mut key_bytes[..])
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        Aes256Gcm::new_from_slice(&key_bytes[..]).map_err(|e| VaultError::Crypto(e.to_string()))
    }

    fn save(&self, wif: &str, password: &str) -> Result<(), VaultError> {
        let salt: [u8; 16] = rand::random();
        let nonce_bytes: [u8; 12] = rand::random();
        let ciphertext = Self::cipher(password, &salt)?
            .encrypt(Nonce::from_slice(&nonce_bytes), wif.as_bytes())
            .map_err(|e| VaultError::Crypto(e.to_string()))?;

        let file = EncryptedKeyFile {
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        };
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.file_path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    fn load(&self, password: &str) -> Result<Zeroizing<String>, VaultError> {
        let file: EncryptedKeyFile = serde_json::from_str(&fs::read_to_string(&self.file_path)?)?;
        let salt = decode_field("salt", &file.salt)?;
        let nonce_bytes = decode_field("nonce", &file.nonce)?;
        if nonce_bytes.len() != 12 {
            return Err(VaultError::Crypto("nonce must be 12 bytes".into()));
        }
        let ciphertext = decode_field("ciphertext", &file.ciphertext)?;

        let plaintext = Zeroizing::new(
            Self::cipher(password, &salt)?
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
                .map_err(|_| VaultError::WrongPassword)?,
        );
        let wif = std::str::from_utf8(&plaintext).map_err(|e| VaultError::Crypto(e.to_string()))?;
        Ok(Zeroizing::new(wif.to_string()))
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, VaultError> {
    BASE64
        .decode(value)
        .map_err(|e| VaultError::Crypto(format!("{name}: {e}")))
}
