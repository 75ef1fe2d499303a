use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;
use crate::kdf::derive_key;

/// AES-256-GCM nonce size in bytes.
const NONCE_SIZE: usize = 12;

/// Encrypts `plaintext` using AES-256-GCM with the given 32-byte `key`.
///
/// A random 12-byte nonce is generated and prepended to the ciphertext. The
/// returned vector has the layout: `[nonce (12 bytes) | ciphertext + tag]`.
pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);

    Ok(output)
}

/// Decrypts data previously encrypted with [`encrypt`].
pub fn decrypt(ciphertext_with_nonce: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext_with_nonce.len() < NONCE_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "ciphertext too short: expected at least {} bytes, got {}",
            NONCE_SIZE,
            ciphertext_with_nonce.len()
        )));
    }

    let (nonce_bytes, ciphertext) = ciphertext_with_nonce.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

/// At-rest cipher for wallet private keys.
///
/// Private keys are stored as hex strings of `nonce | ciphertext + tag`. The
/// 32-byte AES key is held for the lifetime of the process and wiped on drop.
pub struct KeyCipher {
    key: Zeroizing<[u8; 32]>,
}

impl KeyCipher {
    /// Wrap an existing 32-byte AES key.
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Derive the at-rest key from an operator passphrase and deployment salt.
    pub fn from_passphrase(passphrase: &[u8], salt: &[u8; 16]) -> Result<Self, CryptoError> {
        let mut key = derive_key(passphrase, salt)?;
        let cipher = Self::new(key);
        key.zeroize();
        Ok(cipher)
    }

    /// Parse a hex-encoded 32-byte key.
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(key_hex.trim())
                .map_err(|e| CryptoError::InvalidInput(format!("key is not hex: {e}")))?,
        );
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self::new(key))
    }

    /// Encrypt a private key (WIF) for storage.
    pub fn seal(&self, secret: &str) -> Result<String, CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::InvalidInput("empty secret".into()));
        }
        let sealed = encrypt(secret.as_bytes(), &self.key)?;
        Ok(hex::encode(sealed))
    }

    /// Decrypt a stored private key. The plaintext is zeroed when dropped.
    pub fn open(&self, sealed_hex: &str) -> Result<Zeroizing<String>, CryptoError> {
        let sealed = hex::decode(sealed_hex)
            .map_err(|e| CryptoError::InvalidInput(format!("sealed key is not hex: {e}")))?;
        let plaintext = Zeroizing::new(decrypt(&sealed, &self.key)?);
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| CryptoError::DecryptionFailed("plaintext is not utf-8".into()))?;
        Ok(Zeroizing::new(text.to_owned()))
    }
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyCipher(..)")
    }
}
