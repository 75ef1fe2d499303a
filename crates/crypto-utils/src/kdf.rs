use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::CryptoError;

/// Derives the 32-byte at-rest key from an operator `passphrase` and the
/// deployment `salt` using Argon2id.
///
/// Parameters:
/// - Memory: 65536 KiB (64 MB)
/// - Iterations: 3
/// - Parallelism: 4
/// - Output length: 32 bytes (suitable for AES-256)
pub fn derive_key(passphrase: &[u8], salt: &[u8; 16]) -> Result<[u8; 32], CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::InvalidInput("empty passphrase".into()));
    }

    let params = Params::new(65536, 3, 4, Some(32))
        .map_err(|e| CryptoError::KdfFailed(format!("invalid argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| CryptoError::KdfFailed(format!("argon2 hash failed: {e}")))?;

    Ok(output)
}

/// Parses the deployment salt from its 32-character hex form.
pub fn parse_salt(salt_hex: &str) -> Result<[u8; 16], CryptoError> {
    let bytes = hex::decode(salt_hex.trim())
        .map_err(|e| CryptoError::InvalidInput(format!("salt is not hex: {e}")))?;
    bytes.try_into().map_err(|v: Vec<u8>| {
        CryptoError::InvalidInput(format!("salt must be 16 bytes, got {}", v.len()))
    })
}
