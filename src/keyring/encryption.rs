//! Password encryption of account secrets

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{ExtensionError, Result};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Derive an encryption key from a password and salt
pub fn derive_encryption_key(password: &str, salt: &[u8], rounds: u32) -> [u8; 32] {
    let mut key = [0u8; 32]; // 256-bit key
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, rounds, &mut key);
    key
}

/// Encrypt with AES-256-GCM. Output layout: salt ‖ nonce ‖ ciphertext.
pub fn encrypt_data(data: &[u8], password: &str, rounds: u32) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_encryption_key(password, &salt, rounds);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| ExtensionError::Crypto(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), data)
        .map_err(|_| ExtensionError::Crypto("encryption failed".to_string()))?;

    let mut result = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&salt);
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt a blob produced by [`encrypt_data`]. Any authentication failure is
/// reported as an invalid password.
pub fn decrypt_data(encrypted: &[u8], password: &str, rounds: u32) -> Result<Vec<u8>> {
    if encrypted.len() < SALT_LEN + NONCE_LEN {
        return Err(ExtensionError::Crypto("encrypted blob too short".to_string()));
    }

    let (salt, rest) = encrypted.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_encryption_key(password, salt, rounds);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| ExtensionError::Crypto(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ExtensionError::invalid_password())
}
