//! Cryptographic operations for subscription secrets and payload signing.
//!
//! - AES-256-GCM encryption/decryption for subscription secrets at rest
//! - HMAC-SHA256 signatures over the raw payload, base64 encoded

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::DeliveryError;

/// Nonce size for AES-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Required key size for AES-256.
pub const ENCRYPTION_KEY_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// AES-256-GCM encryption/decryption (for secrets at rest)
// ---------------------------------------------------------------------------

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, DeliveryError> {
    if key.len() != ENCRYPTION_KEY_LEN {
        return Err(DeliveryError::EncryptionFailed(format!(
            "Invalid key length: expected {ENCRYPTION_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }

    Aes256Gcm::new_from_slice(key).map_err(|e| DeliveryError::EncryptionFailed(e.to_string()))
}

/// Encrypt a plaintext secret to a base64-encoded string for DB storage.
///
/// Format: base64(nonce || ciphertext || auth_tag)
pub fn encrypt_secret(plaintext: &str, key: &[u8]) -> Result<String, DeliveryError> {
    use rand::rngs::OsRng;
    use rand::RngCore;

    let cipher = cipher_for(key)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| DeliveryError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&result))
}

/// Decrypt a base64-encoded secret from DB storage back to plaintext.
pub fn decrypt_secret(encoded: &str, key: &[u8]) -> Result<String, DeliveryError> {
    let cipher = cipher_for(key)?;

    let encrypted = BASE64
        .decode(encoded)
        .map_err(|e| DeliveryError::EncryptionFailed(format!("Base64 decode failed: {e}")))?;

    if encrypted.len() < NONCE_SIZE + 1 {
        return Err(DeliveryError::EncryptionFailed(
            "Invalid encrypted data format".to_string(),
        ));
    }

    let (nonce, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| DeliveryError::EncryptionFailed(e.to_string()))?;

    String::from_utf8(plaintext).map_err(|e| DeliveryError::EncryptionFailed(e.to_string()))
}

// ---------------------------------------------------------------------------
// HMAC-SHA256 payload signing
// ---------------------------------------------------------------------------

/// Sign a payload with the subscription secret.
///
/// Returns base64(HMAC-SHA256(secret, payload)).
pub fn sign_payload(secret: &str, payload: &[u8]) -> Result<String, DeliveryError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::Signing(e.to_string()))?;
    mac.update(payload);

    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Verify a base64 signature using constant-time comparison.
#[must_use]
pub fn verify_signature(signature_b64: &str, secret: &str, payload: &[u8]) -> bool {
    match sign_payload(secret, payload) {
        Ok(computed) => constant_time_eq(signature_b64.as_bytes(), computed.as_bytes()),
        Err(_) => false,
    }
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
