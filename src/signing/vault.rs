use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::SigningError;

const NONCE_LENGTH: usize = 12;

/// Encrypts channel account seeds at rest with AES-256-GCM.
///
/// Stored format: base64(nonce || ciphertext). The key is SHA-256 of the
/// configured passphrase.
#[derive(Clone)]
pub struct KeyVault {
    key: [u8; 32],
}

impl KeyVault {
    pub fn new(passphrase: &str) -> Result<Self, SigningError> {
        if passphrase.is_empty() {
            return Err(SigningError::InvalidKey("encryption passphrase cannot be empty".into()));
        }
        Ok(Self {
            key: Sha256::digest(passphrase.as_bytes()).into(),
        })
    }

    pub fn encrypt(&self, secret: &str) -> Result<String, SigningError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| SigningError::InvalidKey("encryption failed".into()))?;
        let nonce_bytes: [u8; NONCE_LENGTH] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret.as_bytes())
            .map_err(|_| SigningError::InvalidKey("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, SigningError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| SigningError::InvalidKey("stored secret is not valid base64".into()))?;
        if data.len() < NONCE_LENGTH {
            return Err(SigningError::InvalidKey("stored secret is too short".into()));
        }

        let (nonce, ciphertext) = data.split_at(NONCE_LENGTH);
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| SigningError::InvalidKey("decryption failed".into()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SigningError::InvalidKey("decryption failed -- wrong passphrase or corrupted secret".into()))?;
        String::from_utf8(plaintext).map_err(|_| SigningError::InvalidKey("decrypted secret is not utf-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let vault = KeyVault::new("passphrase").unwrap();
        let sealed = vault.encrypt("SSECRET").unwrap();
        assert_ne!(sealed, "SSECRET");
        assert_eq!(vault.decrypt(&sealed).unwrap(), "SSECRET");
    }

    #[test]
    fn test_nonces_differ() {
        let vault = KeyVault::new("passphrase").unwrap();
        assert_ne!(vault.encrypt("SSECRET").unwrap(), vault.encrypt("SSECRET").unwrap());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealed = KeyVault::new("right").unwrap().encrypt("SSECRET").unwrap();
        assert!(KeyVault::new("wrong").unwrap().decrypt(&sealed).is_err());
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(KeyVault::new("").is_err());
    }
}
