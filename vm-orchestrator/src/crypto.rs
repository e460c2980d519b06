//! Symmetric encryption for secrets at rest (cloud keys, deploy tokens)

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::error::{OrchestratorError, Result};

/// Number of PBKDF2 iterations for key derivation
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length in bytes
pub const SALT_LENGTH: usize = 32;

/// AES-GCM nonce length in bytes
const NONCE_LENGTH: usize = 12;

/// Encrypt/decrypt collaborator used by the vault and the orchestrator
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    fn decrypt(&self, encrypted: &str) -> Result<String>;
}

/// AES-256-GCM cipher keyed from a master password
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Derive the key from a master password and salt
    pub fn derive_from_password(password: &str, salt: &[u8]) -> Result<Self> {
        if salt.len() != SALT_LENGTH {
            return Err(OrchestratorError::Crypto(format!(
                "Salt must be {} bytes long",
                SALT_LENGTH
            )));
        }

        let mut key = [0u8; 32]; // 256 bits for AES-256
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| OrchestratorError::Crypto(format!("Failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }
}

impl SecretCipher for AesGcmCipher {
    /// Output is base64 of `nonce || ciphertext`
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| OrchestratorError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(combined))
    }

    fn decrypt(&self, encrypted: &str) -> Result<String> {
        let combined = STANDARD
            .decode(encrypted)
            .map_err(|e| OrchestratorError::Crypto(format!("Failed to decode base64: {}", e)))?;

        if combined.len() < NONCE_LENGTH {
            return Err(OrchestratorError::Crypto(
                "Encrypted data too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| OrchestratorError::Crypto(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext).map_err(|_| {
            OrchestratorError::Crypto("Decrypted data is not valid UTF-8".to_string())
        })
    }
}

/// Generate a cryptographically secure random salt
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_roundtrip() {
        let salt = generate_salt();
        let cipher = AesGcmCipher::derive_from_password("test-password", &salt).unwrap();

        let encrypted = cipher.encrypt("AKIAABCDEFGH1234").unwrap();
        assert_ne!(encrypted, "AKIAABCDEFGH1234");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "AKIAABCDEFGH1234");
    }

    #[test]
    fn test_nonce_differs_per_encryption() {
        let cipher = AesGcmCipher::derive_from_password("pw", &generate_salt()).unwrap();
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn test_different_keys_fail_decryption() {
        let salt = generate_salt();
        let key1 = AesGcmCipher::derive_from_password("password1", &salt).unwrap();
        let key2 = AesGcmCipher::derive_from_password("password2", &salt).unwrap();

        let encrypted = key1.encrypt("secret").unwrap();
        assert!(matches!(
            key2.decrypt(&encrypted),
            Err(OrchestratorError::Crypto(_))
        ));
    }

    #[test]
    fn test_rejects_short_salt_and_garbage() {
        assert!(AesGcmCipher::derive_from_password("pw", &[0u8; 8]).is_err());

        let cipher = AesGcmCipher::derive_from_password("pw", &generate_salt()).unwrap();
        assert!(cipher.decrypt("not base64!").is_err());
        assert!(cipher.decrypt(&STANDARD.encode([1u8; 4])).is_err());
    }
}
