//! Secrets at rest: ChaCha20-Poly1305 for instance passwords, Argon2id for
//! local account passwords.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use vp_domain::{Error, Result};

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

/// Symmetric cipher for secrets at rest. The ciphertext layout is
/// `nonce || ciphertext+tag` so a row is self-contained.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    /// Derive a fixed-size key from the configured `ENCRYPTION_KEY` string.
    pub fn from_key_string(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("cipher init: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Internal(format!("encrypt: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() <= NONCE_SIZE {
            return Err(Error::Internal("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);

        let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("cipher init: {e}")))?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| Error::Internal(format!("decrypt: {e}")))
    }

    pub fn decrypt_string(&self, blob: &[u8]) -> Result<String> {
        let bytes = self.decrypt(blob)?;
        String::from_utf8(bytes).map_err(|_| Error::Internal("decrypted secret is not UTF-8".into()))
    }
}

/// Hash a password with Argon2id (default parameters, random salt).
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Internal(format!("password hash: {e}")))
}

/// Verify a password against a stored PHC string.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = SecretCipher::from_key_string("some-long-encryption-key-for-tests");
        let blob = cipher.encrypt(b"vault-password").unwrap();
        assert_ne!(&blob[NONCE_SIZE..], b"vault-password");
        let plain = cipher.decrypt_string(&blob).unwrap();
        assert_eq!(plain, "vault-password");
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let cipher = SecretCipher::from_key_string("some-long-encryption-key-for-tests");
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let cipher = SecretCipher::from_key_string("key-one");
        let other = SecretCipher::from_key_string("key-two");
        let blob = cipher.encrypt(b"secret").unwrap();
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let cipher = SecretCipher::from_key_string("key");
        assert!(cipher.decrypt(&[0u8; 4]).is_err());
    }

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("hunter2-but-longer").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter2-but-longer", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("hunter2-but-longer", "not-a-hash"));
    }

    #[test]
    fn same_password_hashes_differently() {
        let a = hash_password("pw").unwrap();
        let b = hash_password("pw").unwrap();
        assert_ne!(a, b);
    }
}
