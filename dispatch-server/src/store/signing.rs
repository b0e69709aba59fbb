//! Signed, expiring object URLs.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signed URL expired")]
    Expired,
    #[error("Invalid signature")]
    Invalid,
}

/// Signs `(key, expires)` pairs with a shared secret.
#[derive(Clone)]
pub struct UrlSigner {
    secret: String,
}

impl UrlSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Hex SHA-256 over the secret, key and expiry (unix seconds).
    pub fn sign(&self, key: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self, key: &str, expires: i64, signature: &str, now: i64) -> Result<(), SignatureError> {
        if now > expires {
            return Err(SignatureError::Expired);
        }
        if self.sign(key, expires) != signature.to_ascii_lowercase() {
            return Err(SignatureError::Invalid);
        }
        Ok(())
    }
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = UrlSigner::new("secret");
        let sig = signer.sign("frames/helmet/cam-1/a.jpg", 1_000);
        assert_eq!(sig.len(), 64);
        assert!(signer.verify("frames/helmet/cam-1/a.jpg", 1_000, &sig, 999).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let signer = UrlSigner::new("secret");
        let sig = signer.sign("frames/helmet/cam-1/a.jpg", 1_000);
        assert_eq!(
            signer.verify("frames/helmet/cam-1/b.jpg", 1_000, &sig, 0),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn test_verify_rejects_expired() {
        let signer = UrlSigner::new("secret");
        let sig = signer.sign("k", 1_000);
        assert_eq!(signer.verify("k", 1_000, &sig, 1_001), Err(SignatureError::Expired));
    }

    #[test]
    fn test_different_secrets_differ() {
        assert_ne!(UrlSigner::new("a").sign("k", 1), UrlSigner::new("b").sign("k", 1));
    }
}
