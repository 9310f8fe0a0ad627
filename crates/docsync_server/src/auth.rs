//! Access tokens for the reference backend.
//!
//! Tokens are signed with HMAC-SHA256 and carry their issue time so they can
//! expire. Individual devices can be revoked, after which every token issued
//! to them is refused.
//!
//! ## Token Format
//!
//! Tokens are composed of:
//! - 16 bytes: device_id
//! - 8 bytes: issued-at timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature
//!
//! Total: 56 bytes, hex-encoded for transport.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const DEVICE_LEN: usize = 16;
const SIGNED_LEN: usize = DEVICE_LEN + 8;
const TOKEN_LEN: usize = SIGNED_LEN + 32;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and validates access tokens.
pub struct TokenValidator {
    config: AuthConfig,
    revoked: RwLock<HashSet<[u8; DEVICE_LEN]>>,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Creates a new access token for a device.
    pub fn create_token(&self, device_id: [u8; DEVICE_LEN]) -> ServerResult<String> {
        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(&device_id);
        token.extend_from_slice(&now_millis().to_be_bytes());

        let signature = self.mac(&token)?.finalize().into_bytes();
        token.extend_from_slice(&signature);
        Ok(hex::encode(token))
    }

    /// Validates a token and returns the device it was issued to.
    pub fn validate_token(&self, token: &str) -> ServerResult<[u8; DEVICE_LEN]> {
        let raw = hex::decode(token)
            .map_err(|_| ServerError::InvalidToken("token is not hex".into()))?;
        if raw.len() != TOKEN_LEN {
            return Err(ServerError::InvalidToken("invalid token length".into()));
        }

        let (signed, signature) = raw.split_at(SIGNED_LEN);
        self.mac(signed)?
            .verify_slice(signature)
            .map_err(|_| ServerError::InvalidToken("invalid signature".into()))?;

        let mut device_id = [0u8; DEVICE_LEN];
        device_id.copy_from_slice(&signed[..DEVICE_LEN]);
        let mut issued = [0u8; 8];
        issued.copy_from_slice(&signed[DEVICE_LEN..]);

        let expiry_millis = self.config.token_expiry.as_millis() as u64;
        if now_millis() > u64::from_be_bytes(issued).saturating_add(expiry_millis) {
            return Err(ServerError::InvalidToken("token expired".into()));
        }
        if self.revoked.read().contains(&device_id) {
            return Err(ServerError::InvalidToken("token revoked".into()));
        }
        Ok(device_id)
    }

    /// Revokes every token issued to `device_id`.
    pub fn revoke(&self, device_id: [u8; DEVICE_LEN]) {
        self.revoked.write().insert(device_id);
    }

    /// Lifts a revocation.
    pub fn reinstate(&self, device_id: &[u8; DEVICE_LEN]) -> bool {
        self.revoked.write().remove(device_id)
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("unusable token secret: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .field("revoked", &self.revoked.read().len())
            .finish_non_exhaustive()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token([1u8; 16]).unwrap();
        assert_eq!(token.len(), TOKEN_LEN * 2);
        assert_eq!(validator.validate_token(&token).unwrap(), [1u8; 16]);
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let mut raw = hex::decode(validator.create_token([1u8; 16]).unwrap()).unwrap();
        raw[40] ^= 0xFF;
        assert!(validator.validate_token(&hex::encode(raw)).is_err());
    }

    #[test]
    fn reject_foreign_secret() {
        let token = validator().create_token([1u8; 16]).unwrap();
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        assert!(other.validate_token(&token).is_err());
    }

    #[test]
    fn reject_garbage() {
        let validator = validator();
        assert!(validator.validate_token("not-hex").is_err());
        assert!(validator.validate_token("abcd").is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = TokenValidator::new(
            AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec())
                .with_expiry(Duration::from_secs(0)),
        );
        let token = validator.create_token([1u8; 16]).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(validator.validate_token(&token).is_err());
    }

    #[test]
    fn revocation_covers_all_tokens_of_a_device() {
        let validator = validator();
        let first = validator.create_token([7u8; 16]).unwrap();
        let other_device = validator.create_token([8u8; 16]).unwrap();

        validator.revoke([7u8; 16]);
        let err = validator.validate_token(&first).unwrap_err();
        assert_eq!(err.status_code(), 410);
        assert!(validator.validate_token(&other_device).is_ok());

        assert!(validator.reinstate(&[7u8; 16]));
        assert!(validator.validate_token(&first).is_ok());
    }
}
