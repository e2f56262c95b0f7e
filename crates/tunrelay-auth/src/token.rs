//! Raw token authentication for the framed handshake
//!
//! The handshake carries the secret verbatim as its first `len(secret)`
//! bytes. The token is compared in constant time so a prober cannot learn
//! how many leading bytes were right.

use crate::{bytes_match, AuthError, AuthProvider};
use tracing::debug;

/// Token provider holding the configured secret.
pub struct TokenAuthProvider {
    secret: Box<[u8]>,
}

impl TokenAuthProvider {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().into(),
        }
    }

    /// Number of token bytes a handshake must start with
    pub fn secret_len(&self) -> usize {
        self.secret.len()
    }
}

impl AuthProvider for TokenAuthProvider {
    fn verify(&self, presented: Option<&[u8]>) -> Result<(), AuthError> {
        let token = presented.ok_or(AuthError::Missing)?;
        if bytes_match(token, &self.secret) {
            Ok(())
        } else {
            debug!("Token auth: mismatch");
            Err(AuthError::Rejected)
        }
    }

    fn auth_type(&self) -> &'static str {
        "token"
    }
}
