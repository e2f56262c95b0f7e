//! Shared-secret authentication for tunrelay listeners
//!
//! Each listener owns one immutable secret configured at startup. The
//! framed TLS listener compares a raw token taken from the handshake; the
//! HTTP proxy listener compares the `Proxy-Authorization` header against
//! `Basic <base64(credentials)>`.
//!
//! # Supported Authentication Methods
//!
//! - **Token**: raw secret prefix of the framed handshake
//! - **BasicProxy**: HTTP `Proxy-Authorization` with Basic credentials
//!
//! An unset secret disables authentication for that listener.
//!
//! # Usage
//!
//! ```
//! use tunrelay_auth::Authenticator;
//!
//! let auth = Authenticator::token(Some("tok1"));
//! assert!(auth.verify(Some(b"tok1")).is_ok());
//! assert!(auth.verify(Some(b"tok2")).is_err());
//! ```

mod basic;
mod token;

pub use basic::BasicProxyAuthProvider;
pub use token::TokenAuthProvider;

use thiserror::Error;

/// Error type for authentication operations
///
/// The variants are for server-side logs only; peers never see which one
/// was hit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("credentials missing")]
    Missing,

    #[error("credentials rejected")]
    Rejected,
}

/// Trait for implementing credential checks
///
/// Implementations are immutable after construction and safe to share
/// between connection handlers without locking.
pub trait AuthProvider: Send + Sync {
    /// Check the credentials presented by a peer.
    ///
    /// `presented` is `None` when the peer supplied nothing at all (for
    /// example no `Proxy-Authorization` header).
    fn verify(&self, presented: Option<&[u8]>) -> Result<(), AuthError>;

    /// Return the authentication type name (for logging)
    fn auth_type(&self) -> &'static str;
}

/// No-op authentication provider (always allows requests)
pub struct NoAuthProvider;

impl AuthProvider for NoAuthProvider {
    fn verify(&self, _presented: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }

    fn auth_type(&self) -> &'static str {
        "none"
    }
}

/// Main authenticator that wraps any authentication provider
pub struct Authenticator {
    provider: Box<dyn AuthProvider>,
}

impl Authenticator {
    /// Raw-token authenticator for the framed protocol.
    ///
    /// `None` or an empty secret disables authentication.
    pub fn token(secret: Option<&str>) -> Self {
        match secret.filter(|s| !s.is_empty()) {
            Some(secret) => Self::with_provider(Box::new(TokenAuthProvider::new(secret))),
            None => Self::with_provider(Box::new(NoAuthProvider)),
        }
    }

    /// Basic `Proxy-Authorization` authenticator for the HTTP listener.
    ///
    /// `credentials` is `user:pass`; `None` or empty disables authentication.
    pub fn basic_proxy(credentials: Option<&str>) -> Self {
        match credentials.filter(|s| !s.is_empty()) {
            Some(credentials) => {
                Self::with_provider(Box::new(BasicProxyAuthProvider::new(credentials)))
            }
            None => Self::with_provider(Box::new(NoAuthProvider)),
        }
    }

    /// Create a new authenticator with a custom provider
    pub fn with_provider(provider: Box<dyn AuthProvider>) -> Self {
        Self { provider }
    }

    pub fn verify(&self, presented: Option<&[u8]>) -> Result<(), AuthError> {
        self.provider.verify(presented)
    }

    /// Get the authentication type name
    pub fn auth_type(&self) -> &'static str {
        self.provider.auth_type()
    }

    /// Check if authentication is required
    pub fn requires_auth(&self) -> bool {
        self.provider.auth_type() != "none"
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::with_provider(Box::new(NoAuthProvider))
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("auth_type", &self.auth_type())
            .finish()
    }
}

/// Compare two byte strings without short-circuiting on the first mismatch.
pub(crate) fn bytes_match(presented: &[u8], expected: &[u8]) -> bool {
    use subtle::ConstantTimeEq;

    presented.len() == expected.len() && bool::from(presented.ct_eq(expected))
}
