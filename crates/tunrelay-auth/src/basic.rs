//! HTTP Basic proxy authentication (RFC 7617, RFC 9110 §11.7.2)
//!
//! The expected `Proxy-Authorization` value is computed once at startup and
//! the presented header must match it byte for byte:
//!
//! ```text
//! Proxy-Authorization: Basic <base64(username:password)>
//! ```
//!
//! The header is not decoded, so scheme case and whitespace variations are
//! rejected.

use crate::{bytes_match, AuthError, AuthProvider};
use base64::Engine;
use tracing::debug;

/// Basic proxy authentication provider
pub struct BasicProxyAuthProvider {
    /// Full expected header value, `Basic <base64>`
    expected: String,
}

impl BasicProxyAuthProvider {
    /// Create a provider for `username:password` credentials.
    ///
    /// # Example
    /// ```
    /// use tunrelay_auth::BasicProxyAuthProvider;
    ///
    /// let provider = BasicProxyAuthProvider::new("user:pass");
    /// assert_eq!(provider.expected_header(), "Basic dXNlcjpwYXNz");
    /// ```
    pub fn new(credentials: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        Self {
            expected: format!("Basic {}", encoded),
        }
    }

    /// The header value clients must send
    pub fn expected_header(&self) -> &str {
        &self.expected
    }
}

impl AuthProvider for BasicProxyAuthProvider {
    fn verify(&self, presented: Option<&[u8]>) -> Result<(), AuthError> {
        let Some(header) = presented else {
            debug!("Basic proxy auth: no Proxy-Authorization header");
            return Err(AuthError::Missing);
        };

        if bytes_match(header, self.expected.as_bytes()) {
            Ok(())
        } else {
            debug!("Basic proxy auth: invalid credentials");
            Err(AuthError::Rejected)
        }
    }

    fn auth_type(&self) -> &'static str {
        "basic"
    }
}
