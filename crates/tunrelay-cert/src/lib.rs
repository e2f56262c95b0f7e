//! TLS certificate loading
//!
//! Reads a PEM certificate chain and private key from disk and builds the
//! `rustls` server configuration shared by every TLS listener.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::info;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to open {kind} file {path}: {source}")]
    Open {
        kind: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse certs: {0}")]
    ParseCerts(#[source] std::io::Error),

    #[error("Failed to parse key: {0}")]
    ParseKey(#[source] std::io::Error),

    #[error("No certificates found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("Invalid cert/key: {0}")]
    InvalidPair(#[from] rustls::Error),
}

/// Install `ring` as the process-wide rustls crypto provider.
///
/// Only needed by code that builds rustls configs through the default
/// builders (such as TLS clients); server configs built here name the
/// provider explicitly. Calling it more than once is harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Certificate chain with its private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    /// Load a PEM certificate chain and private key from disk.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        info!("Loading TLS certificate from: {}", cert_path.display());
        let cert_chain = load_certs(cert_path)?;

        info!("Loading TLS private key from: {}", key_path.display());
        let private_key = load_private_key(key_path)?;

        Ok(Self {
            cert_chain,
            private_key,
        })
    }

    /// Parse an in-memory PEM certificate chain and private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertError> {
        Ok(Self {
            cert_chain: parse_certs(&mut &cert_pem[..], "<memory>")?,
            private_key: parse_private_key(&mut &key_pem[..], "<memory>")?,
        })
    }

    /// Build a server configuration without client authentication.
    pub fn into_server_config(self) -> Result<Arc<ServerConfig>, CertError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain, self.private_key)?;
        Ok(Arc::new(config))
    }

    pub fn into_acceptor(self) -> Result<TlsAcceptor, CertError> {
        Ok(TlsAcceptor::from(self.into_server_config()?))
    }
}

/// Load TLS certificates from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut reader = open(path, "cert")?;
    parse_certs(&mut reader, &path.display().to_string())
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let mut reader = open(path, "key")?;
    parse_private_key(&mut reader, &path.display().to_string())
}

fn open(path: &Path, kind: &'static str) -> Result<BufReader<File>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Open {
        kind,
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufReader::new(file))
}

fn parse_certs(
    reader: &mut dyn BufRead,
    origin: &str,
) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(CertError::ParseCerts)?;
    if certs.is_empty() {
        return Err(CertError::NoCertificates(origin.to_string()));
    }
    Ok(certs)
}

fn parse_private_key(
    reader: &mut dyn BufRead,
    origin: &str,
) -> Result<PrivateKeyDer<'static>, CertError> {
    rustls_pemfile::private_key(reader)
        .map_err(CertError::ParseKey)?
        .ok_or_else(|| CertError::NoPrivateKey(origin.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn self_signed() -> (String, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tunrelay-cert-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_load_pem_files() {
        let (cert_pem, key_pem) = self_signed();
        let dir = temp_dir("load");
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert_pem).unwrap();
        std::fs::write(&key_path, key_pem).unwrap();

        let cert = Certificate::from_pem_files(&cert_path, &key_path).unwrap();
        assert_eq!(cert.cert_chain.len(), 1);
        assert!(cert.into_server_config().is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file() {
        let err = load_certs(Path::new("/nonexistent/tunrelay/cert.pem")).unwrap_err();
        assert!(matches!(err, CertError::Open { kind: "cert", .. }));
    }

    #[test]
    fn test_empty_pem_rejected() {
        assert!(matches!(
            Certificate::from_pem(b"", b""),
            Err(CertError::NoCertificates(_))
        ));

        let (cert_pem, _) = self_signed();
        assert!(matches!(
            Certificate::from_pem(cert_pem.as_bytes(), b"not a key"),
            Err(CertError::NoPrivateKey(_))
        ));
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let (cert_pem, _) = self_signed();
        let (_, other_key) = self_signed();

        let cert = Certificate::from_pem(cert_pem.as_bytes(), other_key.as_bytes()).unwrap();
        assert!(matches!(
            cert.into_server_config(),
            Err(CertError::InvalidPair(_))
        ));
    }
}
