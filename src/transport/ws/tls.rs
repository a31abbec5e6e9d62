//! TLS termination for the WebSocket server.

// ============================================================================
// Imports
// ============================================================================

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Acceptor
// ============================================================================

/// Builds a TLS acceptor from PEM files, advertising ALPN `http/1.1`.
///
/// # Errors
///
/// Returns [`Error::Config`] if either file cannot be read or parsed, or the
/// key does not match the certificate.
pub(crate) fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| {
            Error::config(format!(
                "failed to read certificate {}: {e}",
                cert_path.display()
            ))
        })?;
    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
        Error::config(format!(
            "failed to read private key {}: {e}",
            key_path.display()
        ))
    })?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::config(format!("TLS setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::config(format!("invalid certificate or key: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    debug!(cert = %cert_path.display(), "TLS acceptor loaded");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Resolves the optional certificate/key pair of a server.
///
/// # Errors
///
/// Returns [`Error::Config`] if only one of the two is set.
pub(crate) fn resolve(cert: Option<&Path>, key: Option<&Path>) -> Result<Option<TlsAcceptor>> {
    match (cert, key) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => load_acceptor(cert, key).map(Some),
        (Some(_), None) => Err(Error::config("TLS certificate set without a private key")),
        (None, Some(_)) => Err(Error::config("TLS private key set without a certificate")),
    }
}

// ============================================================================
// Tests
// ============================================================================
