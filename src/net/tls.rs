//! TLS configuration and certificate loading.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};

/// Load TLS configuration from certificate and key files.
///
/// Called when a TLS serve function starts, so a bad certificate surfaces as
/// that listener's serve error rather than at configuration time.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig> {
    let tls_error = |source: std::io::Error| Error::Tls {
        cert: cert_path.to_path_buf(),
        key: key_path.to_path_buf(),
        source,
    };

    // Basic validation
    if !cert_path.exists() {
        return Err(tls_error(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        )));
    }
    if !key_path.exists() {
        return Err(tls_error(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        )));
    }

    RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(tls_error)
}

/// Build a handshake acceptor from the current rustls configuration.
pub fn acceptor(config: &RustlsConfig) -> TlsAcceptor {
    TlsAcceptor::from(config.get_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn testdata(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/testdata/certificate")
            .join(name)
    }

    #[tokio::test]
    async fn test_load_valid_pair() {
        let config = load_tls_config(&testdata("cert.pem"), &testdata("key.pem")).await;
        assert!(config.is_ok());
    }

    #[tokio::test]
    async fn test_missing_certificate() {
        let err = load_tls_config(Path::new("/nonexistent/cert.pem"), &testdata("key.pem"))
            .await
            .unwrap_err();
        match err {
            Error::Tls { cert, source, .. } => {
                assert_eq!(cert, PathBuf::from("/nonexistent/cert.pem"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_key() {
        // A certificate is not a private key.
        let err = load_tls_config(&testdata("cert.pem"), &testdata("cert.pem")).await;
        assert!(matches!(err, Err(Error::Tls { .. })));
    }
}
