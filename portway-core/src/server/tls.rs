//! TLS credential acquisition for the HTTP/2 listener.
//!
//! In development, a self-signed certificate is generated on first run and
//! cached under the system temp directory so restarts don't regenerate it.
//! In production, credentials must already exist on disk; their absence is
//! a fatal startup error.

use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, PortwayError};

use super::options::{Http2Options, RuntimeEnv};

#[derive(Debug)]
pub struct TlsCredentials {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Resolve (or, in development, generate) the certificate/key pair an
/// HTTP/2 listener needs.
pub fn acquire_credentials(
    http2: &Http2Options,
    env: RuntimeEnv,
) -> Result<TlsCredentials, PortwayError> {
    if let (Some(cert), Some(key)) = (&http2.cert_file, &http2.key_file) {
        let cert_path = PathBuf::from(cert);
        let key_path = PathBuf::from(key);
        if !cert_path.exists() || !key_path.exists() {
            return Err(PortwayError::new(
                ErrorKind::InternalServerError,
                "configured TLS credentials do not exist on disk",
            ));
        }
        return Ok(TlsCredentials { cert_path, key_path });
    }

    if !env.is_development() {
        return Err(PortwayError::new(
            ErrorKind::InternalServerError,
            "http2.certFile and http2.keyFile are required in production",
        ));
    }

    generate_dev_credentials(&std::env::temp_dir().join("portway-dev-certs"))
}

/// Generate (or reuse, if already present) a self-signed certificate pair
/// under `cache_dir` for local development.
fn generate_dev_credentials(cache_dir: &Path) -> Result<TlsCredentials, PortwayError> {
    std::fs::create_dir_all(cache_dir)?;
    let cert_path = cache_dir.join("dev-cert.pem");
    let key_path = cache_dir.join("dev-key.pem");

    if cert_path.exists() && key_path.exists() {
        tracing::debug!(dir = %cache_dir.display(), "reusing cached development TLS credentials");
        return Ok(TlsCredentials { cert_path, key_path });
    }

    tracing::info!(dir = %cache_dir.display(), "generating self-signed development TLS credentials");
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|err| PortwayError::internal(format!("failed to generate dev TLS credentials: {err}")))?;

    std::fs::write(&cert_path, certified.cert.pem())?;
    std::fs::write(&key_path, certified.key_pair.serialize_pem())?;

    Ok(TlsCredentials { cert_path, key_path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_in_production_is_fatal() {
        let http2 = Http2Options { enabled: true, key_file: None, cert_file: None };
        let err = acquire_credentials(&http2, RuntimeEnv::Production).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalServerError);
    }

    #[test]
    fn development_generates_and_reuses_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let first = generate_dev_credentials(dir.path()).unwrap();
        assert!(first.cert_path.exists());
        assert!(first.key_path.exists());
        let first_contents = std::fs::read(&first.cert_path).unwrap();

        let second = generate_dev_credentials(dir.path()).unwrap();
        let second_contents = std::fs::read(&second.cert_path).unwrap();
        assert_eq!(first_contents, second_contents);
    }

    #[test]
    fn configured_credentials_must_exist_on_disk() {
        let http2 = Http2Options {
            enabled: true,
            key_file: Some("/nonexistent/key.pem".to_string()),
            cert_file: Some("/nonexistent/cert.pem".to_string()),
        };
        let err = acquire_credentials(&http2, RuntimeEnv::Production).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalServerError);
    }
}
