//! TLS termination for the public listener.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig,
};
use tokio_rustls::TlsAcceptor;

use crate::{config::TlsConfig, HostError, HostResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the acceptor for the public port from the PEM files named in `config`.
///
/// When a CA file is configured its certificates are appended to the served chain. Clients are
/// not asked for certificates.
pub fn create_tls_acceptor(config: &TlsConfig) -> HostResult<TlsAcceptor> {
    let mut chain = load_certs(config.get_cert())?;
    if let Some(ca) = config.get_ca() {
        chain.extend(load_certs(ca)?);
    }
    let key = load_private_key(config.get_key())?;

    let server_config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| HostError::ListenerFailure(format!("invalid tls protocol set: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| {
                HostError::ListenerFailure(format!(
                    "certificate '{}' does not match its key: {}",
                    config.get_cert().display(),
                    e
                ))
            })?;

    tracing::info!(cert = %config.get_cert().display(), "created tls acceptor");
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Loads every certificate in a PEM file.
pub fn load_certs(path: &Path) -> HostResult<Vec<CertificateDer<'static>>> {
    let mut reader = open(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            HostError::ListenerFailure(format!(
                "failed to parse certificates from '{}': {}",
                path.display(),
                e
            ))
        })?;

    if certs.is_empty() {
        return Err(HostError::ListenerFailure(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }

    tracing::debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Loads the first private key in a PEM file. PKCS#1, PKCS#8 and SEC1 keys are accepted.
pub fn load_private_key(path: &Path) -> HostResult<PrivateKeyDer<'static>> {
    let mut reader = open(path, "private key")?;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            Ok(Some(_)) => continue,
            Ok(None) => {
                return Err(HostError::ListenerFailure(format!(
                    "no private key found in '{}'",
                    path.display()
                )))
            }
            Err(e) => {
                return Err(HostError::ListenerFailure(format!(
                    "failed to parse private key from '{}': {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}

fn open(path: &Path, what: &str) -> HostResult<BufReader<File>> {
    let file = File::open(path).map_err(|e| {
        HostError::ListenerFailure(format!(
            "failed to open {} file '{}': {}",
            what,
            path.display(),
            e
        ))
    })?;
    Ok(BufReader::new(file))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn write_material(dir: &TempDir) -> TlsConfig {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("certificate generation should succeed");
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");
        std::fs::write(&cert, certified.cert.pem()).unwrap();
        std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
        TlsConfig::builder().cert(cert).key(key).build()
    }

    #[test]
    fn test_create_tls_acceptor() {
        let dir = TempDir::new().unwrap();
        let config = write_material(&dir);
        assert!(create_tls_acceptor(&config).is_ok());
    }

    #[test]
    fn test_ca_is_appended_to_chain() {
        let dir = TempDir::new().unwrap();
        let config = write_material(&dir);
        let ca = rcgen::generate_simple_self_signed(vec!["ca.localhost".to_string()]).unwrap();
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&ca_path, ca.cert.pem()).unwrap();

        let chain = load_certs(config.get_cert()).unwrap();
        assert_eq!(chain.len(), 1);

        let config = TlsConfig::builder()
            .cert(config.get_cert().clone())
            .key(config.get_key().clone())
            .ca(ca_path)
            .build();
        assert!(create_tls_acceptor(&config).is_ok());
    }

    #[test]
    fn test_missing_files_are_listener_failures() {
        let dir = TempDir::new().unwrap();
        let config = TlsConfig::builder()
            .cert(dir.path().join("missing.crt"))
            .key(dir.path().join("missing.key"))
            .build();

        assert!(matches!(
            create_tls_acceptor(&config),
            Err(HostError::ListenerFailure(_))
        ));
    }

    #[test]
    fn test_key_file_without_key() {
        let dir = TempDir::new().unwrap();
        let config = write_material(&dir);

        // A certificate is not a key.
        assert!(matches!(
            load_private_key(config.get_cert()),
            Err(HostError::ListenerFailure(_))
        ));
    }
}
