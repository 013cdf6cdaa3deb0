//! TLS material loading for the front listener and the backend dial

use crate::error::Error;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Load the certificate chain from a PEM file
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::TlsLoad(format!("cannot open certificate file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsLoad(format!("cannot parse certificates from {}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(Error::TlsLoad(format!("no certificates found in {}", path)));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file
pub fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::TlsLoad(format!("cannot open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| Error::TlsLoad(format!("cannot parse key from {}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(Error::TlsLoad(format!("no private key found in {}", path)))
}

/// Build a listener-side acceptor from PEM cert and key files
pub fn server_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, Error> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    // Naming the provider keeps the build deterministic even when another
    // dependency enables a second rustls crypto backend.
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TlsLoad(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::TlsLoad(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for dialling backends over TLS without certificate verification.
///
/// Backends present throwaway certificates for endpoints that live seconds;
/// verification is disabled rather than provisioning per-session PKI. Do not
/// reuse this connector for anything that leaves the deployment.
pub fn insecure_connector() -> TlsConnector {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("default protocol versions are supported")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new()))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Accepts any server certificate; signature checks still run
#[derive(Debug)]
struct InsecureVerifier {
    provider: CryptoProvider,
}

impl InsecureVerifier {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file() {
        let err = load_certs("/nonexistent/cert.pem").unwrap_err();
        assert!(err.to_string().contains("cert.pem"));
    }

    #[test]
    fn test_missing_key_file() {
        assert!(load_key("/nonexistent/key.pem").is_err());
    }

    #[test]
    fn test_insecure_connector_builds() {
        let _connector = insecure_connector();
    }
}
