// ABOUTME: TLS plumbing: listener identity loading and the trust-all upstream connector
// ABOUTME: Upstream certificate verification is intentionally disabled; pinning is an extension point

use crate::config::TlsIdentity;
use crate::error::ProxyError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Build the client-facing TLS acceptor from a PEM certificate chain and
/// private key.
pub fn acceptor(identity: &TlsIdentity) -> Result<TlsAcceptor, ProxyError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&identity.cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ProxyError::Config(format!(
            "no certificates found in {}",
            identity.cert.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&identity.key)?))?
        .ok_or_else(|| {
            ProxyError::Config(format!("no private key found in {}", identity.key.display()))
        })?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for upstream sockets that accepts any server certificate.
pub fn trust_all_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustAll::new()))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[derive(Debug)]
struct TrustAll {
    provider: CryptoProvider,
}

impl TrustAll {
    fn new() -> TrustAll {
        TrustAll {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for TrustAll {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn trust_all_connector_builds() {
        let _connector = trust_all_connector();
    }

    #[test]
    fn acceptor_requires_readable_files() {
        let identity = TlsIdentity {
            cert: PathBuf::from("/nonexistent/cert.pem"),
            key: PathBuf::from("/nonexistent/key.pem"),
        };
        assert!(acceptor(&identity).is_err());
    }
}
