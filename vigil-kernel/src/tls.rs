//! TLS plumbing for the push channel.
//!
//! The server presents a single certificate. Clients do not use a CA store:
//! they pin the exact certificate they fetched on first contact. Until that
//! copy exists, the one bootstrap connection accepts any certificate.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("invalid PEM material: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),
    #[error("no certificate found in PEM input")]
    NoCertificate,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn acceptor(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, TlsError> {
    let certs = CertificateDer::pem_slice_iter(cert_pem).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector pinned to `cert_pem`, or accepting anything when `None`.
pub fn connector(cert_pem: Option<&[u8]>) -> Result<TlsConnector, TlsError> {
    let pinned = match cert_pem {
        Some(pem) => Some(CertificateDer::from_pem_slice(pem)?),
        None => None,
    };
    let provider = provider();
    let verifier = PinnedCertificate {
        pinned,
        provider: provider.clone(),
    };

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| TlsError::Rustls(rustls::Error::General(format!("invalid server name {host}"))))
}

#[derive(Debug)]
struct PinnedCertificate {
    pinned: Option<CertificateDer<'static>>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.pinned {
            None => Ok(ServerCertVerified::assertion()),
            Some(pinned) if pinned.as_ref() == end_entity.as_ref() => Ok(ServerCertVerified::assertion()),
            Some(_) => Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_devkit::keys::TEST_CERT_PEM;

    #[test]
    fn test_pinned_certificate_matches_bytes_only() {
        let pinned = CertificateDer::from_pem_slice(TEST_CERT_PEM.as_bytes()).unwrap();
        let verifier = PinnedCertificate {
            pinned: Some(pinned.clone().into_owned()),
            provider: provider(),
        };
        let name = server_name("localhost").unwrap();

        assert!(verifier
            .verify_server_cert(&pinned, &[], &name, &[], UnixTime::now())
            .is_ok());

        let other = CertificateDer::from(vec![1u8, 2, 3]);
        assert!(verifier
            .verify_server_cert(&other, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn test_bootstrap_connector_builds_without_pin() {
        assert!(connector(None).is_ok());
        assert!(connector(Some(TEST_CERT_PEM.as_bytes())).is_ok());
        assert!(acceptor(b"", b"").is_err());
    }
}
