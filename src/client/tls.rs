//! Client-side TLS identity wiring (spec §4.5, §6.1).
//!
//! A known host's TLS verification pins the exact certificate DER recorded
//! in its `HostEntry` (spec §4.5 "TLS verification pins the server
//! certificate recorded in the host entry"). A never-before-seen host has
//! nothing to pin yet, so the connection accepts whatever certificate the
//! server presents and leaves trust entirely to the pairing PIN exchange
//! that follows (spec §4.4) — the new cert is pinned into the host entry
//! only after that handshake succeeds.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::local_cert::LocalCert;

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Verifies the server certificate by exact DER comparison against a value
/// pinned on a prior successful pairing.
#[derive(Debug)]
struct PinnedServerCert {
    der: Vec<u8>,
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.der.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure))
        }
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
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
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
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

/// Accepts any server certificate, used only for a host's first-ever
/// connection before any cert is pinned. Trust is deferred entirely to the
/// operator-verified PIN (spec §4.4 step 9), never to this TLS layer.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
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
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

/// Builds a `TlsConnector` presenting `identity` as the client certificate
/// and verifying the server against `pinned_server_cert` (or accepting any
/// cert, for a never-before-seen host).
pub fn build_connector(identity: &LocalCert, pinned_server_cert: Option<&[u8]>) -> anyhow::Result<TlsConnector> {
    ensure_crypto_provider();

    let verifier: Arc<dyn ServerCertVerifier> = match pinned_server_cert {
        Some(der) => Arc::new(PinnedServerCert { der: der.to_vec() }),
        None => Arc::new(AcceptAnyServerCert),
    };

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(vec![identity.cert_der()], identity.key_der()?)?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// A `ServerName` for the TLS handshake. Our verifiers ignore it entirely
/// (trust is pinned-DER or PIN-gated, never name-based), so any syntactically
/// valid value works; addresses parse as IP names, everything else as a DNS
/// name.
pub fn server_name_for(host: &str) -> anyhow::Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    Ok(ServerName::try_from(host.to_string())?)
}
