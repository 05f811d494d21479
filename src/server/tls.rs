//! Server-side TLS identity wiring (spec §6.1 "TLS is mandatory in both
//! directions; peer certificates are mutually presented").
//!
//! The server requests (and requires) a client certificate but does not
//! validate it against any CA — trust is established out-of-band by the
//! pairing handshake of spec §4.4, not by the TLS layer. `AcceptAnyClientCert`
//! exists purely to let the handshake complete so the application layer can
//! read `peer_certificates()` and decide trust itself.

use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio_rustls::TlsAcceptor;

use crate::local_cert::LocalCert;

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Accepts any client certificate without chain validation. Mutual trust is
/// established by the application-level pairing PIN (spec §4.4), not by a
/// CA hierarchy — every identity here is self-signed.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
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

/// Builds a `TlsAcceptor` from this host's identity, requiring (but not
/// validating) a client certificate. The cipher suites available are
/// whatever `rustls`'s `ring` provider ships by default — all modern AEADs,
/// no legacy CBC suites — which already satisfies spec §6.1's restriction.
pub fn build_acceptor(identity: &LocalCert) -> anyhow::Result<TlsAcceptor> {
    ensure_crypto_provider();

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(vec![identity.cert_der()], identity.key_der()?)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
