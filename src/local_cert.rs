//! Server key/certificate identity (spec §6.2, §9 "Arena + index").
//!
//! A host's private key and self-signed certificate are generated once and
//! persisted as raw DER; subsequent runs load them back rather than
//! re-generating (which would invalidate every client's pinned copy).

use std::path::Path;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};

/// A host's persistent TLS identity: private key plus self-signed cert, both
/// DER-encoded as the rest of the stack expects (spec §6.2).
pub struct LocalCert {
    pub key_der: Vec<u8>,
    pub cert_der: Vec<u8>,
}

impl LocalCert {
    /// Loads an existing identity from `privkey_path`/`cert_path`, or
    /// generates and persists a fresh one if either file is missing.
    pub fn load_or_generate(privkey_path: &Path, cert_path: &Path, brand: &str, host: &str) -> anyhow::Result<LocalCert> {
        if privkey_path.exists() && cert_path.exists() {
            let key_der = std::fs::read(privkey_path)?;
            let cert_der = std::fs::read(cert_path)?;
            return Ok(LocalCert { key_der, cert_der });
        }

        let identity = generate(brand, host)?;
        if let Some(parent) = privkey_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(privkey_path, &identity.key_der)?;
        std::fs::write(cert_path, &identity.cert_der)?;
        Ok(identity)
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    pub fn key_der(&self) -> anyhow::Result<PrivateKeyDer<'static>> {
        PrivateKeyDer::try_from(self.key_der.clone()).map_err(|e| anyhow::anyhow!("invalid private key DER: {e}"))
    }

    /// `"sha256:<base64>"` fingerprint of the certificate, the format
    /// persisted in `clients.toml`/`hosts.toml` (spec §3 "Known-peer
    /// records").
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.cert_der)
    }
}

/// Computes the `"sha256:<base64>"` fingerprint of an arbitrary certificate
/// DER blob, shared by both the server's own identity and pinned peer certs.
pub fn fingerprint_of(cert_der: &[u8]) -> String {
    use base64::Engine;
    let digest = Sha256::digest(cert_der);
    format!("sha256:{}", base64::engine::general_purpose::STANDARD.encode(digest))
}

fn generate(brand: &str, host: &str) -> anyhow::Result<LocalCert> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(vec![host.to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, brand);
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    // 500-year validity: this identity is pinned by clients on first contact
    // (TOFU), so it must never expire out from under an existing pairing.
    params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    params.not_after = rcgen::date_time_ymd(2520, 1, 1);

    let cert = params.self_signed(&key_pair)?;

    Ok(LocalCert { key_der: key_pair.serialize_der(), cert_der: cert.der().to_vec() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_loadable_der() {
        let identity = generate("twilight-test", "localhost").unwrap();
        assert!(!identity.key_der.is_empty());
        assert!(!identity.cert_der.is_empty());
        identity.key_der().expect("key DER should parse back");
    }

    #[test]
    fn fingerprint_is_stable_for_same_der() {
        let identity = generate("twilight-test", "localhost").unwrap();
        assert_eq!(identity.fingerprint(), fingerprint_of(&identity.cert_der));
        assert!(identity.fingerprint().starts_with("sha256:"));
    }

    #[test]
    fn load_or_generate_round_trips_through_disk() {
        let dir = tempdir();
        let key_path = dir.join("privkey.der");
        let cert_path = dir.join("cert.der");

        let first = LocalCert::load_or_generate(&key_path, &cert_path, "twilight-test", "localhost").unwrap();
        let second = LocalCert::load_or_generate(&key_path, &cert_path, "twilight-test", "localhost").unwrap();
        assert_eq!(first.cert_der, second.cert_der);
        assert_eq!(first.key_der, second.key_der);

        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("twilight-local-cert-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
