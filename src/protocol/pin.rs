//! PIN and partial-hash derivation for the pairing handshake (spec §4.4,
//! §6.1, GLOSSARY "Partial hash").
//!
//! A partial hash commits one side to a nonce before it has seen the other
//! side's nonce, so neither endpoint can choose its nonce after the fact to
//! steer the resulting PIN. Both commitments and the final PIN are derived
//! from the same SHA-512 digest recipe over different input prefixes.

use sha2::{Digest, Sha512};

/// Truncated SHA-512 digest used for the client/server partial-hash
/// commitments (spec §4.4 steps 3-4): `SHA-512(server_cert || client_cert ||
/// nonce)`, truncated to 48 bytes.
pub fn partial_hash(server_cert: &[u8], client_cert: &[u8], nonce: &[u8]) -> [u8; 48] {
    let mut hasher = Sha512::new();
    hasher.update(server_cert);
    hasher.update(client_cert);
    hasher.update(nonce);
    let digest = hasher.finalize();
    let mut out = [0u8; 48];
    out.copy_from_slice(&digest[..48]);
    out
}

/// Final 8-digit PIN (spec §4.4 step 8, §6.1): the low 8 bytes of
/// `SHA-512(server_cert || client_cert || server_nonce || client_nonce)`,
/// read little-endian as a `u64`, mod 100,000,000.
pub fn derive_pin(server_cert: &[u8], client_cert: &[u8], server_nonce: &[u8], client_nonce: &[u8]) -> u32 {
    let mut hasher = Sha512::new();
    hasher.update(server_cert);
    hasher.update(client_cert);
    hasher.update(server_nonce);
    hasher.update(client_nonce);
    let digest = hasher.finalize();
    let low8: [u8; 8] = digest[..8].try_into().expect("sha512 digest is at least 8 bytes");
    (u64::from_le_bytes(low8) % 100_000_000) as u32
}

/// Formats a PIN as two space-separated four-digit groups, e.g. `"1234
/// 5678"`, for display to the human operator.
pub fn format_pin(pin: u32) -> String {
    let pin = pin % 100_000_000;
    format!("{:04} {:04}", pin / 10_000, pin % 10_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_derive_same_pin() {
        let server_cert = b"server-cert-bytes";
        let client_cert = b"client-cert-bytes";
        let server_nonce = b"0123456789abcdef0123456789abcdef";
        let client_nonce = b"fedcba9876543210fedcba9876543210";

        let pin_a = derive_pin(server_cert, client_cert, server_nonce, client_nonce);
        let pin_b = derive_pin(server_cert, client_cert, server_nonce, client_nonce);
        assert_eq!(pin_a, pin_b);
        assert!(pin_a < 100_000_000);
    }

    #[test]
    fn different_nonce_changes_pin() {
        let server_cert = b"server-cert-bytes";
        let client_cert = b"client-cert-bytes";
        let pin_a = derive_pin(server_cert, client_cert, b"nonce-one-nonce-one", b"nonce-two-nonce-two");
        let pin_b = derive_pin(server_cert, client_cert, b"nonce-one-nonce-ONE", b"nonce-two-nonce-two");
        assert_ne!(pin_a, pin_b);
    }

    #[test]
    fn partial_hash_changes_with_nonce() {
        let h1 = partial_hash(b"s", b"c", b"nonce-a");
        let h2 = partial_hash(b"s", b"c", b"nonce-b");
        assert_ne!(h1, h2);
    }

    #[test]
    fn tampered_nonce_fails_recomputation() {
        // Simulates spec §8 property 7: the client commits to a partial hash
        // of one nonce, then sends a different nonce.
        let server_cert = b"server-cert";
        let client_cert = b"client-cert";
        let committed_nonce = b"committed-nonce-bytes-32B-long!!";
        let tampered_nonce = b"tampered-nonce-bytes-32B-long!!!";

        let client_commitment = partial_hash(server_cert, client_cert, committed_nonce);
        let recomputed = partial_hash(server_cert, client_cert, tampered_nonce);
        assert_ne!(client_commitment, recomputed);
    }

    #[test]
    fn format_pin_pads_to_four_digit_groups() {
        assert_eq!(format_pin(5), "0000 0005");
        assert_eq!(format_pin(12345678), "1234 5678");
    }
}
