//! Persisted list of known servers with per-host pinned certificates (spec
//! §3 "Known-peer records", §4.9, §6.2).
//!
//! Mirrors [`crate::server::known_clients::KnownClients`]'s tolerant-loading
//! policy: a malformed row (no address, unparseable embedded certificate) is
//! dropped with a warning rather than failing the whole file. Saving emits
//! one table per entry in insertion order (spec §4.9).

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One known server: its address list, pinned identity, and the local
/// client certificate this install presented when it paired (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub nickname: String,
    pub addresses: Vec<String>,
    /// Unix seconds of the last successful connection. Spec §9 open
    /// question (d): the original does not update this on every reconnect
    /// either, so this crate only sets it after a fresh pairing, not on
    /// plain reconnects.
    pub last_connected: Option<i64>,
    pub server_cert_der: Vec<u8>,
    pub client_cert_der: Vec<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
struct HostRow {
    nickname: String,
    #[serde(default)]
    addr: Vec<String>,
    #[serde(default)]
    last_connected: Option<i64>,
    #[serde(default)]
    server_cert: String,
    #[serde(default)]
    client_cert: String,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct HostsDocument {
    #[serde(default, rename = "hosts")]
    hosts: Vec<HostRow>,
}

/// Thread-safe, disk-backed, insertion-ordered list of known hosts.
pub struct HostList {
    path: PathBuf,
    entries: Mutex<Vec<HostEntry>>,
}

impl HostList {
    pub fn load(path: &Path) -> anyhow::Result<HostList> {
        let entries = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let doc: HostsDocument = toml::from_str(&text)?;
            doc.hosts.into_iter().filter_map(row_to_entry).collect()
        } else {
            Vec::new()
        };
        Ok(HostList { path: path.to_path_buf(), entries: Mutex::new(entries) })
    }

    pub fn list(&self) -> Vec<HostEntry> {
        self.entries.lock().clone()
    }

    pub fn find(&self, nickname: &str) -> Option<HostEntry> {
        self.entries.lock().iter().find(|e| e.nickname == nickname).cloned()
    }

    /// Inserts a freshly-paired host, or updates an existing entry with the
    /// same nickname in place (preserving its position), then persists.
    pub fn upsert_and_save(&self, entry: HostEntry) -> anyhow::Result<()> {
        {
            let mut guard = self.entries.lock();
            match guard.iter_mut().find(|e| e.nickname == entry.nickname) {
                Some(slot) => *slot = entry,
                None => guard.push(entry),
            }
        }
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
        let rows: Vec<HostRow> = {
            let guard = self.entries.lock();
            guard.iter().map(entry_to_row).collect()
        };
        let doc = HostsDocument { hosts: rows };
        let text = toml::to_string_pretty(&doc)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, text)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn row_to_entry(row: HostRow) -> Option<HostEntry> {
    if row.addr.is_empty() {
        warn!(nickname = %row.nickname, "dropping host entry with no address");
        return None;
    }
    let server_cert_der = match pem_decode_cert(&row.server_cert) {
        Ok(der) => der,
        Err(e) => {
            warn!(nickname = %row.nickname, error = %e, "dropping host entry with unparseable server cert");
            return None;
        }
    };
    let client_cert_der = match pem_decode_cert(&row.client_cert) {
        Ok(der) => der,
        Err(e) => {
            warn!(nickname = %row.nickname, error = %e, "dropping host entry with unparseable client cert");
            return None;
        }
    };
    Some(HostEntry {
        nickname: row.nickname,
        addresses: row.addr,
        last_connected: row.last_connected,
        server_cert_der,
        client_cert_der,
    })
}

fn entry_to_row(entry: &HostEntry) -> HostRow {
    HostRow {
        nickname: entry.nickname.clone(),
        addr: entry.addresses.clone(),
        last_connected: entry.last_connected,
        server_cert: pem_encode_cert(&entry.server_cert_der),
        client_cert: pem_encode_cert(&entry.client_cert_der),
    }
}

/// PEM-armors a DER certificate for inline storage in `hosts.toml` (spec
/// §6.2 "PEM-encoded inline").
fn pem_encode_cert(der: &[u8]) -> String {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

fn pem_decode_cert(pem: &str) -> anyhow::Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    let mut certs = rustls_pemfile::certs(&mut cursor);
    match certs.next() {
        Some(Ok(cert)) => Ok(cert.to_vec()),
        Some(Err(e)) => anyhow::bail!("malformed PEM certificate: {e}"),
        None => anyhow::bail!("no certificate found in PEM block"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempfile(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("twilight-host-list-test-{}-{}", std::process::id(), name))
    }

    fn sample_entry(nickname: &str) -> HostEntry {
        HostEntry {
            nickname: nickname.to_string(),
            addresses: vec!["192.168.1.10:6495".to_string()],
            last_connected: Some(1_700_000_000),
            server_cert_der: vec![1, 2, 3, 4, 5],
            client_cert_der: vec![6, 7, 8, 9, 10],
        }
    }

    #[test]
    fn pem_round_trips_der_bytes() {
        let der = vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x03];
        let pem = pem_encode_cert(&der);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        let decoded = pem_decode_cert(&pem).unwrap();
        assert_eq!(decoded, der);
    }

    #[test]
    fn upsert_and_reload_round_trips() {
        let path = tempfile("roundtrip.toml");
        std::fs::remove_file(&path).ok();

        let list = HostList::load(&path).unwrap();
        list.upsert_and_save(sample_entry("alice-desktop")).unwrap();

        let reloaded = HostList::load(&path).unwrap();
        let entries = reloaded.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].nickname, "alice-desktop");
        assert_eq!(entries[0].server_cert_der, vec![1, 2, 3, 4, 5]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn upsert_same_nickname_replaces_in_place() {
        let path = tempfile("replace.toml");
        std::fs::remove_file(&path).ok();

        let list = HostList::load(&path).unwrap();
        list.upsert_and_save(sample_entry("a")).unwrap();
        list.upsert_and_save(sample_entry("b")).unwrap();
        let mut updated = sample_entry("a");
        updated.addresses = vec!["10.0.0.1:6495".to_string()];
        list.upsert_and_save(updated).unwrap();

        let entries = list.list();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].nickname, "a");
        assert_eq!(entries[0].addresses, vec!["10.0.0.1:6495".to_string()]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_drops_entries_with_no_address() {
        let path = tempfile("no-addr.toml");
        std::fs::write(
            &path,
            r#"
[[hosts]]
nickname = "bad"
addr = []
server_cert = ""
client_cert = ""
"#,
        )
        .unwrap();

        let list = HostList::load(&path).unwrap();
        assert!(list.list().is_empty());

        std::fs::remove_file(&path).ok();
    }
}
