//! Persisted set of pinned client certificate fingerprints (spec §3, §4.9,
//! §6.2).
//!
//! Loading tolerates malformed entries: one bad row is dropped with a
//! warning rather than failing the whole file. Saving is atomic
//! (write-temp + rename), matching spec §5's "persists atomically" policy
//! for the one piece of state mutated after a live connection's handshake.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Deserialize, Serialize)]
struct ClientEntry {
    fingerprint: String,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct ClientsDocument {
    #[serde(default, rename = "clients")]
    clients: Vec<ClientEntry>,
}

/// Thread-safe, disk-backed set of trusted client fingerprints. Reads (the
/// common case, on the connection's read task) take a brief lock; mutation
/// happens only right after a successful pairing (spec §4.4 step 9).
pub struct KnownClients {
    path: PathBuf,
    fingerprints: Mutex<HashSet<String>>,
}

impl KnownClients {
    /// Loads `path`, tolerating a missing file (an empty store) and
    /// dropping malformed rows with a warning; a syntactically invalid TOML
    /// document is the only case that fails the whole load.
    pub fn load(path: &Path) -> anyhow::Result<KnownClients> {
        let fingerprints = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let doc: ClientsDocument = toml::from_str(&text)?;
            doc.clients
                .into_iter()
                .filter_map(|entry| {
                    if entry.fingerprint.starts_with("sha256:") && entry.fingerprint.len() > "sha256:".len() {
                        Some(entry.fingerprint)
                    } else {
                        warn!(fingerprint = %entry.fingerprint, "dropping malformed client fingerprint entry");
                        None
                    }
                })
                .collect()
        } else {
            HashSet::new()
        };

        Ok(KnownClients { path: path.to_path_buf(), fingerprints: Mutex::new(fingerprints) })
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.fingerprints.lock().contains(fingerprint)
    }

    /// Adds `fingerprint` and persists the store. No-op (but still persists
    /// the unchanged set) if already present.
    pub fn insert_and_save(&self, fingerprint: String) -> anyhow::Result<()> {
        {
            let mut guard = self.fingerprints.lock();
            guard.insert(fingerprint);
        }
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
        let entries: Vec<ClientEntry> = {
            let guard = self.fingerprints.lock();
            let mut sorted: Vec<String> = guard.iter().cloned().collect();
            sorted.sort();
            sorted.into_iter().map(|fingerprint| ClientEntry { fingerprint }).collect()
        };
        let doc = ClientsDocument { clients: entries };
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

#[cfg(test)]
mod tests {
    use super::*;

    fn tempfile(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("twilight-known-clients-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn load_missing_file_is_empty() {
        let path = tempfile("missing.toml");
        let kc = KnownClients::load(&path).unwrap();
        assert!(!kc.contains("sha256:anything"));
    }

    #[test]
    fn insert_and_save_then_reload_round_trips() {
        let path = tempfile("roundtrip.toml");
        std::fs::remove_file(&path).ok();

        let kc = KnownClients::load(&path).unwrap();
        kc.insert_and_save("sha256:abcdef==".to_string()).unwrap();
        assert!(kc.contains("sha256:abcdef=="));

        let reloaded = KnownClients::load(&path).unwrap();
        assert!(reloaded.contains("sha256:abcdef=="));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_drops_malformed_entries_but_keeps_good_ones() {
        let path = tempfile("malformed.toml");
        std::fs::write(
            &path,
            r#"
[[clients]]
fingerprint = "sha256:good=="

[[clients]]
fingerprint = "not-a-real-fingerprint"
"#,
        )
        .unwrap();

        let kc = KnownClients::load(&path).unwrap();
        assert!(kc.contains("sha256:good=="));
        assert!(!kc.contains("not-a-real-fingerprint"));

        std::fs::remove_file(&path).ok();
    }
}
