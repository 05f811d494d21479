//! Server/client configuration (SPEC_FULL.md §C).
//!
//! Both structs load from an optional TOML file and are meant to be
//! overridden by CLI flags afterward (see `src/bin/*.rs`); every field has a
//! sane default so a missing config file is not an error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::VideoCodec;
use crate::error::ConfigError;
use crate::rational::Rational;

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    crate::protocol::DEFAULT_PORT
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_brand() -> String {
    "twilight".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_brand")]
    pub brand: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub default_codec: DefaultVideoCodec,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: default_bind_addr(),
            port: default_port(),
            state_dir: default_state_dir(),
            brand: default_brand(),
            log_filter: default_log_filter(),
            default_codec: DefaultVideoCodec::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<ServerConfig> {
        if !path.exists() {
            return Ok(ServerConfig::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn privkey_path(&self) -> PathBuf {
        self.state_dir.join("privkey.der")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.state_dir.join("cert.der")
    }

    pub fn known_clients_path(&self) -> PathBuf {
        self.state_dir.join("clients.toml")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DefaultVideoCodec {
    #[default]
    H264,
    Vp9,
}

impl From<DefaultVideoCodec> for VideoCodec {
    fn from(c: DefaultVideoCodec) -> Self {
        match c {
            DefaultVideoCodec::H264 => VideoCodec::H264,
            DefaultVideoCodec::Vp9 => VideoCodec::Vp9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_requested_fps")]
    pub requested_fps_num: i64,
    #[serde(default = "default_requested_fps_den")]
    pub requested_fps_den: i64,
}

fn default_requested_fps() -> i64 {
    60
}

fn default_requested_fps_den() -> i64 {
    1
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            state_dir: default_state_dir(),
            log_filter: default_log_filter(),
            requested_fps_num: default_requested_fps(),
            requested_fps_den: default_requested_fps_den(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> anyhow::Result<ClientConfig> {
        if !path.exists() {
            return Ok(ClientConfig::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn hosts_path(&self) -> PathBuf {
        self.state_dir.join("hosts.toml")
    }

    pub fn requested_fps(&self) -> Result<Rational, ConfigError> {
        if self.requested_fps_num <= 0 || self.requested_fps_den <= 0 {
            return Err(ConfigError::InvalidFramerate(format!(
                "{}/{}",
                self.requested_fps_num, self.requested_fps_den
            )));
        }
        Ok(Rational::new(self.requested_fps_num, self.requested_fps_den))
    }
}

/// Validates dimensions/framerate for `ConfigureStreamRequest` (spec §7
/// "Configuration errors: ... zero/negative dimensions").
pub fn validate_stream_dimensions(width: u32, height: u32) -> Result<(), ConfigError> {
    if width == 0 || height == 0 {
        return Err(ConfigError::InvalidDimensions { width, height });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_default_has_sane_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, crate::protocol::DEFAULT_PORT);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let cfg = ServerConfig::load(Path::new("/nonexistent/path/twilight.toml")).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0");
    }

    #[test]
    fn validate_stream_dimensions_rejects_zero() {
        assert!(validate_stream_dimensions(0, 100).is_err());
        assert!(validate_stream_dimensions(100, 0).is_err());
        assert!(validate_stream_dimensions(100, 100).is_ok());
    }

    #[test]
    fn client_requested_fps_rejects_non_positive() {
        let mut cfg = ClientConfig::default();
        cfg.requested_fps_num = 0;
        assert!(cfg.requested_fps().is_err());
    }
}
