//! Runtime configuration.
//!
//! Three layers, lowest precedence first: built-in defaults, the JSON
//! config file, command-line flags. The config file mirrors
//! `/etc/godiode.json` from the deployment docs; a missing file at the
//! default path is not an error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONF_PATH: &str = "/etc/godiode.json";
pub const DEFAULT_MULTICAST_ADDR: &str = "239.252.28.12:5432";

/// 1500-byte MTU minus 8 bytes UDP and 20 bytes IPv4.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500 - 8 - 20;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub max_packet_size: usize,
    pub hmac_secret: String,
    pub multicast_addr: String,
    pub bind_addr: String,
    pub nic: String,
    pub verbose: bool,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SenderConfig {
    /// Rate cap in Mbit/s; 0 means unthrottled.
    pub bw: u32,
    /// Number of times the whole broadcast is repeated.
    pub resend_count: u32,
    /// Re-broadcast the manifest between files.
    pub resend_manifest: bool,
    /// Pause between manifest chunks (and after a transfer start).
    pub chunk_delay_ms: u64,
    /// Pause after each completed file.
    pub file_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiverConfig {
    /// Remove files and directories absent from the manifest.
    pub delete: bool,
    /// Mode bits for staged files.
    pub file_permission: u32,
    /// Mode bits for created directories.
    pub folder_permission: u32,
    /// Staging directory; defaults to `<dir>/.tmp`.
    pub tmp_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            hmac_secret: String::new(),
            multicast_addr: DEFAULT_MULTICAST_ADDR.to_string(),
            bind_addr: String::new(),
            nic: String::new(),
            verbose: false,
            sender: SenderConfig::default(),
            receiver: ReceiverConfig::default(),
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            bw: 0,
            resend_count: 1,
            resend_manifest: false,
            chunk_delay_ms: 50,
            file_delay_ms: 100,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            delete: false,
            file_permission: 0o600,
            folder_permission: 0o700,
            tmp_dir: None,
        }
    }
}

impl Config {
    /// Load the JSON config file at `path`. Keys absent from the file keep
    /// their built-in defaults.
    pub fn load(path: &Path) -> Result<Config> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_packet_size, 1472);
        assert_eq!(cfg.multicast_addr, "239.252.28.12:5432");
        assert_eq!(cfg.receiver.file_permission, 0o600);
        assert_eq!(cfg.receiver.folder_permission, 0o700);
        assert_eq!(cfg.sender.resend_count, 1);
        assert_eq!(cfg.sender.chunk_delay_ms, 50);
        assert_eq!(cfg.sender.file_delay_ms, 100);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let json = r#"{
            "hmacSecret": "s3cret",
            "sender": { "bw": 100 },
            "receiver": { "delete": true, "tmpDir": "/var/spool/diode" }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.hmac_secret, "s3cret");
        assert_eq!(cfg.sender.bw, 100);
        assert_eq!(cfg.sender.resend_count, 1);
        assert!(cfg.receiver.delete);
        assert_eq!(cfg.receiver.tmp_dir.as_deref(), Some(Path::new("/var/spool/diode")));
        assert_eq!(cfg.max_packet_size, 1472);
    }

    #[test]
    fn full_file_overrides() {
        let json = r#"{
            "maxPacketSize": 9000,
            "multicastAddr": "239.1.2.3:9999",
            "bindAddr": "10.0.0.1:0",
            "nic": "10.0.0.1",
            "verbose": true,
            "sender": { "bw": 50, "resendCount": 3, "resendManifest": true,
                        "chunkDelayMs": 5, "fileDelayMs": 10 },
            "receiver": { "filePermission": 416, "folderPermission": 448 }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_packet_size, 9000);
        assert_eq!(cfg.sender.resend_count, 3);
        assert!(cfg.sender.resend_manifest);
        assert_eq!(cfg.sender.chunk_delay_ms, 5);
        assert_eq!(cfg.receiver.file_permission, 0o640);
        assert_eq!(cfg.receiver.folder_permission, 0o700);
    }
}
