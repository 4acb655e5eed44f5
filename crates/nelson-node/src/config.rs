//! Daemon configuration.

use crate::Args;
use anyhow::{Context, Result};
use nelson_heart::HeartConfig;
use nelson_iri::IriConfig;
use nelson_network::LinkConfig;
use nelson_peers::PeerListConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Cycle tick period in seconds.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval: u64,
    /// Epoch tick period in seconds.
    #[serde(default = "default_epoch_interval")]
    pub epoch_interval: u64,
    /// Beat tick period in seconds.
    #[serde(default = "default_beat_interval")]
    pub beat_interval: u64,
    /// Persistent store location.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Peer-to-peer control port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Status API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Status API bind host.
    #[serde(default = "default_api_hostname")]
    pub api_hostname: String,
    /// Ledger RPC host.
    #[serde(default = "default_iri_hostname")]
    pub iri_hostname: String,
    /// Ledger RPC port.
    #[serde(default = "default_iri_port")]
    pub iri_port: u16,
    /// Ledger TCP neighbor port advertised for self.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Ledger UDP neighbor port advertised for self.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Weight peers by connection longevity instead of stored weight.
    #[serde(default)]
    pub is_master: bool,
    /// Permit multiple peers per hostname, differentiated by port.
    #[serde(default)]
    pub multi_port: bool,
    /// Use a throwaway store.
    #[serde(default)]
    pub temporary: bool,
    /// Default trusted peer URIs (`hostname/port/tcp_port/udp_port`).
    #[serde(default)]
    pub neighbors: Vec<String>,
    /// Maximum peers per gossip sample.
    #[serde(default = "default_gossip_size")]
    pub gossip_size: usize,
    /// Target number of concurrent open links.
    #[serde(default = "default_max_links")]
    pub max_links: usize,
    /// Make neighbor replacement spare static ledger neighbors.
    #[serde(default)]
    pub preserve_static: bool,
    /// Log filter directives.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_name() -> String {
    "nelson".to_string()
}
fn default_cycle_interval() -> u64 {
    60
}
fn default_epoch_interval() -> u64 {
    300
}
fn default_beat_interval() -> u64 {
    10
}
fn default_data_path() -> PathBuf {
    PathBuf::from("data/neighbors.db")
}
fn default_port() -> u16 {
    16600
}
fn default_api_port() -> u16 {
    18600
}
fn default_api_hostname() -> String {
    "127.0.0.1".to_string()
}
fn default_iri_hostname() -> String {
    "127.0.0.1".to_string()
}
fn default_iri_port() -> u16 {
    14265
}
fn default_tcp_port() -> u16 {
    15600
}
fn default_udp_port() -> u16 {
    14600
}
fn default_gossip_size() -> usize {
    8
}
fn default_max_links() -> usize {
    8
}

impl Default for NodeConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config uses defaults")
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        // Override with CLI args
        if let Some(ref data_path) = args.data_path {
            config.data_path = data_path.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(api_port) = args.api_port {
            config.api_port = api_port;
        }
        if let Some(ref api_hostname) = args.api_hostname {
            config.api_hostname = api_hostname.clone();
        }
        if let Some(ref iri_hostname) = args.iri_hostname {
            config.iri_hostname = iri_hostname.clone();
        }
        if let Some(iri_port) = args.iri_port {
            config.iri_port = iri_port;
        }
        if let Some(cycle) = args.cycle_interval {
            config.cycle_interval = cycle;
        }
        if let Some(epoch) = args.epoch_interval {
            config.epoch_interval = epoch;
        }
        if let Some(beat) = args.beat_interval {
            config.beat_interval = beat;
        }
        if !args.neighbors.is_empty() {
            config.neighbors = args.neighbors.clone();
        }
        if args.master {
            config.is_master = true;
        }
        if args.multi_port {
            config.multi_port = true;
        }
        if args.temporary {
            config.temporary = true;
        }
        if let Some(ref log_level) = args.log_level {
            config.log_level = log_level.clone();
        }

        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Scheduler intervals.
    pub fn heart_config(&self) -> HeartConfig {
        HeartConfig {
            beat_interval: Duration::from_secs(self.beat_interval),
            cycle_interval: Duration::from_secs(self.cycle_interval),
            epoch_interval: Duration::from_secs(self.epoch_interval),
        }
    }

    /// Ledger client settings.
    pub fn iri_config(&self) -> IriConfig {
        IriConfig {
            hostname: self.iri_hostname.clone(),
            port: self.iri_port,
            preserve_static: self.preserve_static,
            ..Default::default()
        }
    }

    /// Peer list settings.
    pub fn peer_list_config(&self) -> PeerListConfig {
        PeerListConfig {
            multi_port: self.multi_port,
            is_master: self.is_master,
            default_port: self.port,
            default_tcp_port: self.tcp_port,
            default_udp_port: self.udp_port,
            ..Default::default()
        }
    }

    /// Link session settings.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            beat_interval: Duration::from_secs(self.beat_interval),
            ..Default::default()
        }
    }

    /// The configuration as echoed by the status API.
    pub fn echo(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.port, 16600);
        assert_eq!(config.api_port, 18600);
        assert_eq!(config.iri_port, 14265);
        assert_eq!(config.cycle_interval, 60);
        assert_eq!(config.epoch_interval, 300);
        assert_eq!(config.beat_interval, 10);
        assert!(!config.is_master);
        assert!(!config.temporary);
        assert!(config.neighbors.is_empty());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            port = 17000
            neighbors = ["node-a.example/18600/15600/14600"]
            is_master = true
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 17000);
        assert_eq!(config.neighbors.len(), 1);
        assert!(config.is_master);
        assert_eq!(config.udp_port, 14600);
    }

    #[test]
    fn test_save_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nelson.toml");

        let config = NodeConfig {
            port: 17000,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let back: NodeConfig = toml::from_str(&content).unwrap();
        assert_eq!(back.port, 17000);
        assert_eq!(back.data_path, config.data_path);
    }

    #[test]
    fn test_echo_is_object() {
        let echo = NodeConfig::default().echo();
        assert!(echo.is_object());
        assert_eq!(echo["port"], serde_json::json!(16600));
    }
}
