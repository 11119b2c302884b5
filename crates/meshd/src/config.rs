//! Configuration for meshd

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// meshd - multi-hop tunnel and channel daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "meshd")]
#[command(about = "Mesh transport daemon: encrypted tunnels and reliable channels over neighbor links")]
pub struct Config {
    /// Listen address for neighbor links
    #[arg(short, long, default_value = "0.0.0.0:9200")]
    pub listen: SocketAddr,

    /// Neighbors to dial at startup (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub connect: Vec<SocketAddr>,

    /// Identity seed (64 hex characters); a fresh identity is generated if absent
    #[arg(long, env = "MESH_IDENTITY_SEED")]
    pub identity_seed: Option<String>,

    /// Path to a JSON file with engine tunables
    #[arg(long)]
    pub tunables: Option<PathBuf>,

    /// Run an echo service on this port
    #[arg(long)]
    pub echo_port: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.log_format != "pretty" && self.log_format != "json" {
            anyhow::bail!("Log format must be 'pretty' or 'json', got '{}'", self.log_format);
        }
        if self.connect.contains(&self.listen) {
            anyhow::bail!("Refusing to dial our own listen address {}", self.listen);
        }
        self.identity_seed_bytes()?;
        self.load_tunables()?.validate()?;
        Ok(())
    }

    /// Decode the identity seed, if one was given
    pub fn identity_seed_bytes(&self) -> anyhow::Result<Option<[u8; 32]>> {
        let Some(seed) = &self.identity_seed else {
            return Ok(None);
        };
        let bytes = hex::decode(seed.trim())?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow::anyhow!("Identity seed must be 32 bytes, got {}", b.len()))?;
        Ok(Some(seed))
    }

    /// Engine tunables from `--tunables`, or the defaults
    pub fn load_tunables(&self) -> anyhow::Result<MeshConfig> {
        match &self.tunables {
            Some(path) => MeshConfig::from_file(path),
            None => Ok(MeshConfig::default()),
        }
    }
}

/// Engine tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Global in-flight message budget
    pub max_msgs_queue: u32,
    /// Connection budget; the per-direction window is `max_msgs_queue / max_connections + 1`
    pub max_connections: u32,
    /// Keepalive period of a ready connection endpoint
    pub refresh_connection_time_ms: u64,
    /// Base retry period for CONNECTION_CREATE and CONNECTION_ACK
    pub create_connection_time_ms: u64,
    /// Initial hop limit of encrypted frames
    pub default_ttl: u32,
    /// Redundant connections per tunnel
    pub max_tunnel_connections: usize,
    /// Initial channel retransmission delay
    pub retransmit_time_ms: u64,
    /// Multiplier on the smoothed delay for the retry timer
    pub retransmit_margin: u32,
    /// Percentage of outgoing neighbor messages dropped at transmit time (testing aid)
    pub drop_percent: u8,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_msgs_queue: 10_000,
            max_connections: 1_000,
            refresh_connection_time_ms: 5 * 60 * 1000,
            create_connection_time_ms: 2_000,
            default_ttl: mesh_core::DEFAULT_TTL,
            max_tunnel_connections: 3,
            retransmit_time_ms: 1_000,
            retransmit_margin: 4,
            drop_percent: 0,
        }
    }
}

impl MeshConfig {
    /// Load tunables from a JSON file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Validate tunables
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be positive");
        }
        if self.max_tunnel_connections == 0 {
            anyhow::bail!("max_tunnel_connections must be positive");
        }
        if self.default_ttl == 0 {
            anyhow::bail!("default_ttl must be positive");
        }
        if self.drop_percent > 100 {
            anyhow::bail!("drop_percent must be at most 100");
        }
        if self.refresh_connection_time_ms == 0 || self.create_connection_time_ms == 0 {
            anyhow::bail!("connection timers must be positive");
        }
        Ok(())
    }

    /// Per-direction in-flight window of a connection
    pub fn queue_max(&self) -> u32 {
        self.max_msgs_queue / self.max_connections.max(1) + 1
    }

    pub fn refresh_connection_time(&self) -> Duration {
        Duration::from_millis(self.refresh_connection_time_ms)
    }

    pub fn create_connection_time(&self) -> Duration {
        Duration::from_millis(self.create_connection_time_ms)
    }

    pub fn retransmit_time(&self) -> Duration {
        Duration::from_millis(self.retransmit_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> Config {
        Config::parse_from(["meshd"])
    }

    #[test]
    fn test_default_window() {
        assert_eq!(MeshConfig::default().queue_max(), 11);
    }

    #[test]
    fn test_partial_tunables_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_msgs_queue": 100, "max_connections": 10, "drop_percent": 5}}"#).unwrap();

        let config = MeshConfig::from_file(file.path()).unwrap();
        assert_eq!(config.queue_max(), 11);
        assert_eq!(config.drop_percent, 5);
        assert_eq!(config.default_ttl, 64);
        assert_eq!(config.retransmit_margin, 4);
    }

    #[test]
    fn test_invalid_tunables_rejected() {
        let config = MeshConfig {
            drop_percent: 101,
            ..MeshConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_parsing() {
        let config = Config::parse_from([
            "meshd",
            "--listen",
            "127.0.0.1:9300",
            "--connect",
            "127.0.0.1:9301,127.0.0.1:9302",
            "--echo-port",
            "7",
        ]);
        assert_eq!(config.connect.len(), 2);
        assert_eq!(config.echo_port, Some(7));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_identity_seed() {
        let mut config = base_config();
        config.identity_seed = Some("ab".repeat(32));
        assert_eq!(config.identity_seed_bytes().unwrap(), Some([0xAB; 32]));

        config.identity_seed = Some("abcd".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_log_format_rejected() {
        let mut config = base_config();
        config.log_format = "xml".into();
        assert!(config.validate().is_err());
    }
}
