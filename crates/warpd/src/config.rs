//! Agent configuration.
//!
//! Read from an optional TOML file; every section and field has a
//! default so an empty file (or no file) yields a working dev agent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use warpgrid_api::query::parse_duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub region: String,
    pub datacenter: String,
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub http_port: u16,
    /// Default deadline of outbound RPCs, e.g. "10s" or "500ms".
    pub rpc_timeout: String,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            region: "global".to_string(),
            datacenter: "dc1".to_string(),
            data_dir: PathBuf::from("/var/lib/warpgrid"),
            bind_addr: "0.0.0.0".to_string(),
            http_port: 4646,
            rpc_timeout: "10s".to_string(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    /// Heartbeat age after which a client node is considered dead.
    pub dead_node_timeout: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dead_node_timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub enabled: bool,
    /// Generated when empty.
    pub node_id: String,
    /// `host:port` other agents use to reach this one.
    pub advertise_addr: String,
    /// Server addresses (`host:port`) for a client-only agent.
    pub servers: Vec<String>,
    /// Secret used to derive migrate tokens; generated when empty.
    pub migrate_secret: String,
    /// Defaults to `{data_dir}/alloc`.
    pub alloc_dir: Option<PathBuf>,
}

impl AgentConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.rpc_timeout()?;
        config.dead_node_timeout()?;
        Ok(config)
    }

    pub fn rpc_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.rpc_timeout)
            .with_context(|| format!("invalid rpc_timeout {:?}", self.rpc_timeout))
    }

    pub fn dead_node_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.server.dead_node_timeout).with_context(|| {
            format!(
                "invalid server.dead_node_timeout {:?}",
                self.server.dead_node_timeout
            )
        })
    }

    pub fn alloc_dir(&self) -> PathBuf {
        self.client
            .alloc_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("alloc"))
    }

    /// The advertised address split into host and port.
    pub fn advertise(&self) -> anyhow::Result<(String, u16)> {
        if self.client.advertise_addr.is_empty() {
            return Ok(("127.0.0.1".to_string(), self.http_port));
        }
        let (host, port) = self
            .client
            .advertise_addr
            .rsplit_once(':')
            .with_context(|| format!("advertise_addr {:?} has no port", self.client.advertise_addr))?;
        let port = port
            .parse()
            .with_context(|| format!("invalid advertise port {port:?}"))?;
        Ok((host.to_string(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = AgentConfig::parse("").unwrap();
        assert_eq!(config.http_port, 4646);
        assert_eq!(config.region, "global");
        assert!(!config.server.enabled);
        assert!(!config.client.enabled);
        assert_eq!(config.rpc_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(config.alloc_dir(), PathBuf::from("/var/lib/warpgrid/alloc"));
    }

    #[test]
    fn parse_full_config() {
        let config = AgentConfig::parse(
            r#"
            region = "eu"
            data_dir = "/tmp/wg"
            http_port = 5656
            rpc_timeout = "500ms"

            [server]
            enabled = true
            dead_node_timeout = "1m"

            [client]
            enabled = true
            node_id = "node1"
            advertise_addr = "10.0.0.5:5656"
            servers = ["10.0.0.1:4646", "10.0.0.2:4646"]
            migrate_secret = "s3cret"
            "#,
        )
        .unwrap();

        assert_eq!(config.region, "eu");
        assert_eq!(config.rpc_timeout().unwrap(), Duration::from_millis(500));
        assert_eq!(config.dead_node_timeout().unwrap(), Duration::from_secs(60));
        assert_eq!(config.client.servers.len(), 2);
        assert_eq!(
            config.advertise().unwrap(),
            ("10.0.0.5".to_string(), 5656)
        );
        assert_eq!(config.alloc_dir(), PathBuf::from("/tmp/wg/alloc"));
    }

    #[test]
    fn bad_duration_is_rejected() {
        assert!(AgentConfig::parse(r#"rpc_timeout = "soon""#).is_err());
    }

    #[test]
    fn advertise_without_port_is_rejected() {
        let mut config = AgentConfig::default();
        config.client.advertise_addr = "10.0.0.5".to_string();
        assert!(config.advertise().is_err());
    }
}
