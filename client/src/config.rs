//! Configuration for RevTun agents
//!
//! An agent is configured either from flags/environment variables or from a
//! revtun.yml file that may define several agents sharing one broker.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default delay between a lost connection and the next attempt
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 10_000;

/// Everything one agent needs to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Identity announced to the broker on every connection
    pub client_id: String,
    /// Host of the local HTTP service
    pub local_host: String,
    /// Port of the local HTTP service
    pub local_port: u16,
    /// WebSocket URL of the broker
    pub broker_url: String,
    /// Fixed delay before reconnecting
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>, local_port: u16, broker_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            local_host: default_host(),
            local_port,
            broker_url: broker_url.into(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        }
    }

    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Base URL of the local service, without a trailing slash
    pub fn local_base_url(&self) -> String {
        format!("http://{}:{}", self.local_host, self.local_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            anyhow::bail!("Client identity cannot be empty");
        }
        if self.local_port == 0 {
            anyhow::bail!("Invalid local port 0 for agent '{}'", self.client_id);
        }
        if !(self.broker_url.starts_with("ws://") || self.broker_url.starts_with("wss://")) {
            anyhow::bail!(
                "Broker URL '{}' for agent '{}' must use ws:// or wss://",
                self.broker_url,
                self.client_id
            );
        }
        if self.reconnect_delay.is_zero() {
            anyhow::bail!("Reconnect delay for agent '{}' must be positive", self.client_id);
        }
        Ok(())
    }
}

/// Root of a revtun.yml file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Broker URL shared by all agents unless overridden
    pub broker: Option<String>,

    /// Reconnect delay in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Agent definitions
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

/// Single agent definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    /// Identity announced to the broker
    pub id: String,

    /// Local port to forward requests to
    pub local_port: u16,

    /// Local hostname to forward to (default: localhost)
    #[serde(default = "default_host")]
    pub local_host: String,

    /// Per-agent broker override
    pub broker: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

impl FileConfig {
    /// Load and validate a YAML configuration file
    pub fn load(path: &Path) -> Result<Vec<ClientConfig>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: FileConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.into_client_configs()
    }

    /// Resolve every agent entry into a validated [`ClientConfig`]
    pub fn into_client_configs(self) -> Result<Vec<ClientConfig>> {
        if self.agents.is_empty() {
            anyhow::bail!("No agents defined in configuration");
        }

        let delay = Duration::from_millis(self.reconnect_delay_ms);
        self.agents
            .into_iter()
            .map(|agent| {
                let broker = agent
                    .broker
                    .or_else(|| self.broker.clone())
                    .with_context(|| format!("No broker URL for agent '{}'", agent.id))?;
                let config = ClientConfig::new(agent.id, agent.local_port, broker)
                    .with_local_host(agent.local_host)
                    .with_reconnect_delay(delay);
                config.validate()?;
                Ok(config)
            })
            .collect()
    }

    /// Search for a config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["revtun.yml", "revtun.yaml", ".revtun.yml", ".revtun.yaml"];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
