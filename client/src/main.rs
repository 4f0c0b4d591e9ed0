use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod multi;
mod proxy;
mod session;
mod tunnel;

use config::{ClientConfig, FileConfig, DEFAULT_RECONNECT_DELAY_MS};
use multi::AgentManager;

#[derive(Parser, Debug)]
#[command(name = "revtun")]
#[command(version)]
#[command(about = "Reverse tunnel agent: serve a local HTTP service through a remote broker", long_about = None)]
struct Cli {
    /// Identity announced to the broker
    #[arg(long = "id", env = "TUNNEL_CLIENT_ID")]
    client_id: Option<String>,

    /// Local port to forward requests to
    #[arg(short, long, env = "TUNNEL_LOCAL_PORT")]
    port: Option<u16>,

    /// Local host to forward requests to
    #[arg(long, env = "TUNNEL_LOCAL_HOST", default_value = "localhost")]
    local_host: String,

    /// Broker WebSocket URL
    #[arg(short, long, env = "TUNNEL_BROKER_URL")]
    broker: Option<String>,

    /// Delay before reconnecting, in milliseconds
    #[arg(long, env = "TUNNEL_RECONNECT_DELAY_MS", default_value_t = DEFAULT_RECONNECT_DELAY_MS)]
    reconnect_delay_ms: u64,

    /// YAML file defining one or more agents
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Resolve the agents to run. Flags/environment win over a config file.
    fn agents(&self) -> Result<Vec<ClientConfig>> {
        if let Some(client_id) = &self.client_id {
            let port = self
                .port
                .ok_or_else(|| anyhow::anyhow!("TUNNEL_LOCAL_PORT (--port) is required"))?;
            let broker = self
                .broker
                .clone()
                .ok_or_else(|| anyhow::anyhow!("TUNNEL_BROKER_URL (--broker) is required"))?;

            let config = ClientConfig::new(client_id.clone(), port, broker)
                .with_local_host(self.local_host.clone())
                .with_reconnect_delay(Duration::from_millis(self.reconnect_delay_ms));
            config.validate()?;
            return Ok(vec![config]);
        }

        match self.config.clone().or_else(FileConfig::find_config) {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                FileConfig::load(&path)
            }
            None => anyhow::bail!(
                "No agent configuration found. Set TUNNEL_CLIENT_ID, TUNNEL_LOCAL_PORT and \
                 TUNNEL_BROKER_URL, or provide a revtun.yml file with --config"
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("revtun={0},revtun_shared={0}", default_level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let agents = cli.agents()?;
    info!("Starting RevTun v{} with {} agent(s)", env!("CARGO_PKG_VERSION"), agents.len());

    let mut manager = AgentManager::new(agents);
    manager.start_all()?;
    info!("{} agent(s) running, press Ctrl+C to stop", manager.running());
    manager.wait_for_shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("revtun").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_agent_from_flags() {
        let cli = parse(&[
            "--id", "placa1", "--port", "8000", "--broker", "ws://broker/ws-tunnel",
            "--reconnect-delay-ms", "500",
        ]);
        let agents = cli.agents().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].client_id, "placa1");
        assert_eq!(agents[0].local_base_url(), "http://localhost:8000");
        assert_eq!(agents[0].reconnect_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_missing_broker_is_an_error() {
        let cli = parse(&["--id", "placa1", "--port", "8000"]);
        let err = cli.agents().unwrap_err();
        assert!(err.to_string().contains("TUNNEL_BROKER_URL"));
    }
}
