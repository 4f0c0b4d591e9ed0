//! Multi-agent manager
//!
//! Runs one independent session controller per configured agent and stops
//! them all on Ctrl+C. Agents share nothing: each has its own connection and
//! its own reconnect timer.

use crate::config::ClientConfig;
use crate::proxy::RequestForwarder;
use crate::session::SessionController;
use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::info;

/// Manages the tasks of all running agents
pub struct AgentManager {
    agents: Vec<ClientConfig>,
    handles: Vec<JoinHandle<()>>,
}

impl AgentManager {
    pub fn new(agents: Vec<ClientConfig>) -> Self {
        Self {
            agents,
            handles: Vec::new(),
        }
    }

    /// Spawn a controller for every agent
    pub fn start_all(&mut self) -> Result<()> {
        for config in &self.agents {
            let forwarder = RequestForwarder::new(config.local_base_url()).with_context(|| {
                format!("Failed to build local HTTP client for agent '{}'", config.client_id)
            })?;

            info!(
                "Agent '{}': {} <-> {}",
                config.client_id,
                config.broker_url,
                config.local_base_url()
            );

            let controller = SessionController::new(config.clone(), forwarder);
            self.handles.push(tokio::spawn(controller.run()));
        }

        Ok(())
    }

    /// Number of running agent tasks
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for Ctrl+C, then stop every agent
    pub async fn wait_for_shutdown(self) {
        tokio::signal::ctrl_c().await.ok();
        self.shutdown();
    }

    fn shutdown(self) {
        info!("Shutting down {} agent(s)...", self.handles.len());
        for handle in self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_agents_connect_independently() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker = format!("ws://{}", listener.local_addr().unwrap());

        let mut manager = AgentManager::new(vec![
            ClientConfig::new("a", 8000, broker.clone()),
            ClientConfig::new("b", 9000, broker),
        ]);
        manager.start_all().unwrap();
        assert_eq!(manager.running(), 2);

        for _ in 0..2 {
            let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
            assert!(accepted.unwrap().is_ok());
        }

        manager.shutdown();
    }
}
