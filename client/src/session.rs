//! Session controller
//!
//! Two states, `Disconnected` and `Connected`. Entering `Disconnected` opens
//! a new transport session; `Open` registers the agent; `Close` schedules a
//! reconnect after the configured delay. The delay is fixed, not exponential,
//! and the agent retries forever: there is no terminal state.

use std::pin::Pin;
use std::sync::Arc;

use revtun_shared::{decode, encode, TunnelEnvelope};
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::proxy::RequestForwarder;
use crate::tunnel::{SessionSender, TransportEvent, TransportSession};

/// Connection state of one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

/// Owns the current transport session and the pending reconnect timer
pub struct SessionController {
    config: Arc<ClientConfig>,
    forwarder: RequestForwarder,
    state: SessionState,
    transport: Option<TransportSession>,
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl SessionController {
    pub fn new(config: ClientConfig, forwarder: RequestForwarder) -> Self {
        Self {
            config: Arc::new(config),
            forwarder,
            state: SessionState::Disconnected,
            transport: None,
            reconnect: None,
        }
    }

    /// Drive the agent forever
    pub async fn run(mut self) {
        loop {
            if let Some(timer) = self.reconnect.take() {
                timer.await;
                info!("[{}] Attempting to reconnect...", self.config.client_id);
            }

            self.connect().await;

            while let Some(event) = self.next_event().await {
                self.handle_event(event);
            }
        }
    }

    /// Entry action of `Disconnected`: open a fresh transport session
    async fn connect(&mut self) {
        // Only one timer may ever be pending.
        self.reconnect = None;
        self.transport = None;

        info!("[{}] Connecting to broker: {}", self.config.client_id, self.config.broker_url);
        match TransportSession::open(&self.config.broker_url).await {
            Ok(session) => self.transport = Some(session),
            Err(e) => {
                self.handle_event(TransportEvent::Error(e));
                self.handle_event(TransportEvent::Close);
            }
        }
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        match self.transport.as_mut() {
            Some(session) => Some(session.next_event().await),
            None => None,
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                self.state = SessionState::Connected;
                self.register();
            }
            TransportEvent::Message(raw) => {
                if self.state == SessionState::Connected {
                    self.dispatch(&raw);
                }
            }
            TransportEvent::Error(e) => {
                error!("[{}] Tunnel connection error: {}", self.config.client_id, e);
            }
            TransportEvent::Close => {
                self.state = SessionState::Disconnected;
                self.transport = None;
                info!(
                    "[{}] Tunnel connection closed. Retrying in {:?}",
                    self.config.client_id, self.config.reconnect_delay
                );
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect = Some(Box::pin(sleep(self.config.reconnect_delay)));
    }

    fn register(&self) {
        let Some(sender) = self.sender() else {
            return;
        };
        let register = TunnelEnvelope::Register {
            id: self.config.client_id.clone(),
        };
        if sender.send(encode(&register)) {
            info!("[{}] Connected to tunnel, registered", self.config.client_id);
        } else {
            warn!("[{}] Connection closed before registration", self.config.client_id);
        }
    }

    fn dispatch(&self, raw: &[u8]) {
        match decode(raw) {
            Ok(TunnelEnvelope::Request(request)) => {
                let Some(sender) = self.sender() else {
                    return;
                };
                let forwarder = self.forwarder.clone();
                let client_id = self.config.client_id.clone();
                tokio::spawn(async move {
                    let id = request.id.clone();
                    let response = forwarder.forward(request).await;
                    if !sender.send(encode(&TunnelEnvelope::Response(response))) {
                        warn!("[{}] Connection gone, dropping response {}", client_id, id);
                    }
                });
            }
            Ok(other) => {
                debug!("[{}] Ignoring {} envelope", self.config.client_id, other.kind());
            }
            Err(e) if e.is_unrecognized() => {
                debug!("[{}] Ignoring message: {}", self.config.client_id, e);
            }
            Err(e) => {
                warn!("[{}] Dropping malformed message: {}", self.config.client_id, e);
            }
        }
    }

    fn sender(&self) -> Option<SessionSender> {
        self.transport.as_ref().map(TransportSession::sender)
    }
}
