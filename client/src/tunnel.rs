//! Transport session: one WebSocket connection to the broker
//!
//! A background pump task owns the socket. Inbound frames are surfaced as
//! [`TransportEvent`]s; outbound frames are queued through [`SessionSender`].

use futures_util::{SinkExt, StreamExt};
use revtun_shared::protocol::MAX_MESSAGE_SIZE;
use revtun_shared::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, tungstenite::Message};
use tracing::debug;

/// Events emitted by a transport session, in order
#[derive(Debug)]
pub enum TransportEvent {
    /// Connection is usable. Always the first event.
    Open,
    /// Payload of one inbound text or binary frame
    Message(Vec<u8>),
    /// Transport-level failure. Always followed by `Close`.
    Error(Error),
    /// Connection ended. Always the last event.
    Close,
}

/// Cloneable best-effort writer bound to one connection
#[derive(Debug, Clone)]
pub struct SessionSender {
    outbound: mpsc::UnboundedSender<Message>,
}

impl SessionSender {
    /// Queue a text frame. Returns `false` and drops the frame when the
    /// connection has already ended; nothing is buffered for a later one.
    pub fn send(&self, text: String) -> bool {
        self.outbound.send(Message::Text(text)).is_ok()
    }
}

/// A live connection to the broker
pub struct TransportSession {
    sender: SessionSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    pump: JoinHandle<()>,
}

/// WebSocket settings with the message ceilings raised for large bodies
pub fn websocket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);
    config
}

impl TransportSession {
    /// Connect to the broker. On success the first queued event is `Open`.
    pub async fn open(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async_with_config(url, Some(websocket_config()), false)
            .await
            .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(TransportEvent::Open);

        let pump = tokio::spawn(async move {
            let (mut write, mut read) = ws_stream.split();

            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let _ = events_tx.send(TransportEvent::Message(text.into_bytes()));
                            }
                            Some(Ok(Message::Binary(data))) => {
                                let _ = events_tx.send(TransportEvent::Message(data));
                            }
                            // tungstenite queues the pong itself and flushes it on the next read
                            Some(Ok(Message::Ping(_))) => {}
                            Some(Ok(Message::Close(frame))) => {
                                debug!("Broker closed the connection: {:?}", frame);
                                // Push out the queued close reply
                                let _ = write.close().await;
                                break;
                            }
                            None => break,
                            Some(Err(e)) => {
                                let _ = events_tx.send(TransportEvent::Error(
                                    Error::Transport(e.to_string()),
                                ));
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(msg) = outbound_rx.recv() => {
                        if let Err(e) = write.send(msg).await {
                            let _ = events_tx.send(TransportEvent::Error(
                                Error::Transport(format!("Failed to send: {}", e)),
                            ));
                            break;
                        }
                    }
                }
            }

            // Stop accepting sends before announcing the close.
            outbound_rx.close();
            let _ = events_tx.send(TransportEvent::Close);
        });

        Ok(Self {
            sender: SessionSender { outbound: outbound_tx },
            events: events_rx,
            pump,
        })
    }

    /// Writer handle for this connection
    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    /// Next event. A pump that vanished without saying so counts as `Close`.
    pub async fn next_event(&mut self) -> TransportEvent {
        self.events.recv().await.unwrap_or(TransportEvent::Close)
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
