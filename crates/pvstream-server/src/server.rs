//! PV stream WebSocket server.
//!
//! This module provides the WebSocket server that handles:
//! - Client connections
//! - Subscribe / unsubscribe requests, routed through the fan-out manager
//! - Put requests, forwarded to the value source
//! - Draining each connection's outbox onto its socket

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use pvstream_core::Settings;
use pvstream_protocol::{decode_client_message, ClientMessage, CodecError};
use pvstream_sources::ValueSource;

use crate::fanout::{ConnectionId, FanoutManager};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Configuration for the stream server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Outbound message queue per connection.
    pub client_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            client_queue_capacity: 1_024,
        }
    }
}

impl From<&Settings> for ServerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            bind_addr: settings.ws_addr,
            client_queue_capacity: settings.client_queue_capacity.max(1),
        }
    }
}

/// The PV stream WebSocket server.
pub struct PvStreamServer {
    config: ServerConfig,
    fanout: Arc<FanoutManager>,
    source: Arc<dyn ValueSource>,
}

impl PvStreamServer {
    pub fn new(config: ServerConfig, fanout: Arc<FanoutManager>, source: Arc<dyn ValueSource>) -> Self {
        Self {
            config,
            fanout,
            source,
        }
    }

    pub fn fanout(&self) -> &Arc<FanoutManager> {
        &self.fanout
    }

    /// Bind the configured address and serve connections.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("PV stream server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let fanout = self.fanout.clone();
                    let source = self.source.clone();
                    let capacity = self.config.client_queue_capacity;

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, fanout, source, capacity).await {
                            error!("Connection error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    fanout: Arc<FanoutManager>,
    source: Arc<dyn ValueSource>,
    capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (ws_tx, ws_rx) = ws_stream.split();

    let (outbox_tx, outbox_rx) = mpsc::channel(capacity);
    let conn = fanout.connect(outbox_tx);
    info!(%conn, "New connection from {}", addr);

    let result = serve_connection(conn, addr, ws_tx, ws_rx, outbox_rx, &fanout, &source).await;

    // Runs on every exit path, including socket errors
    let removed = fanout.disconnect(conn);
    info!(%conn, subscriptions = removed, "Connection from {} closed", addr);
    result
}

async fn serve_connection(
    conn: ConnectionId,
    addr: SocketAddr,
    mut ws_tx: WsSink,
    mut ws_rx: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
    mut outbox_rx: mpsc::Receiver<String>,
    fanout: &Arc<FanoutManager>,
    source: &Arc<dyn ValueSource>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_message(&text, conn, fanout, source) {
                            warn!("Error handling message from {}: {}", addr, e);
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Error handling message from {}: {}", addr, CodecError::BinaryFrame);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Client {} closed connection", addr);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_tx.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => {
                        debug!("Client {} disconnected", addr);
                        break;
                    }
                    _ => {} // Ignore other message types
                }
            }

            // Drain updates queued by the dispatcher callbacks
            outgoing = outbox_rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if let Err(e) = ws_tx.send(Message::Text(text)).await {
                            debug!("Failed to send update to {}: {}", addr, e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

/// Handle a message received from a client.
fn handle_client_message(
    text: &str,
    conn: ConnectionId,
    fanout: &FanoutManager,
    source: &Arc<dyn ValueSource>,
) -> Result<(), CodecError> {
    match decode_client_message(text)? {
        ClientMessage::Subscribe { pvs } => {
            for pv in &pvs {
                fanout.subscribe(conn, pv);
            }
        }
        ClientMessage::Unsubscribe { pvs } => {
            for pv in &pvs {
                fanout.unsubscribe(conn, pv);
            }
        }
        ClientMessage::Put(req) => {
            let Some((pv, value)) = req.target() else {
                debug!(%conn, "Ignoring put without variable or value");
                return Ok(());
            };
            let pv = pv.to_string();
            let value = value.clone();
            let source = source.clone();

            // Off the read loop so a slow write never stalls delivery
            tokio::spawn(async move {
                match source.put(&pv, value.clone()).await {
                    Ok(()) => info!(%conn, pv = %pv, %value, "Put"),
                    Err(e) => warn!(%conn, pv = %pv, error = %e, "Put failed"),
                }
            });
        }
    }

    Ok(())
}
