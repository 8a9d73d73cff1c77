//! WebSocket relay exposing a [`MemoryBus`] to remote `WsBus` clients.
//!
//! Architecture:
//! ```text
//! WsBus A ──┐                         ┌── forwarder(A, session-1) ──► A
//!           ├── frames ──► MemoryBus ─┤
//! WsBus B ──┘                         └── forwarder(B, session-1) ──► B
//! ```
//!
//! Each connection owns one forwarding task per subscribed channel. When a
//! connection ends, its subscriptions are closed and its presence is
//! dropped from every channel it joined.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bus::{Bus, MemoryBus, MemoryBusConfig};
use crate::protocol::{ProtocolError, RelayFrame};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per session channel
    pub broadcast_capacity: usize,
    /// Presence not refreshed within this window is dropped (None = never)
    pub presence_ttl: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            // three missed 10s heartbeats
            presence_ttl: Some(Duration::from_secs(30)),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
}

/// The relay server.
pub struct BusRelay {
    config: RelayConfig,
    bus: MemoryBus,
    stats: Arc<RwLock<RelayStats>>,
}

impl BusRelay {
    pub fn new(config: RelayConfig) -> Self {
        let bus = MemoryBus::new(MemoryBusConfig {
            capacity: config.broadcast_capacity,
            presence_ttl: config.presence_ttl,
        });
        Self {
            config,
            bus,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The bus every connection is attached to.
    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Bind to `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Bus relay listening on {}", listener.local_addr()?);

        let sweeper = self
            .config
            .presence_ttl
            .map(|_| self.bus.spawn_sweeper(self.config.sweep_interval));

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let bus = self.bus.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, bus, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        bus: MemoryBus,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Writer task: everything bound for this client goes through here
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // channel → (subscriber, forwarding task)
        let mut subscriptions: HashMap<String, (Uuid, JoinHandle<()>)> = HashMap::new();

        let outcome = loop {
            let msg = match ws_receiver.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            };
            match msg {
                Message::Binary(data) => {
                    let bytes: Vec<u8> = data.into();
                    {
                        let mut s = stats.write().await;
                        s.total_frames += 1;
                        s.total_bytes += bytes.len() as u64;
                    }
                    match RelayFrame::decode(&bytes) {
                        Ok(frame) => {
                            Self::handle_frame(frame, &bus, &out_tx, &mut subscriptions).await;
                        }
                        Err(e) => log::warn!("Bad frame from {addr}: {e}"),
                    }
                }
                Message::Ping(data) => {
                    let _ = out_tx.send(Message::Pong(data)).await;
                }
                Message::Close(_) => break Ok(()),
                _ => {}
            }
        };

        for (channel, (user_id, forwarder)) in subscriptions.drain() {
            forwarder.abort();
            if let Err(e) = bus.unsubscribe(&channel, user_id).await {
                log::warn!("Cleanup of {user_id} on {channel} failed: {e}");
            }
        }
        drop(out_tx);
        let _ = writer.await;

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection from {addr} closed");
        outcome
    }

    async fn handle_frame(
        frame: RelayFrame,
        bus: &MemoryBus,
        out_tx: &mpsc::Sender<Message>,
        subscriptions: &mut HashMap<String, (Uuid, JoinHandle<()>)>,
    ) {
        let result = match frame {
            RelayFrame::Subscribe { channel, user_id } => {
                match bus.subscribe(&channel, user_id).await {
                    Ok(mut subscription) => {
                        let out_tx = out_tx.clone();
                        let name = channel.clone();
                        let forwarder = tokio::spawn(async move {
                            while let Some(event) = subscription.recv().await {
                                let frame = RelayFrame::Event {
                                    channel: name.clone(),
                                    event,
                                };
                                let encoded = match frame.encode() {
                                    Ok(encoded) => encoded,
                                    Err(e) => {
                                        log::error!("Failed to encode event for {name}: {e}");
                                        continue;
                                    }
                                };
                                if out_tx.send(Message::Binary(encoded.into())).await.is_err() {
                                    break;
                                }
                            }
                        });
                        if let Some((_, previous)) = subscriptions.insert(channel, (user_id, forwarder)) {
                            previous.abort();
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            RelayFrame::Unsubscribe { channel, user_id } => {
                if let Some((_, forwarder)) = subscriptions.remove(&channel) {
                    forwarder.abort();
                }
                bus.unsubscribe(&channel, user_id).await
            }
            RelayFrame::Publish { channel, message } => bus.publish(&channel, &message).await,
            RelayFrame::Track { channel, record } => bus.track(&channel, record).await,
            RelayFrame::Event { .. } => Err(ProtocolError::UnexpectedFrame("event").into()),
        };
        if let Err(e) = result {
            log::warn!("Relay frame rejected: {e}");
        }
    }
}
