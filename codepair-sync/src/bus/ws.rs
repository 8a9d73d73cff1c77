//! WebSocket bus client talking to a `BusRelay`.
//!
//! One socket carries every channel. Frames are bincode [`RelayFrame`]s:
//! the client sends `Subscribe` / `Unsubscribe` / `Publish` / `Track`, the
//! relay answers with `Event` frames that are routed to the matching
//! [`Subscription`].
//!
//! When the socket drops, every subscription opened on it ends. The next
//! `subscribe` reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{Bus, Subscription};
use crate::error::SyncError;
use crate::protocol::{BroadcastMessage, BusEvent, Participant, RelayFrame};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Current socket. `generation` increments per connect so a dying reader
/// only tears down what belongs to its own socket.
struct Link {
    state: ConnectionState,
    generation: u64,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
}

struct Route {
    generation: u64,
    events: mpsc::Sender<BusEvent>,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

/// [`Bus`] over a WebSocket connection to the relay.
pub struct WsBus {
    url: String,
    capacity: usize,
    link: Arc<Mutex<Link>>,
    routes: Routes,
    connect_lock: tokio::sync::Mutex<()>,
}

impl WsBus {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_capacity(url, 256)
    }

    pub fn with_capacity(url: impl Into<String>, capacity: usize) -> Self {
        Self {
            url: url.into(),
            capacity,
            link: Arc::new(Mutex::new(Link {
                state: ConnectionState::Disconnected,
                generation: 0,
                outgoing: None,
            })),
            routes: Arc::new(Mutex::new(HashMap::new())),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.lock().state
    }

    /// Connect eagerly. `subscribe` does this on demand.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.ensure_connected().await.map(|_| ())
    }

    fn live_sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        let link = self.link.lock();
        match (&link.state, &link.outgoing) {
            (ConnectionState::Connected, Some(tx)) if !tx.is_closed() => Some(tx.clone()),
            _ => None,
        }
    }

    async fn ensure_connected(&self) -> Result<mpsc::Sender<Vec<u8>>, SyncError> {
        if let Some(tx) = self.live_sender() {
            return Ok(tx);
        }
        let _guard = self.connect_lock.lock().await;
        // Double-check after acquiring the connect lock
        if let Some(tx) = self.live_sender() {
            return Ok(tx);
        }
        self.open().await
    }

    async fn open(&self) -> Result<mpsc::Sender<Vec<u8>>, SyncError> {
        self.link.lock().state = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.link.lock().state = ConnectionState::Disconnected;
                return Err(SyncError::TransientBus(format!("connect to {}: {e}", self.url)));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.capacity);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let generation = {
            let mut link = self.link.lock();
            link.generation += 1;
            link.state = ConnectionState::Connected;
            link.outgoing = Some(out_tx.clone());
            link.generation
        };
        log::info!("Connected to relay {} (generation {generation})", self.url);

        // Reader task: route Event frames to subscriptions
        let routes = self.routes.clone();
        let link: Weak<Mutex<Link>> = Arc::downgrade(&self.link);
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayFrame::decode(&bytes) {
                            Ok(RelayFrame::Event { channel, event }) => {
                                let route = routes
                                    .lock()
                                    .get(&channel)
                                    .filter(|route| route.generation == generation)
                                    .map(|route| route.events.clone());
                                if let Some(events) = route {
                                    if events.send(event).await.is_err() {
                                        log::debug!("Subscription to {channel} dropped by its owner");
                                    }
                                }
                            }
                            Ok(_) => log::warn!("Relay sent a client-only frame"),
                            Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: mark disconnected first so no new route
            // can attach to this generation, then end its subscriptions.
            if let Some(link) = link.upgrade() {
                let mut link = link.lock();
                if link.generation == generation {
                    link.state = ConnectionState::Disconnected;
                    link.outgoing = None;
                }
            }
            routes.lock().retain(|_, route| route.generation != generation);
            log::warn!("Relay connection to {url} lost");
        });

        Ok(out_tx)
    }

    async fn send_frame(
        &self,
        outgoing: &mpsc::Sender<Vec<u8>>,
        frame: &RelayFrame,
    ) -> Result<(), SyncError> {
        let encoded = frame.encode()?;
        outgoing
            .send(encoded)
            .await
            .map_err(|_| SyncError::TransientBus("relay connection closed".into()))
    }

    async fn send_live(&self, frame: &RelayFrame) -> Result<(), SyncError> {
        let outgoing = self
            .live_sender()
            .ok_or_else(|| SyncError::TransientBus("not connected to relay".into()))?;
        self.send_frame(&outgoing, frame).await
    }
}

#[async_trait]
impl Bus for WsBus {
    async fn publish(&self, channel: &str, message: &BroadcastMessage) -> Result<(), SyncError> {
        self.send_live(&RelayFrame::Publish {
            channel: channel.to_string(),
            message: message.clone(),
        })
        .await
    }

    async fn subscribe(&self, channel: &str, subscriber: Uuid) -> Result<Subscription, SyncError> {
        let outgoing = self.ensure_connected().await?;
        let (tx, events) = mpsc::channel(self.capacity);
        {
            let link = self.link.lock();
            if link.state != ConnectionState::Connected {
                return Err(SyncError::TransientBus("relay connection lost".into()));
            }
            self.routes.lock().insert(
                channel.to_string(),
                Route {
                    generation: link.generation,
                    events: tx,
                },
            );
        }

        let frame = RelayFrame::Subscribe {
            channel: channel.to_string(),
            user_id: subscriber,
        };
        if let Err(e) = self.send_frame(&outgoing, &frame).await {
            self.routes.lock().remove(channel);
            return Err(e);
        }
        Ok(Subscription::new(channel, events))
    }

    async fn track(&self, channel: &str, record: Participant) -> Result<(), SyncError> {
        self.send_live(&RelayFrame::Track {
            channel: channel.to_string(),
            record,
        })
        .await
    }

    async fn unsubscribe(&self, channel: &str, subscriber: Uuid) -> Result<(), SyncError> {
        self.routes.lock().remove(channel);
        match self.live_sender() {
            Some(outgoing) => {
                let frame = RelayFrame::Unsubscribe {
                    channel: channel.to_string(),
                    user_id: subscriber,
                };
                self.send_frame(&outgoing, &frame).await
            }
            // Nothing to tell a relay we are no longer connected to.
            None => Ok(()),
        }
    }
}
