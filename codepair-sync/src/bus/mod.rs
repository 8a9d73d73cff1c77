//! Realtime pub/sub seam.
//!
//! A bus delivers broadcasts on a channel to every subscriber except the
//! sender, and keeps a presence set per channel that it pushes to all
//! subscribers as a full snapshot whenever it changes.
//!
//! ```text
//!  publish(channel, msg) ──► fan-out (sender excluded) ──► Subscription
//!  track(channel, record) ─► presence set ──► PresenceSync(snapshot) ──► Subscription
//! ```
//!
//! A [`Subscription`] ending (`recv` returns `None`) means the bus connection
//! was lost; the session layer reacts by re-subscribing.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::{BroadcastMessage, BusEvent, Participant};

pub use memory::{MemoryBus, MemoryBusConfig};
pub use ws::{ConnectionState, WsBus};

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish under `message.event_name()`; the origin does not receive it.
    async fn publish(&self, channel: &str, message: &BroadcastMessage) -> Result<(), SyncError>;

    /// Open the event stream of `channel` for `subscriber`.
    async fn subscribe(&self, channel: &str, subscriber: Uuid) -> Result<Subscription, SyncError>;

    /// Insert or refresh the presence record keyed by `record.user_id`.
    async fn track(&self, channel: &str, record: Participant) -> Result<(), SyncError>;

    /// Close the subscriber's stream and drop its presence.
    async fn unsubscribe(&self, channel: &str, subscriber: Uuid) -> Result<(), SyncError>;
}

/// Inbound event stream of one channel.
pub struct Subscription {
    channel: String,
    events: mpsc::Receiver<BusEvent>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, events: mpsc::Receiver<BusEvent>) -> Self {
        Self {
            channel: channel.into(),
            events,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next event, or `None` once the bus dropped the subscription.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.events.try_recv().ok()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
