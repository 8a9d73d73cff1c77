//! In-process bus: per-channel fan-out with presence.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers of a
//! channel. Each subscription gets a forwarding task that filters out the
//! subscriber's own broadcasts and feeds a bounded mpsc queue.
//!
//! The relay server wraps one of these; tests use it directly, together
//! with the fault-injection switches (`set_offline`, `disconnect_all`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Bus, Subscription};
use crate::error::SyncError;
use crate::protocol::{BroadcastMessage, BusEvent, Participant};

#[derive(Debug, Clone)]
pub struct MemoryBusConfig {
    /// Events buffered per subscriber before it starts lagging.
    pub capacity: usize,
    /// Presence records not refreshed within this window are swept.
    pub presence_ttl: Option<Duration>,
}

impl Default for MemoryBusConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            presence_ttl: None,
        }
    }
}

/// Counters for monitoring bus traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBusStats {
    pub publishes: u64,
    pub tracks: u64,
    pub presence_syncs: u64,
    pub lagged_events: u64,
}

#[derive(Default)]
struct AtomicBusStats {
    publishes: AtomicU64,
    tracks: AtomicU64,
    presence_syncs: AtomicU64,
    lagged_events: AtomicU64,
}

struct Envelope {
    /// Subscriber that must not see this event (the sender).
    exclude: Option<Uuid>,
    event: BusEvent,
}

struct TrackedPresence {
    record: Participant,
    refreshed_at: Instant,
}

/// One `session-{id}` channel.
struct ChannelState {
    sender: broadcast::Sender<Arc<Envelope>>,
    presence: Mutex<HashMap<Uuid, TrackedPresence>>,
    /// Dropping a subscriber's closer ends its forwarding task.
    subscribers: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
}

impl ChannelState {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            presence: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot(&self) -> Vec<Participant> {
        let mut records: Vec<Participant> = self
            .presence
            .lock()
            .values()
            .map(|tracked| tracked.record.clone())
            .collect();
        records.sort_by_key(|p| p.user_id);
        records
    }

    fn is_idle(&self) -> bool {
        self.subscribers.lock().is_empty() && self.presence.lock().is_empty()
    }
}

struct Shared {
    channels: RwLock<HashMap<String, Arc<ChannelState>>>,
    config: MemoryBusConfig,
    offline: AtomicBool,
    published: Mutex<Vec<(String, BroadcastMessage)>>,
    tracks_by_user: Mutex<HashMap<Uuid, u64>>,
    stats: AtomicBusStats,
}

/// In-process [`Bus`]. Clones share the same channels.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(MemoryBusConfig::default())
    }
}

impl MemoryBus {
    pub fn new(config: MemoryBusConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                channels: RwLock::new(HashMap::new()),
                config,
                offline: AtomicBool::new(false),
                published: Mutex::new(Vec::new()),
                tracks_by_user: Mutex::new(HashMap::new()),
                stats: AtomicBusStats::default(),
            }),
        }
    }

    // ─── Fault injection ──────────────────────────────────────────────

    /// While offline every publish/subscribe/track fails with `TransientBus`.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.shared.offline.load(Ordering::SeqCst)
    }

    /// End every open subscription, as if all connections dropped.
    /// Presence is kept until it expires or is untracked.
    pub async fn disconnect_all(&self) -> usize {
        let channels = self.shared.channels.read().await;
        channels
            .values()
            .map(|state| state.subscribers.lock().drain().count())
            .sum()
    }

    // ─── Inspection ───────────────────────────────────────────────────

    /// Messages published on `channel`, in order.
    pub fn published(&self, channel: &str) -> Vec<BroadcastMessage> {
        self.shared
            .published
            .lock()
            .iter()
            .filter(|(name, _)| name == channel)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    /// Number of messages published by `origin_id` across all channels.
    pub fn published_by(&self, origin_id: Uuid) -> usize {
        self.shared
            .published
            .lock()
            .iter()
            .filter(|(_, msg)| msg.origin_id() == origin_id)
            .count()
    }

    pub fn track_count(&self, user_id: Uuid) -> u64 {
        self.shared
            .tracks_by_user
            .lock()
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    /// Current presence set of a channel, ordered by user id.
    pub async fn presence(&self, channel: &str) -> Vec<Participant> {
        match self.existing(channel).await {
            Some(state) => state.snapshot(),
            None => Vec::new(),
        }
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        match self.existing(channel).await {
            Some(state) => state.subscribers.lock().len(),
            None => 0,
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.shared.channels.read().await.len()
    }

    pub fn stats(&self) -> MemoryBusStats {
        let stats = &self.shared.stats;
        MemoryBusStats {
            publishes: stats.publishes.load(Ordering::Relaxed),
            tracks: stats.tracks.load(Ordering::Relaxed),
            presence_syncs: stats.presence_syncs.load(Ordering::Relaxed),
            lagged_events: stats.lagged_events.load(Ordering::Relaxed),
        }
    }

    // ─── Presence expiry ──────────────────────────────────────────────

    /// Drop presence records older than the configured TTL and push the new
    /// snapshot to affected channels. Returns the removed (channel, user) pairs.
    pub async fn sweep_expired(&self) -> Vec<(String, Uuid)> {
        let Some(ttl) = self.shared.config.presence_ttl else {
            return Vec::new();
        };
        let channels: Vec<(String, Arc<ChannelState>)> = self
            .shared
            .channels
            .read()
            .await
            .iter()
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect();

        let mut expired = Vec::new();
        for (name, state) in channels {
            let stale: Vec<Uuid> = {
                let mut presence = state.presence.lock();
                let stale: Vec<Uuid> = presence
                    .iter()
                    .filter(|(_, tracked)| tracked.refreshed_at.elapsed() > ttl)
                    .map(|(id, _)| *id)
                    .collect();
                for id in &stale {
                    presence.remove(id);
                }
                stale
            };
            if stale.is_empty() {
                continue;
            }
            log::info!("Expired {} presence record(s) on {name}", stale.len());
            self.push_presence(&state);
            expired.extend(stale.into_iter().map(|id| (name.clone(), id)));
        }
        expired
    }

    /// Run `sweep_expired` every `every` until the handle is aborted.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                bus.sweep_expired().await;
            }
        })
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn check_online(&self) -> Result<(), SyncError> {
        if self.is_offline() {
            Err(SyncError::TransientBus("bus offline".into()))
        } else {
            Ok(())
        }
    }

    async fn existing(&self, channel: &str) -> Option<Arc<ChannelState>> {
        self.shared.channels.read().await.get(channel).cloned()
    }

    async fn get_or_create(&self, channel: &str) -> Arc<ChannelState> {
        // Fast path: read lock
        if let Some(state) = self.existing(channel).await {
            return state;
        }

        let mut channels = self.shared.channels.write().await;
        // Double-check after acquiring write lock
        if let Some(state) = channels.get(channel) {
            return state.clone();
        }
        let state = Arc::new(ChannelState::new(self.shared.config.capacity));
        channels.insert(channel.to_string(), state.clone());
        state
    }

    async fn remove_if_idle(&self, channel: &str) -> bool {
        let mut channels = self.shared.channels.write().await;
        if channels.get(channel).is_some_and(|state| state.is_idle()) {
            channels.remove(channel);
            return true;
        }
        false
    }

    fn push_presence(&self, state: &ChannelState) {
        let envelope = Envelope {
            exclude: None,
            event: BusEvent::PresenceSync(state.snapshot()),
        };
        let _ = state.sender.send(Arc::new(envelope));
        self.shared.stats.presence_syncs.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, message: &BroadcastMessage) -> Result<(), SyncError> {
        self.check_online()?;
        self.shared
            .published
            .lock()
            .push((channel.to_string(), message.clone()));
        self.shared.stats.publishes.fetch_add(1, Ordering::Relaxed);

        if let Some(state) = self.existing(channel).await {
            let envelope = Envelope {
                exclude: Some(message.origin_id()),
                event: BusEvent::Broadcast(message.clone()),
            };
            // No receivers is not an error: nobody else is listening yet.
            let _ = state.sender.send(Arc::new(envelope));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, subscriber: Uuid) -> Result<Subscription, SyncError> {
        self.check_online()?;
        let state = self.get_or_create(channel).await;

        let mut rx = state.sender.subscribe();
        let (tx, events) = mpsc::channel(self.shared.config.capacity);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        state.subscribers.lock().insert(subscriber, close_tx);

        // New subscribers learn the current presence set immediately.
        let _ = tx.try_send(BusEvent::PresenceSync(state.snapshot()));

        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => break,
                    received = rx.recv() => match received {
                        Ok(envelope) => {
                            if envelope.exclude == Some(subscriber) {
                                continue;
                            }
                            if tx.send(envelope.event.clone()).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Subscriber {subscriber} lagged, dropped {n} events");
                            shared.stats.lagged_events.fetch_add(n, Ordering::Relaxed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        log::debug!("{subscriber} subscribed to {channel}");
        Ok(Subscription::new(channel, events))
    }

    async fn track(&self, channel: &str, record: Participant) -> Result<(), SyncError> {
        self.check_online()?;
        let state = self.get_or_create(channel).await;
        let user_id = record.user_id;
        state.presence.lock().insert(
            user_id,
            TrackedPresence {
                record,
                refreshed_at: Instant::now(),
            },
        );
        *self.shared.tracks_by_user.lock().entry(user_id).or_default() += 1;
        self.shared.stats.tracks.fetch_add(1, Ordering::Relaxed);
        self.push_presence(&state);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, subscriber: Uuid) -> Result<(), SyncError> {
        let Some(state) = self.existing(channel).await else {
            return Ok(());
        };
        state.subscribers.lock().remove(&subscriber);
        let was_present = state.presence.lock().remove(&subscriber).is_some();
        if was_present {
            self.push_presence(&state);
        }
        if self.remove_if_idle(channel).await {
            log::debug!("Channel {channel} closed");
        }
        Ok(())
    }
}
