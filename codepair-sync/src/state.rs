//! State shared between a session handle and its background tasks.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::presence::PresenceTracker;
use crate::propagator::UpdatePropagator;
use crate::protocol::{now_millis, CursorPosition, Identity, Participant};
use crate::session::SessionPhase;

/// Counters describing a session's traffic, as returned by
/// `SessionHandle::stats()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub broadcasts_sent: u64,
    pub remote_updates_applied: u64,
    pub echoes_discarded: u64,
    pub cursor_flushes: u64,
    pub heartbeats: u64,
    pub durable_writes: u64,
    pub failed_writes: u64,
    pub reconnects: u64,
}

/// Mutable per-session state. Locked briefly, never across an `.await`.
pub(crate) struct SessionState {
    pub identity: Identity,
    pub propagator: UpdatePropagator,
    pub presence: PresenceTracker,
    /// Latest raw pointer sample, flushed by the cursor throttler.
    pub last_cursor: Option<CursorPosition>,
    pub phase: SessionPhase,
    /// Cleared on leave; background tasks check it before any effect.
    pub active: bool,
    pub stats: SessionStats,
}

pub(crate) type SharedState = Arc<Mutex<SessionState>>;

impl SessionState {
    pub fn new(identity: Identity, is_creator: bool) -> Self {
        let user_id = identity.user_id;
        Self {
            identity,
            propagator: UpdatePropagator::new(user_id, is_creator),
            presence: PresenceTracker::new(user_id),
            last_cursor: None,
            phase: SessionPhase::Active,
            active: true,
            stats: SessionStats::default(),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Presence record for the local user as of now.
    pub fn presence_record(&self) -> Participant {
        self.identity.presence(self.last_cursor, now_millis())
    }
}
