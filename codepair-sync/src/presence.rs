//! Local view of who is in a session and where their cursors are.
//!
//! ```text
//! bus presence sync ──► PresenceTracker::apply_snapshot()   (replace all)
//! cursor-update     ──► PresenceTracker::apply_cursor()     (patch one)
//!                              │
//!                              ▼
//!                    participants() / remote_cursors()
//! ```
//!
//! The bus is authoritative: every sync replaces the whole set, so users
//! that left (or whose presence expired) disappear without a leave event.

use std::collections::HashMap;

use uuid::Uuid;

use crate::protocol::{CursorPosition, Participant};

/// Cursor and avatar colors, assigned by user id.
pub const PALETTE: [&str; 8] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E2",
];

/// Stable palette color for a user.
pub fn color_for(user_id: Uuid) -> &'static str {
    PALETTE[(user_id.as_u128() % PALETTE.len() as u128) as usize]
}

/// Participant set of one session as last reported by the bus.
#[derive(Debug)]
pub struct PresenceTracker {
    local_user_id: Uuid,
    participants: HashMap<Uuid, Participant>,
    snapshots_applied: u64,
}

impl PresenceTracker {
    pub fn new(local_user_id: Uuid) -> Self {
        Self {
            local_user_id,
            participants: HashMap::new(),
            snapshots_applied: 0,
        }
    }

    /// Replace the whole set with `snapshot`. A user listed twice keeps the
    /// entry with the latest `last_seen`.
    pub fn apply_snapshot(&mut self, snapshot: Vec<Participant>) {
        self.participants.clear();
        for record in snapshot {
            match self.participants.get(&record.user_id) {
                Some(existing) if existing.last_seen > record.last_seen => {}
                _ => {
                    self.participants.insert(record.user_id, record);
                }
            }
        }
        self.snapshots_applied += 1;
    }

    /// Patch a remote participant's cursor. Returns false when the user is
    /// unknown or is the local user.
    pub fn apply_cursor(&mut self, user_id: Uuid, position: CursorPosition) -> bool {
        if user_id == self.local_user_id {
            return false;
        }
        match self.participants.get_mut(&user_id) {
            Some(participant) => {
                participant.cursor_position = Some(position);
                true
            }
            None => {
                log::trace!("cursor update from {user_id} before its presence arrived");
                false
            }
        }
    }

    /// All participants, the local user included, ordered by display name.
    pub fn participants(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self.participants.values().cloned().collect();
        list.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        list
    }

    /// Remote participants that have a known cursor, for overlay rendering.
    pub fn remote_cursors(&self) -> Vec<(Uuid, CursorPosition, &str)> {
        self.participants
            .values()
            .filter(|p| p.user_id != self.local_user_id)
            .filter_map(|p| p.cursor_position.map(|pos| (p.user_id, pos, p.color.as_str())))
            .collect()
    }

    pub fn participant(&self, user_id: &Uuid) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn snapshots_applied(&self) -> u64 {
        self.snapshots_applied
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}
