//! Wire types shared by every participant of a session channel.
//!
//! Broadcast events on a `session-{id}` channel:
//! ```text
//! ┌───────────────────┬──────────────────────────────┬───────────┐
//! │ event             │ payload                      │ origin_id │
//! ├───────────────────┼──────────────────────────────┼───────────┤
//! │ code-update       │ full document content        │ sender    │
//! │ language-update   │ Language                     │ sender    │
//! │ cursor-update     │ CursorPosition {x, y}        │ sender    │
//! └───────────────────┴──────────────────────────────┴───────────┘
//! ```
//!
//! Presence is carried separately as full snapshots of [`Participant`]
//! records. Everything is bincode-encoded (standard config) when it crosses
//! a socket; see [`RelayFrame`] for the relay envelope.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::language::Language;

/// Pointer position in editor-pane coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Event broadcast to every other subscriber of a session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BroadcastMessage {
    CodeUpdate { content: String, origin_id: Uuid },
    LanguageUpdate { language: Language, origin_id: Uuid },
    CursorUpdate { position: CursorPosition, origin_id: Uuid },
}

impl BroadcastMessage {
    pub const CODE_UPDATE: &'static str = "code-update";
    pub const LANGUAGE_UPDATE: &'static str = "language-update";
    pub const CURSOR_UPDATE: &'static str = "cursor-update";

    pub fn origin_id(&self) -> Uuid {
        match self {
            Self::CodeUpdate { origin_id, .. }
            | Self::LanguageUpdate { origin_id, .. }
            | Self::CursorUpdate { origin_id, .. } => *origin_id,
        }
    }

    /// Channel event name this message is published under.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CodeUpdate { .. } => Self::CODE_UPDATE,
            Self::LanguageUpdate { .. } => Self::LANGUAGE_UPDATE,
            Self::CursorUpdate { .. } => Self::CURSOR_UPDATE,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Identity of the local user, fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl Identity {
    pub fn new(user_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }

    /// Presence record describing this user at `last_seen`.
    pub fn presence(&self, cursor_position: Option<CursorPosition>, last_seen: u64) -> Participant {
        Participant {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            avatar_ref: self.avatar_ref.clone(),
            color: crate::presence::color_for(self.user_id).to_string(),
            cursor_position,
            last_seen,
        }
    }
}

/// Presence record of one user in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    /// `#RRGGBB` from the shared palette.
    pub color: String,
    pub cursor_position: Option<CursorPosition>,
    /// Unix millis of the last track for this user.
    pub last_seen: u64,
}

/// What a channel subscription delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusEvent {
    Broadcast(BroadcastMessage),
    /// Authoritative presence set of the channel.
    PresenceSync(Vec<Participant>),
}

/// Frames exchanged between a `WsBus` client and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    Subscribe { channel: String, user_id: Uuid },
    Unsubscribe { channel: String, user_id: Uuid },
    Publish { channel: String, message: BroadcastMessage },
    Track { channel: String, record: Participant },
    /// Relay → client only.
    Event { channel: String, event: BusEvent },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Broadcast channel name for a session.
pub fn channel_name(session_id: Uuid) -> String {
    format!("session-{session_id}")
}

/// Wall-clock Unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A frame that is only valid in the other direction.
    UnexpectedFrame(&'static str),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame(kind) => write!(f, "Unexpected frame: {kind}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
