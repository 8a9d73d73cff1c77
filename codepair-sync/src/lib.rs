//! # codepair-sync - Session synchronization for collaborative code editing
//!
//! Keeps a shared source document, its programming language, and every
//! participant's presence consistent across clients in a session, while
//! persisting the document durably.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   publish / track    ┌──────────────┐
//! │ SessionHandle    │ ───────────────────► │ Bus          │
//! │ (per user)       │ ◄─────────────────── │ session-{id} │
//! └──┬─────────┬─────┘   BusEvent stream    └──────┬───────┘
//!    │         │                                   │ WsBus ◄─ WebSocket ─► BusRelay
//!    │         ▼                                   │ MemoryBus (in-process)
//!    │  ┌──────────────┐  debounced    ┌───────────┴──┐
//!    │  │ Propagator   │ ────────────► │ SessionStore │ RocksDB / memory
//!    │  │ + Presence   │  writes       └──────────────┘
//!    │  └──────────────┘
//!    ▼
//!  CursorThrottler · HeartbeatLoop · PersistenceDebouncer
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Lifecycle (create / join / leave) and the live handle
//! - [`propagator`]: Local/remote mutation rules, echo suppression
//! - [`presence`]: Participant set with cursor overlay
//! - [`bus`]: Broadcast + presence channel abstraction (memory and WebSocket)
//! - [`relay`]: WebSocket relay server hosting the shared bus
//! - [`store`]: Durable session records (RocksDB) and an in-memory double
//! - [`exec`]: Remote code execution with bounded polling

pub mod bus;
pub mod config;
pub mod error;
pub mod exec;
pub mod join_code;
pub mod language;
pub mod presence;
pub mod propagator;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod store;

mod debounce;
mod heartbeat;
mod state;
mod throttle;

// Re-exports for convenience
pub use bus::{Bus, ConnectionState, MemoryBus, MemoryBusConfig, Subscription, WsBus};
pub use config::{BackoffPolicy, SyncConfig};
pub use error::SyncError;
pub use exec::{ExecutionReport, ExecutionSandbox, ExecutionStatus, PollPolicy, SubmissionToken};
pub use language::Language;
pub use presence::PresenceTracker;
pub use propagator::{DocumentState, Edit, Effect, Mutation, UpdatePropagator};
pub use protocol::{
    BroadcastMessage, BusEvent, CursorPosition, Identity, Participant, ProtocolError, RelayFrame,
};
pub use relay::{BusRelay, RelayConfig, RelayStats};
pub use session::{FailureReason, SessionHandle, SessionLifecycle, SessionPhase};
pub use state::SessionStats;
pub use store::{MemoryStore, RocksSessionStore, Session, SessionDraft, SessionStore, StoreConfig, StoreError};
