//! Durable session records behind an async seam.
//!
//! ```text
//! ┌──────────────────┐  create / lookup / upsert   ┌───────────────────┐
//! │ SessionLifecycle │ ──────────────────────────► │ dyn SessionStore  │
//! └──────────────────┘                             ├───────────────────┤
//! ┌──────────────────┐  persist_document           │ MemoryStore       │
//! │ Debouncer        │ ──────────────────────────► │ RocksSessionStore │
//! └──────────────────┘                             └───────────────────┘
//! ```

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::language::Language;

pub use memory::{DocumentWrite, MemoryStore};
pub use rocks::{RocksSessionStore, StoreConfig, StoreError};

/// Stored state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub join_code: String,
    pub creator_id: Uuid,
    pub language: Language,
    pub document_content: String,
    /// Unix millis.
    pub created_at: u64,
    /// Unix millis of the last document write.
    pub updated_at: u64,
}

/// Everything needed to create a session record.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDraft {
    pub join_code: String,
    pub creator_id: Uuid,
    pub language: Language,
}

impl Session {
    /// Empty-document session with a fresh id.
    pub fn from_draft(draft: SessionDraft, now: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            join_code: draft.join_code,
            creator_id: draft.creator_id,
            language: draft.language,
            document_content: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with `JoinCodeTaken` when the code belongs to another session.
    async fn create_session(&self, draft: SessionDraft) -> Result<Session, SyncError>;

    /// Fails with `NotFound` when no session has this code.
    async fn lookup_session(&self, join_code: &str) -> Result<Session, SyncError>;

    /// Records `user_id` as a participant, refreshing its `last_seen`.
    async fn upsert_participant(&self, session_id: Uuid, user_id: Uuid) -> Result<(), SyncError>;

    async fn persist_document(
        &self,
        session_id: Uuid,
        content: &str,
        updated_at: u64,
    ) -> Result<(), SyncError>;

    async fn persist_language(&self, session_id: Uuid, language: Language) -> Result<(), SyncError>;
}
