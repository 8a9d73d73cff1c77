//! In-process session store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Session, SessionDraft, SessionStore};
use crate::error::SyncError;
use crate::language::Language;
use crate::protocol::now_millis;

/// One accepted `persist_document` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentWrite {
    pub content: String,
    pub updated_at: u64,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, Session>,
    join_codes: HashMap<String, Uuid>,
    /// (session, user) → last_seen millis
    participants: HashMap<(Uuid, Uuid), u64>,
    document_writes: HashMap<Uuid, Vec<DocumentWrite>>,
    language_writes: HashMap<Uuid, Vec<Language>>,
}

/// Session store kept in memory. Clones share the same tables.
///
/// Keeps a log of every document and language write so callers can
/// observe persistence traffic, and can be told to fail writes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `persist_document` / `persist_language` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn session(&self, session_id: Uuid) -> Option<Session> {
        self.tables.read().await.sessions.get(&session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    /// Participant ids of a session, sorted.
    pub async fn participants(&self, session_id: Uuid) -> Vec<Uuid> {
        let tables = self.tables.read().await;
        let mut users: Vec<Uuid> = tables
            .participants
            .keys()
            .filter(|(sid, _)| *sid == session_id)
            .map(|(_, uid)| *uid)
            .collect();
        users.sort();
        users
    }

    pub async fn last_seen(&self, session_id: Uuid, user_id: Uuid) -> Option<u64> {
        self.tables
            .read()
            .await
            .participants
            .get(&(session_id, user_id))
            .copied()
    }

    pub async fn document_writes(&self, session_id: Uuid) -> Vec<DocumentWrite> {
        self.tables
            .read()
            .await
            .document_writes
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn language_writes(&self, session_id: Uuid) -> Vec<Language> {
        self.tables
            .read()
            .await
            .language_writes
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_writable(&self) -> Result<(), SyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(SyncError::Persistence("store rejected write".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, draft: SessionDraft) -> Result<Session, SyncError> {
        let mut tables = self.tables.write().await;
        if tables.join_codes.contains_key(&draft.join_code) {
            return Err(SyncError::JoinCodeTaken(draft.join_code));
        }
        let session = Session::from_draft(draft, now_millis());
        tables.join_codes.insert(session.join_code.clone(), session.id);
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn lookup_session(&self, join_code: &str) -> Result<Session, SyncError> {
        let tables = self.tables.read().await;
        tables
            .join_codes
            .get(join_code)
            .and_then(|id| tables.sessions.get(id))
            .cloned()
            .ok_or_else(|| SyncError::NotFound(join_code.to_string()))
    }

    async fn upsert_participant(&self, session_id: Uuid, user_id: Uuid) -> Result<(), SyncError> {
        let mut tables = self.tables.write().await;
        if !tables.sessions.contains_key(&session_id) {
            return Err(SyncError::Persistence(format!("unknown session {session_id}")));
        }
        tables.participants.insert((session_id, user_id), now_millis());
        Ok(())
    }

    async fn persist_document(
        &self,
        session_id: Uuid,
        content: &str,
        updated_at: u64,
    ) -> Result<(), SyncError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| SyncError::Persistence(format!("unknown session {session_id}")))?;
        session.document_content = content.to_string();
        session.updated_at = updated_at;
        tables
            .document_writes
            .entry(session_id)
            .or_default()
            .push(DocumentWrite {
                content: content.to_string(),
                updated_at,
            });
        Ok(())
    }

    async fn persist_language(&self, session_id: Uuid, language: Language) -> Result<(), SyncError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| SyncError::Persistence(format!("unknown session {session_id}")))?;
        session.language = language;
        tables.language_writes.entry(session_id).or_default().push(language);
        Ok(())
    }
}
