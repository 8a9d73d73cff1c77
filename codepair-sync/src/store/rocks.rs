//! RocksDB-backed session store.
//!
//! Column families:
//! - `sessions`:    session records keyed by session id (bincode, content LZ4 compressed)
//! - `join_codes`:  join code → session id
//! - `participants`: `<session_id:16><user_id:16>` → last_seen millis (big-endian)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Session, SessionDraft, SessionStore};
use crate::error::SyncError;
use crate::language::Language;
use crate::protocol::now_millis;

const CF_SESSIONS: &str = "sessions";
const CF_JOIN_CODES: &str = "join_codes";
const CF_PARTICIPANTS: &str = "participants";

const COLUMN_FAMILIES: &[&str] = &[CF_SESSIONS, CF_JOIN_CODES, CF_PARTICIPANTS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("codepair_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-chosen directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Persistence(e.to_string())
    }
}

/// On-disk form of a [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    id: Uuid,
    join_code: String,
    creator_id: Uuid,
    language: Language,
    /// LZ4 with prepended size
    content: Vec<u8>,
    created_at: u64,
    updated_at: u64,
}

impl StoredSession {
    fn from_session(session: &Session) -> Self {
        Self {
            id: session.id,
            join_code: session.join_code.clone(),
            creator_id: session.creator_id,
            language: session.language,
            content: lz4_flex::compress_prepend_size(session.document_content.as_bytes()),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }

    fn into_session(self) -> Result<Session, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(&self.content)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let document_content =
            String::from_utf8(raw).map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Session {
            id: self.id,
            join_code: self.join_code,
            creator_id: self.creator_id,
            language: self.language,
            document_content,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (stored, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(stored)
    }
}

/// Durable [`SessionStore`]. Clones share the same database.
///
/// The methods here are blocking RocksDB calls; the async trait runs them on
/// the blocking pool. Session records are rewritten whole, so every
/// read-modify-write holds `write_lock`.
#[derive(Clone)]
pub struct RocksSessionStore {
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    config: Arc<StoreConfig>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksSessionStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened session store at {}", config.path.display());
        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf_options(name: &str, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // content is already LZ4 compressed
            CF_SESSIONS => opts.set_compression_type(DBCompressionType::None),
            CF_PARTICIPANTS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Insert a new session unless its join code is taken.
    pub fn insert_session(&self, draft: SessionDraft) -> Result<Result<Session, String>, StoreError> {
        let cf_codes = self.cf(CF_JOIN_CODES)?;
        let cf_sessions = self.cf(CF_SESSIONS)?;

        let _guard = self.write_lock.lock();
        if self.db.get_cf(&cf_codes, draft.join_code.as_bytes())?.is_some() {
            return Ok(Err(draft.join_code));
        }

        let session = Session::from_draft(draft, now_millis());
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_sessions, session.id.as_bytes(), StoredSession::from_session(&session).encode()?);
        batch.put_cf(&cf_codes, session.join_code.as_bytes(), session.id.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;
        Ok(Ok(session))
    }

    pub fn load_session(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(&cf, session_id.as_bytes())? {
            Some(bytes) => Ok(Some(StoredSession::decode(&bytes)?.into_session()?)),
            None => Ok(None),
        }
    }

    pub fn find_by_code(&self, join_code: &str) -> Result<Option<Session>, StoreError> {
        let cf = self.cf(CF_JOIN_CODES)?;
        let Some(id_bytes) = self.db.get_cf(&cf, join_code.as_bytes())? else {
            return Ok(None);
        };
        let id = Uuid::from_slice(&id_bytes)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        self.load_session(id)
    }

    /// Read-modify-write of one session record. Returns false if it does not exist.
    fn update_session(
        &self,
        session_id: Uuid,
        apply: impl FnOnce(&mut Session),
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let Some(mut session) = self.load_session(session_id)? else {
            return Ok(false);
        };
        apply(&mut session);
        let cf = self.cf(CF_SESSIONS)?;
        self.db.put_cf_opt(
            &cf,
            session_id.as_bytes(),
            StoredSession::from_session(&session).encode()?,
            &self.write_options(),
        )?;
        Ok(true)
    }

    pub fn store_document(&self, session_id: Uuid, content: &str, updated_at: u64) -> Result<bool, StoreError> {
        self.update_session(session_id, |session| {
            session.document_content = content.to_string();
            session.updated_at = updated_at;
        })
    }

    pub fn store_language(&self, session_id: Uuid, language: Language) -> Result<bool, StoreError> {
        self.update_session(session_id, |session| session.language = language)
    }

    // ─── Participants ─────────────────────────────────────────────────

    pub fn touch_participant(&self, session_id: Uuid, user_id: Uuid, last_seen: u64) -> Result<(), StoreError> {
        let cf = self.cf(CF_PARTICIPANTS)?;
        self.db.put_cf_opt(
            &cf,
            Self::participant_key(session_id, user_id),
            last_seen.to_be_bytes(),
            &self.write_options(),
        )?;
        Ok(())
    }

    /// Participants of a session with their last_seen, in user id order.
    pub fn list_participants(&self, session_id: Uuid) -> Result<Vec<(Uuid, u64)>, StoreError> {
        let cf = self.cf(CF_PARTICIPANTS)?;
        let start_key = Self::participant_key(session_id, Uuid::nil());

        let mut participants = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.len() != 32 || &key[..16] != session_id.as_bytes() {
                break;
            }
            let user_id = Uuid::from_slice(&key[16..])
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            let mut seen = [0u8; 8];
            if value.len() == 8 {
                seen.copy_from_slice(&value);
            }
            participants.push((user_id, u64::from_be_bytes(seen)));
        }
        Ok(participants)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Run a blocking store call off the async workers.
    async fn blocking<T, F>(&self, op: F) -> Result<T, SyncError>
    where
        F: FnOnce(&RocksSessionStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        let result = tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| SyncError::Persistence(format!("store task failed: {e}")))?;
        Ok(result?)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn participant_key(session_id: Uuid, user_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(session_id.as_bytes());
        key.extend_from_slice(user_id.as_bytes());
        key
    }
}

#[async_trait]
impl SessionStore for RocksSessionStore {
    async fn create_session(&self, draft: SessionDraft) -> Result<Session, SyncError> {
        self.blocking(move |store| store.insert_session(draft))
            .await?
            .map_err(SyncError::JoinCodeTaken)
    }

    async fn lookup_session(&self, join_code: &str) -> Result<Session, SyncError> {
        let code = join_code.to_string();
        self.blocking(move |store| store.find_by_code(&code))
            .await?
            .ok_or_else(|| SyncError::NotFound(join_code.to_string()))
    }

    async fn upsert_participant(&self, session_id: Uuid, user_id: Uuid) -> Result<(), SyncError> {
        self.blocking(move |store| store.touch_participant(session_id, user_id, now_millis()))
            .await
    }

    async fn persist_document(
        &self,
        session_id: Uuid,
        content: &str,
        updated_at: u64,
    ) -> Result<(), SyncError> {
        let content = content.to_string();
        if self
            .blocking(move |store| store.store_document(session_id, &content, updated_at))
            .await?
        {
            Ok(())
        } else {
            Err(SyncError::Persistence(format!("unknown session {session_id}")))
        }
    }

    async fn persist_language(&self, session_id: Uuid, language: Language) -> Result<(), SyncError> {
        if self
            .blocking(move |store| store.store_language(session_id, language))
            .await?
        {
            Ok(())
        } else {
            Err(SyncError::Persistence(format!("unknown session {session_id}")))
        }
    }
}
