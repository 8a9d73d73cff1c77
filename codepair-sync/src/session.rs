//! Session lifecycle: create, join, leave, and the live session handle.
//!
//! ```text
//!            create()                      bus dropped
//!   Idle ──────────────► Creating ──┐    ┌──────────────► Reconnecting{n}
//!    │                              ├──► Active ◄───────────────┘   │
//!    └──── join(code) ─► Joining ───┘     │                         │ attempts
//!    ▲          │                         │ leave()                 ▼ exhausted
//!    │          └── NotFound (stays Idle) ▼                       Failed
//!    └──────────────────────────────── Leaving ◄── leave() ────────┘
//! ```
//!
//! A [`SessionHandle`] owns everything a live session runs: the bus
//! subscription pump, the persistence debouncer, the cursor throttler and
//! the heartbeat. `leave()` stops all of them before it returns, so no
//! publish, track or durable write happens afterwards.

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{Bus, Subscription};
use crate::config::{BackoffPolicy, SyncConfig};
use crate::debounce::PersistenceDebouncer;
use crate::error::SyncError;
use crate::exec::{self, ExecutionReport, ExecutionSandbox, PollPolicy};
use crate::heartbeat::HeartbeatLoop;
use crate::join_code;
use crate::language::Language;
use crate::propagator::{DocumentState, Edit, Effect, Mutation};
use crate::protocol::{channel_name, BroadcastMessage, BusEvent, CursorPosition, Identity, Participant};
use crate::state::{SessionState, SessionStats, SharedState};
use crate::store::{Session, SessionDraft, SessionStore};
use crate::throttle::CursorThrottler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Creating,
    Joining,
    Active,
    /// Re-subscribing after the bus dropped the subscription.
    Reconnecting { attempt: u32 },
    Leaving,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    BusUnavailable { attempts: u32 },
}

/// Entry point for one user: at most one live session at a time.
pub struct SessionLifecycle {
    identity: Identity,
    bus: Arc<dyn Bus>,
    store: Arc<dyn SessionStore>,
    config: SyncConfig,
    phase: SessionPhase,
    handle: Option<SessionHandle>,
}

impl SessionLifecycle {
    pub fn new(identity: Identity, bus: Arc<dyn Bus>, store: Arc<dyn SessionStore>, config: SyncConfig) -> Self {
        Self {
            identity,
            bus,
            store,
            config,
            phase: SessionPhase::Idle,
            handle: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        match &self.handle {
            Some(handle) => handle.phase(),
            None => self.phase.clone(),
        }
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut SessionHandle> {
        self.handle.as_mut()
    }

    /// Create a session owned by this user and enter it.
    pub async fn create(&mut self, initial_language: Language) -> Result<&mut SessionHandle, SyncError> {
        self.ensure_idle().await?;
        self.phase = SessionPhase::Creating;
        let result = match self.create_with_fresh_code(initial_language).await {
            Ok(session) => {
                log::info!(
                    "Created session {} ({}) in {}",
                    session.join_code,
                    session.id,
                    session.language
                );
                self.enter(session).await
            }
            Err(e) => Err(e),
        };
        self.finish_entry(result)
    }

    /// Join an existing session by its code. Input is trimmed and upper-cased.
    pub async fn join(&mut self, code: &str) -> Result<&mut SessionHandle, SyncError> {
        self.ensure_idle().await?;
        let code = join_code::normalize(code)?;
        self.phase = SessionPhase::Joining;
        let result = match self.store.lookup_session(&code).await {
            Ok(session) => self.enter(session).await,
            Err(e) => {
                log::info!("Join with code {code} failed: {e}");
                Err(e)
            }
        };
        self.finish_entry(result)
    }

    /// Stop every timer, unsubscribe and return to `Idle`. Safe to call in
    /// any phase, any number of times.
    pub async fn leave(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            self.phase = SessionPhase::Leaving;
            handle.close().await;
        }
        self.phase = SessionPhase::Idle;
    }

    async fn ensure_idle(&mut self) -> Result<(), SyncError> {
        match self.phase() {
            SessionPhase::Idle => Ok(()),
            SessionPhase::Failed(_) => {
                self.leave().await;
                Ok(())
            }
            _ => Err(SyncError::AlreadyInSession),
        }
    }

    fn finish_entry(&mut self, result: Result<SessionHandle, SyncError>) -> Result<&mut SessionHandle, SyncError> {
        match result {
            Ok(handle) => {
                self.phase = SessionPhase::Active;
                Ok(self.handle.insert(handle))
            }
            Err(e) => {
                self.phase = SessionPhase::Idle;
                Err(e)
            }
        }
    }

    async fn create_with_fresh_code(&self, language: Language) -> Result<Session, SyncError> {
        let attempts = self.config.join_code_attempts.max(1);
        let mut last_error = None;
        for _ in 0..attempts {
            let draft = SessionDraft {
                join_code: join_code::generate(),
                creator_id: self.identity.user_id,
                language,
            };
            match self.store.create_session(draft).await {
                Ok(session) => return Ok(session),
                Err(SyncError::JoinCodeTaken(code)) => {
                    log::debug!("Join code {code} collided, drawing another");
                    last_error = Some(SyncError::JoinCodeTaken(code));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| SyncError::JoinCodeTaken(String::new())))
    }

    /// Subscribe, register as participant, load the stored state and announce.
    /// A failed subscribe leaves no participant record behind.
    async fn enter(&self, session: Session) -> Result<SessionHandle, SyncError> {
        let user_id = self.identity.user_id;
        let channel = channel_name(session.id);
        let subscription = self.bus.subscribe(&channel, user_id).await?;

        if let Err(e) = self.store.upsert_participant(session.id, user_id).await {
            log::warn!("Could not record {user_id} as participant of {}: {e}", session.join_code);
        }

        let mut state = SessionState::new(self.identity.clone(), session.creator_id == user_id);
        state.propagator.ingest(Mutation::Snapshot {
            content: session.document_content.clone(),
            language: session.language,
        });
        let state = state.shared();

        let record = state.lock().presence_record();
        if let Err(e) = self.bus.track(&channel, record).await {
            log::warn!("Initial presence on {channel} failed: {e}");
        }

        log::info!(
            "{} entered session {} as {}",
            self.identity.display_name,
            session.join_code,
            if session.creator_id == user_id { "creator" } else { "guest" }
        );
        Ok(SessionHandle::start(
            session,
            channel,
            subscription,
            self.bus.clone(),
            self.store.clone(),
            state,
            &self.config,
        ))
    }
}

/// A live session. Obtained from `SessionLifecycle::create` / `join`.
pub struct SessionHandle {
    session_id: Uuid,
    join_code: String,
    creator_id: Uuid,
    user_id: Uuid,
    channel: String,
    bus: Arc<dyn Bus>,
    store: Arc<dyn SessionStore>,
    state: SharedState,
    debouncer: PersistenceDebouncer,
    throttler: CursorThrottler,
    heartbeat: HeartbeatLoop,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

impl SessionHandle {
    fn start(
        session: Session,
        channel: String,
        subscription: Subscription,
        bus: Arc<dyn Bus>,
        store: Arc<dyn SessionStore>,
        state: SharedState,
        config: &SyncConfig,
    ) -> Self {
        let user_id = state.lock().identity.user_id;
        let debouncer = PersistenceDebouncer::new(config.debounce_window, session.id, store.clone(), state.clone());
        let throttler = CursorThrottler::new(config.cursor_interval, channel.clone(), bus.clone(), state.clone());
        let heartbeat = HeartbeatLoop::start(config.heartbeat_interval, channel.clone(), bus.clone(), state.clone());

        let pump = EventPump {
            user_id,
            channel: channel.clone(),
            bus: bus.clone(),
            state: state.clone(),
            backoff: config.reconnect.clone(),
        };
        let pump = tokio::spawn(pump.run(subscription));

        Self {
            session_id: session.id,
            join_code: session.join_code,
            creator_id: session.creator_id,
            user_id,
            channel,
            bus,
            store,
            state,
            debouncer,
            throttler,
            heartbeat,
            pump: Some(pump),
            closed: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn join_code(&self) -> &str {
        &self.join_code
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn creator_id(&self) -> Uuid {
        self.creator_id
    }

    pub fn is_creator(&self) -> bool {
        self.creator_id == self.user_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase.clone()
    }

    pub fn document(&self) -> DocumentState {
        self.state.lock().propagator.document().clone()
    }

    pub fn content(&self) -> String {
        self.state.lock().propagator.document().content.clone()
    }

    pub fn language(&self) -> Language {
        self.state.lock().propagator.document().language
    }

    /// Everyone present, this user included, ordered by display name.
    pub fn participants(&self) -> Vec<Participant> {
        self.state.lock().presence.participants()
    }

    pub fn participant(&self, user_id: Uuid) -> Option<Participant> {
        self.state.lock().presence.participant(&user_id).cloned()
    }

    pub fn last_cursor(&self) -> Option<CursorPosition> {
        self.state.lock().last_cursor
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state.lock();
        SessionStats {
            echoes_discarded: state.stats.echoes_discarded + state.propagator.echoes_discarded(),
            ..state.stats
        }
    }

    /// Whether a durable write is scheduled but has not happened yet.
    pub fn has_pending_write(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Replace the document with `content` and share it.
    pub async fn edit_document(&mut self, content: impl Into<String>) -> Result<(), SyncError> {
        self.apply_local(Edit::Document(content.into())).await
    }

    pub async fn set_language(&mut self, language: Language) -> Result<(), SyncError> {
        self.apply_local(Edit::Language(language)).await
    }

    /// Feed a raw pointer sample; broadcasts are throttled.
    pub fn move_cursor(&mut self, position: CursorPosition) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.throttler.sample(position);
        Ok(())
    }

    /// Run the current document in `sandbox` and wait for a terminal status.
    pub async fn execute(
        &self,
        sandbox: &dyn ExecutionSandbox,
        policy: &PollPolicy,
    ) -> Result<ExecutionReport, SyncError> {
        self.ensure_open()?;
        let document = self.document();
        exec::run_to_completion(sandbox, &document.content, document.language, policy).await
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed {
            Err(SyncError::NotInSession)
        } else {
            Ok(())
        }
    }

    async fn apply_local(&mut self, edit: Edit) -> Result<(), SyncError> {
        self.ensure_open()?;
        let effects = self.state.lock().propagator.ingest(Mutation::LocalEdit(edit));
        for effect in effects {
            match effect {
                Effect::Publish(message) => self.publish(&message).await,
                Effect::SchedulePersist => self.debouncer.schedule(),
                Effect::PersistLanguage(language) => self.persist_language(language).await,
            }
        }
        Ok(())
    }

    async fn publish(&self, message: &BroadcastMessage) {
        match self.bus.publish(&self.channel, message).await {
            Ok(()) => self.state.lock().stats.broadcasts_sent += 1,
            Err(e) => log::warn!("Broadcast of {} on {} failed: {e}", message.event_name(), self.channel),
        }
    }

    async fn persist_language(&self, language: Language) {
        let result = self.store.persist_language(self.session_id, language).await;
        let mut state = self.state.lock();
        match result {
            Ok(()) => state.stats.durable_writes += 1,
            Err(e) => {
                state.stats.failed_writes += 1;
                log::warn!("Failed to persist language {language} for {}: {e}", self.join_code);
            }
        }
    }

    /// Stop all background work and unsubscribe. Idempotent.
    pub(crate) async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        {
            let mut state = self.state.lock();
            state.active = false;
            state.phase = SessionPhase::Leaving;
        }

        self.debouncer.cancel().await;
        self.throttler.cancel().await;
        self.heartbeat.stop().await;
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }

        if let Err(e) = self.bus.unsubscribe(&self.channel, self.user_id).await {
            log::warn!("Unsubscribe from {} failed: {e}", self.channel);
        }
        {
            let mut state = self.state.lock();
            state.phase = SessionPhase::Idle;
            state.presence.clear();
        }
        log::info!("Left session {}", self.join_code);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.state.lock().active = false;
            if let Some(pump) = self.pump.take() {
                pump.abort();
            }
        }
    }
}

/// Drains the bus subscription into session state and re-subscribes when
/// the bus drops it.
struct EventPump {
    user_id: Uuid,
    channel: String,
    bus: Arc<dyn Bus>,
    state: SharedState,
    backoff: BackoffPolicy,
}

impl EventPump {
    async fn run(self, mut subscription: Subscription) {
        loop {
            while let Some(event) = subscription.recv().await {
                self.dispatch(event);
            }
            if !self.state.lock().active {
                return;
            }
            match self.reconnect().await {
                Some(next) => subscription = next,
                None => return,
            }
        }
    }

    fn dispatch(&self, event: BusEvent) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        match event {
            BusEvent::PresenceSync(snapshot) => state.presence.apply_snapshot(snapshot),
            BusEvent::Broadcast(message) if message.origin_id() == self.user_id => {
                state.stats.echoes_discarded += 1;
                log::debug!("Discarded own {} echoed on {}", message.event_name(), self.channel);
            }
            BusEvent::Broadcast(BroadcastMessage::CursorUpdate { position, origin_id }) => {
                state.presence.apply_cursor(origin_id, position);
            }
            BusEvent::Broadcast(message) => {
                if let Some(mutation) = Mutation::from_broadcast(message) {
                    let effects = state.propagator.ingest(mutation);
                    debug_assert!(effects.is_empty(), "remote mutations must not produce effects");
                    state.stats.remote_updates_applied += 1;
                }
            }
        }
    }

    /// Re-subscribe with exponential backoff. `None` once attempts run out.
    async fn reconnect(&self) -> Option<Subscription> {
        for attempt in 1..=self.backoff.max_attempts {
            self.state.lock().phase = SessionPhase::Reconnecting { attempt };
            let delay = self.backoff.delay_for(attempt);
            log::warn!("Lost {}; reconnect attempt {attempt} in {delay:?}", self.channel);
            tokio::time::sleep(delay).await;

            match self.bus.subscribe(&self.channel, self.user_id).await {
                Ok(subscription) => {
                    let record = self.state.lock().presence_record();
                    if let Err(e) = self.bus.track(&self.channel, record).await {
                        log::warn!("Presence after reconnect on {} failed: {e}", self.channel);
                    }
                    {
                        let mut state = self.state.lock();
                        state.phase = SessionPhase::Active;
                        state.stats.reconnects += 1;
                    }
                    log::info!("Reconnected to {} after {attempt} attempt(s)", self.channel);
                    return Some(subscription);
                }
                Err(e) => log::warn!("Reconnect attempt {attempt} on {} failed: {e}", self.channel),
            }
        }

        let attempts = self.backoff.max_attempts;
        self.state.lock().phase = SessionPhase::Failed(FailureReason::BusUnavailable { attempts });
        log::error!("Giving up on {} after {attempts} reconnect attempts", self.channel);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn lifecycle(name: &str, bus: &MemoryBus, store: &MemoryStore) -> SessionLifecycle {
        SessionLifecycle::new(
            Identity::new(Uuid::new_v4(), name),
            Arc::new(bus.clone()),
            Arc::new(store.clone()),
            SyncConfig::for_testing(),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_enters_active() {
        let (bus, store) = (MemoryBus::default(), MemoryStore::new());
        let mut alice = lifecycle("alice", &bus, &store);
        assert_eq!(alice.phase(), SessionPhase::Idle);

        let handle = alice.create(Language::Python).await.unwrap();
        assert!(handle.is_creator());
        assert_eq!(handle.language(), Language::Python);
        assert_eq!(handle.content(), "");
        assert!(join_code::is_valid(handle.join_code()));
        let session_id = handle.session_id();

        assert_eq!(alice.phase(), SessionPhase::Active);
        assert_eq!(store.participants(session_id).await, vec![alice.identity().user_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_entry_rejected() {
        let (bus, store) = (MemoryBus::default(), MemoryStore::new());
        let mut alice = lifecycle("alice", &bus, &store);
        alice.create(Language::Cpp).await.unwrap();
        let err = alice.create(Language::Cpp).await.err().unwrap();
        assert!(matches!(err, SyncError::AlreadyInSession));
        let err = alice.join("ABCDEF").await.err().unwrap();
        assert!(matches!(err, SyncError::AlreadyInSession));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_code_stays_idle() {
        let (bus, store) = (MemoryBus::default(), MemoryStore::new());
        let mut bob = lifecycle("bob", &bus, &store);
        let err = bob.join("   ").await.err().unwrap();
        assert!(matches!(err, SyncError::InvalidJoinCode(_)));
        assert_eq!(bob.phase(), SessionPhase::Idle);
        assert!(bob.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_is_idempotent() {
        let (bus, store) = (MemoryBus::default(), MemoryStore::new());
        let mut alice = lifecycle("alice", &bus, &store);
        alice.leave().await;
        alice.create(Language::Cpp).await.unwrap();
        alice.leave().await;
        alice.leave().await;
        assert_eq!(alice.phase(), SessionPhase::Idle);
        assert_eq!(bus.channel_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_loads_snapshot() {
        let (bus, store) = (MemoryBus::default(), MemoryStore::new());
        let mut alice = lifecycle("alice", &bus, &store);
        let handle = alice.create(Language::Java).await.unwrap();
        let (session_id, code) = (handle.session_id(), handle.join_code().to_string());
        store.persist_document(session_id, "class Main {}", 1).await.unwrap();

        let mut bob = lifecycle("bob", &bus, &store);
        let handle = bob.join(&code.to_lowercase()).await.unwrap();
        assert_eq!(handle.content(), "class Main {}");
        assert_eq!(handle.language(), Language::Java);
        assert!(!handle.is_creator());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_bus_drop() {
        let (bus, store) = (MemoryBus::default(), MemoryStore::new());
        let mut alice = lifecycle("alice", &bus, &store);
        alice.create(Language::Cpp).await.unwrap();

        bus.disconnect_all().await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(alice.phase(), SessionPhase::Active);
        let handle = alice.session().unwrap();
        assert_eq!(handle.stats().reconnects, 1);
        assert_eq!(bus.subscriber_count(handle.channel()).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_when_bus_stays_down() {
        let (bus, store) = (MemoryBus::default(), MemoryStore::new());
        let mut alice = lifecycle("alice", &bus, &store);
        alice.create(Language::Cpp).await.unwrap();

        bus.set_offline(true);
        bus.disconnect_all().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            alice.phase(),
            SessionPhase::Failed(FailureReason::BusUnavailable { attempts: 3 })
        );

        // A failed session can be left, or replaced by a new one.
        bus.set_offline(false);
        alice.create(Language::C).await.unwrap();
        assert_eq!(alice.phase(), SessionPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscribe_records_no_participant() {
        let (bus, store) = (MemoryBus::default(), MemoryStore::new());
        let mut alice = lifecycle("alice", &bus, &store);
        let handle = alice.create(Language::Cpp).await.unwrap();
        let (session_id, code) = (handle.session_id(), handle.join_code().to_string());

        bus.set_offline(true);
        let mut bob = lifecycle("bob", &bus, &store);
        let err = bob.join(&code).await.err().unwrap();
        assert!(matches!(err, SyncError::TransientBus(_)));
        assert_eq!(bob.phase(), SessionPhase::Idle);
        assert_eq!(store.participants(session_id).await, vec![alice.identity().user_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_handle_rejects_edits() {
        let (bus, store) = (MemoryBus::default(), MemoryStore::new());
        let mut alice = lifecycle("alice", &bus, &store);
        let handle = alice.create(Language::Cpp).await.unwrap();
        handle.close().await;
        assert!(matches!(handle.edit_document("x").await, Err(SyncError::NotInSession)));
        assert!(matches!(
            handle.move_cursor(CursorPosition::new(0.0, 0.0)),
            Err(SyncError::NotInSession)
        ));
    }
}
