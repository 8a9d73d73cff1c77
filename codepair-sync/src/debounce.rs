//! Coalesces bursts of local edits into one durable write.
//!
//! ```text
//! edit ─┐ edit ─┐ edit ─┐
//!       ▼       ▼       ▼
//!     [timer] [timer] [timer]──── W ────► persist_document(current content)
//!        ✗       ✗
//! ```
//!
//! Each `schedule` cancels the pending timer and starts a new one. The write
//! reads the document when the timer fires, so it always persists the latest
//! content. Failures are logged and not retried; the next edit schedules a
//! fresh write.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::now_millis;
use crate::state::SharedState;
use crate::store::SessionStore;

pub struct PersistenceDebouncer {
    window: Duration,
    session_id: Uuid,
    store: Arc<dyn SessionStore>,
    state: SharedState,
    pending: Option<JoinHandle<()>>,
}

impl PersistenceDebouncer {
    pub(crate) fn new(
        window: Duration,
        session_id: Uuid,
        store: Arc<dyn SessionStore>,
        state: SharedState,
    ) -> Self {
        Self {
            window,
            session_id,
            store,
            state,
            pending: None,
        }
    }

    /// (Re)start the quiet-period timer.
    pub fn schedule(&mut self) {
        if let Some(previous) = self.pending.take() {
            previous.abort();
        }

        let window = self.window;
        let session_id = self.session_id;
        let store = self.store.clone();
        let state = self.state.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;

            let content = {
                let state = state.lock();
                if !state.active {
                    return;
                }
                state.propagator.document().content.clone()
            };

            let result = store.persist_document(session_id, &content, now_millis()).await;
            let mut state = state.lock();
            match result {
                Ok(()) => {
                    state.stats.durable_writes += 1;
                    log::debug!("Persisted session {session_id} ({} bytes)", content.len());
                }
                Err(e) => {
                    state.stats.failed_writes += 1;
                    log::warn!("Failed to persist session {session_id}: {e}");
                }
            }
        }));
    }

    /// Whether a write is scheduled or in flight.
    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Drop the pending write, waiting until its task has stopped.
    pub async fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for PersistenceDebouncer {
    fn drop(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}
