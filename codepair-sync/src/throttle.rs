//! Rate-limits cursor broadcasts to one per interval.
//!
//! Every pointer sample updates the local cursor immediately. The first
//! sample of a quiet period arms a timer; when it fires, the latest sample
//! is broadcast and the presence record refreshed. Samples that arrive
//! while the timer is armed only overwrite the local cursor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::protocol::{BroadcastMessage, CursorPosition};
use crate::state::SharedState;

pub struct CursorThrottler {
    interval: Duration,
    channel: String,
    bus: Arc<dyn Bus>,
    state: SharedState,
    armed: Arc<AtomicBool>,
    pending: Option<JoinHandle<()>>,
}

impl CursorThrottler {
    pub(crate) fn new(interval: Duration, channel: String, bus: Arc<dyn Bus>, state: SharedState) -> Self {
        Self {
            interval,
            channel,
            bus,
            state,
            armed: Arc::new(AtomicBool::new(false)),
            pending: None,
        }
    }

    /// Record a raw pointer sample.
    pub fn sample(&mut self, position: CursorPosition) {
        self.state.lock().last_cursor = Some(position);
        if self.armed.swap(true, Ordering::AcqRel) {
            return;
        }

        let interval = self.interval;
        let channel = self.channel.clone();
        let bus = self.bus.clone();
        let state = self.state.clone();
        let armed = self.armed.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;

            let flush = {
                let state = state.lock();
                match (state.active, state.last_cursor) {
                    (true, Some(position)) => Some((
                        BroadcastMessage::CursorUpdate {
                            position,
                            origin_id: state.identity.user_id,
                        },
                        state.presence_record(),
                    )),
                    _ => None,
                }
            };

            if let Some((message, record)) = flush {
                match bus.publish(&channel, &message).await {
                    Ok(()) => {
                        state.lock().stats.cursor_flushes += 1;
                    }
                    Err(e) => log::warn!("Cursor broadcast on {channel} failed: {e}"),
                }
                if let Err(e) = bus.track(&channel, record).await {
                    log::warn!("Presence refresh on {channel} failed: {e}");
                }
                log::trace!("Flushed cursor on {channel}");
            }
            armed.store(false, Ordering::Release);
        }));
    }

    /// Whether a flush is armed.
    pub fn is_pending(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub async fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
            let _ = task.await;
        }
        self.armed.store(false, Ordering::Release);
    }
}

impl Drop for CursorThrottler {
    fn drop(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}
