//! Periodic presence refresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bus::Bus;
use crate::config::MIN_TIMER_PERIOD;
use crate::session::SessionPhase;
use crate::state::SharedState;

/// Re-tracks the local presence record every interval while the session is
/// connected, so the bus keeps it alive and `last_seen` stays fresh.
pub struct HeartbeatLoop {
    task: Option<JoinHandle<()>>,
}

impl HeartbeatLoop {
    pub(crate) fn start(interval: Duration, channel: String, bus: Arc<dyn Bus>, state: SharedState) -> Self {
        let interval = interval.max(MIN_TIMER_PERIOD);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let record = {
                    let state = state.lock();
                    if !state.active {
                        break;
                    }
                    // The reconnect path re-tracks on its own.
                    if state.phase != SessionPhase::Active {
                        continue;
                    }
                    state.presence_record()
                };
                match bus.track(&channel, record).await {
                    Ok(()) => {
                        state.lock().stats.heartbeats += 1;
                        log::trace!("Heartbeat on {channel}");
                    }
                    Err(e) => log::warn!("Heartbeat on {channel} failed: {e}"),
                }
            }
        });
        Self { task: Some(task) }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for HeartbeatLoop {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
