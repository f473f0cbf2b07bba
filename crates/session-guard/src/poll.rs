//! Background expiry poll
//!
//! Ticks the guard every `interval` so an authenticated session refreshes its
//! access token before it lapses. Ticks are no-ops unless the session is
//! authenticated.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::guard::{SessionGuard, SessionState};

/// Owns the poll task; dropping it stops the poll.
pub struct PollHandle {
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Stop the poll.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the expiry poll for `guard`.
pub fn spawn_expiry_poll(guard: Arc<SessionGuard>, interval: Duration) -> PollHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick, the session was just authenticated
        ticker.tick().await;

        let mut was_authenticated = guard.state().is_authenticated();
        loop {
            ticker.tick().await;
            let state = guard.tick().await;
            debug!(state = state.label(), "session poll tick");

            if was_authenticated && state == SessionState::Unauthenticated {
                info!("session ended, expiry poll idle until next authentication");
            }
            was_authenticated = state.is_authenticated();
        }
    });

    PollHandle { task }
}
