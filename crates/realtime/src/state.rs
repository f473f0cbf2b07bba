//! Connection state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The connection driver in `manager.rs` executes the I/O implied by each
//! action and owns every timer.

use std::time::Duration;

/// Normal closure: the peer is done, do not reconnect
pub const NORMAL_CLOSURE: u16 = 1000;

/// Connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close frame received without a status code
pub const NO_STATUS: u16 = 1005;

/// Message shown once reconnection has been abandoned
pub const FAILURE_MESSAGE: &str = "Connection failed. Please refresh the page.";

/// Reconnect delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl Backoff {
    /// Delay before reconnecting after `attempt` prior failures:
    /// `min(base * 2^attempt, cap)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Channel states.
///
/// `attempt` counts consecutive failures since the channel was last open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never opened
    Idle,
    /// Link requested, watchdog armed
    Connecting { attempt: u32 },
    /// Authenticated and pinging
    Open,
    /// Waiting out the backoff delay
    Reconnecting {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// Closed normally or torn down
    Closed,
    /// Gave up after `max_attempts` failures
    Failed { error: String },
}

impl ConnectionState {
    /// State label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed { .. } => "failed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// User-visible error, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            ConnectionState::Reconnecting { error, .. } | ConnectionState::Failed { error } => {
                Some(error.as_str())
            }
            _ => None,
        }
    }
}

/// Events that drive state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller asked to open (or re-open) the channel
    Open,
    /// Caller asked to reconnect now, forgetting past failures
    ManualReconnect,
    /// Link established
    Opened,
    /// Link closed by the peer or the network
    Closed { code: u16, reason: String },
    /// Link could not be established
    ConnectFailed(String),
    /// Watchdog fired before the link opened
    ConnectTimeout,
    /// Backoff delay elapsed
    RetryTimer,
    /// Caller is done with the channel
    Teardown,
}

/// Actions the driver should execute after a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Drop any existing link and open a new one
    Connect,
    /// Send the auth frame and start the keepalive
    Authenticate,
    /// Arm the retry timer
    ScheduleRetry { delay: Duration },
    /// Surface the terminal error
    ReportFailure { error: String },
    /// Close the link with a normal closure
    Disconnect,
    /// No-op
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: ConnectionState,
    event: ConnectionEvent,
    backoff: &Backoff,
) -> (ConnectionState, ConnectionAction) {
    match (state, event) {
        // --- Teardown wins everywhere ---
        (ConnectionState::Closed, ConnectionEvent::Teardown) => {
            (ConnectionState::Closed, ConnectionAction::None)
        }
        (ConnectionState::Idle, ConnectionEvent::Teardown) => {
            (ConnectionState::Closed, ConnectionAction::None)
        }
        (_, ConnectionEvent::Teardown) => (ConnectionState::Closed, ConnectionAction::Disconnect),

        // --- Opening ---
        // Nothing to reconnect to before the first open
        (ConnectionState::Idle, ConnectionEvent::ManualReconnect) => {
            (ConnectionState::Idle, ConnectionAction::None)
        }
        (_, ConnectionEvent::Open | ConnectionEvent::ManualReconnect) => (
            ConnectionState::Connecting { attempt: 0 },
            ConnectionAction::Connect,
        ),

        // --- Connecting ---
        (ConnectionState::Connecting { .. }, ConnectionEvent::Opened) => {
            (ConnectionState::Open, ConnectionAction::Authenticate)
        }
        (ConnectionState::Connecting { attempt }, ConnectionEvent::ConnectFailed(error)) => {
            retry(attempt, error, backoff)
        }
        (ConnectionState::Connecting { attempt }, ConnectionEvent::ConnectTimeout) => {
            retry(attempt, "connection timeout".into(), backoff)
        }

        // --- Open ---
        (ConnectionState::Open, ConnectionEvent::Closed { code, .. }) if code == NORMAL_CLOSURE => {
            (ConnectionState::Closed, ConnectionAction::None)
        }
        (ConnectionState::Open, ConnectionEvent::Closed { code, reason }) => {
            let error = if reason.is_empty() {
                format!("connection closed ({code})")
            } else {
                format!("connection closed ({code}): {reason}")
            };
            retry(0, error, backoff)
        }

        // --- Reconnecting ---
        (ConnectionState::Reconnecting { attempt, .. }, ConnectionEvent::RetryTimer) => (
            ConnectionState::Connecting { attempt },
            ConnectionAction::Connect,
        ),

        // --- Stale or unhandled: stay in current state ---
        (state, _event) => (state, ConnectionAction::None),
    }
}

/// Count one more failure after `attempt` prior ones.
fn retry(attempt: u32, error: String, backoff: &Backoff) -> (ConnectionState, ConnectionAction) {
    let failures = attempt.saturating_add(1);
    if failures >= backoff.max_attempts {
        return (
            ConnectionState::Failed {
                error: FAILURE_MESSAGE.into(),
            },
            ConnectionAction::ReportFailure { error },
        );
    }

    let delay = backoff.delay(attempt);
    (
        ConnectionState::Reconnecting {
            attempt: failures,
            delay,
            error,
        },
        ConnectionAction::ScheduleRetry { delay },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(code: u16) -> ConnectionEvent {
        ConnectionEvent::Closed {
            code,
            reason: String::new(),
        }
    }

    #[test]
    fn backoff_sequence_is_capped() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (0..5).map(|a| backoff.delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![5000, 10000, 20000, 30000, 30000]);
    }

    #[test]
    fn backoff_never_overflows() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(40), backoff.cap);
        assert_eq!(backoff.delay(u32::MAX), backoff.cap);
    }

    #[test]
    fn scheduled_delays_follow_backoff() {
        let backoff = Backoff {
            max_attempts: 6,
            ..Backoff::default()
        };
        let (mut state, action) =
            handle_event(ConnectionState::Open, closed(ABNORMAL_CLOSURE), &backoff);
        let mut delays = vec![];
        let mut action = action;

        while let ConnectionAction::ScheduleRetry { delay } = action {
            delays.push(delay.as_millis() as u64);
            let (connecting, _) = handle_event(state, ConnectionEvent::RetryTimer, &backoff);
            (state, action) = handle_event(
                connecting,
                ConnectionEvent::ConnectFailed("refused".into()),
                &backoff,
            );
        }

        assert_eq!(delays, vec![5000, 10000, 20000, 30000, 30000]);
        assert!(matches!(state, ConnectionState::Failed { .. }));
        assert!(matches!(action, ConnectionAction::ReportFailure { .. }));
    }

    #[test]
    fn open_connects_then_authenticates() {
        let backoff = Backoff::default();
        let (state, action) = handle_event(ConnectionState::Idle, ConnectionEvent::Open, &backoff);
        assert_eq!(state, ConnectionState::Connecting { attempt: 0 });
        assert_eq!(action, ConnectionAction::Connect);

        let (state, action) = handle_event(state, ConnectionEvent::Opened, &backoff);
        assert_eq!(state, ConnectionState::Open);
        assert_eq!(action, ConnectionAction::Authenticate);
    }

    #[test]
    fn normal_closure_does_not_retry() {
        let (state, action) =
            handle_event(ConnectionState::Open, closed(NORMAL_CLOSURE), &Backoff::default());
        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(action, ConnectionAction::None);
    }

    #[test]
    fn abnormal_closure_schedules_base_delay() {
        let (state, action) =
            handle_event(ConnectionState::Open, closed(ABNORMAL_CLOSURE), &Backoff::default());
        assert!(matches!(
            state,
            ConnectionState::Reconnecting { attempt: 1, .. }
        ));
        assert_eq!(
            action,
            ConnectionAction::ScheduleRetry {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(state.error(), Some("connection closed (1006)"));
    }

    #[test]
    fn three_consecutive_failures_end_in_failed() {
        let backoff = Backoff::default();
        let mut state = ConnectionState::Idle;
        let mut delays = vec![];

        (state, _) = handle_event(state, ConnectionEvent::Open, &backoff);
        for _ in 0..3 {
            let (next, action) = handle_event(
                state,
                ConnectionEvent::ConnectFailed("closed (1006)".into()),
                &backoff,
            );
            state = next;
            match action {
                ConnectionAction::ScheduleRetry { delay } => {
                    delays.push(delay);
                    (state, _) = handle_event(state, ConnectionEvent::RetryTimer, &backoff);
                }
                ConnectionAction::ReportFailure { .. } => break,
                other => panic!("unexpected action {other:?}"),
            }
        }

        assert_eq!(delays, vec![Duration::from_secs(5), Duration::from_secs(10)]);
        assert_eq!(
            state,
            ConnectionState::Failed {
                error: FAILURE_MESSAGE.into()
            }
        );

        // No further attempt on its own
        let (state, action) = handle_event(state, ConnectionEvent::RetryTimer, &backoff);
        assert!(matches!(state, ConnectionState::Failed { .. }));
        assert_eq!(action, ConnectionAction::None);
    }

    #[test]
    fn watchdog_counts_as_failure() {
        let (state, action) = handle_event(
            ConnectionState::Connecting { attempt: 0 },
            ConnectionEvent::ConnectTimeout,
            &Backoff::default(),
        );
        assert_eq!(state.error(), Some("connection timeout"));
        assert!(matches!(action, ConnectionAction::ScheduleRetry { .. }));
    }

    #[test]
    fn single_attempt_budget_fails_immediately() {
        let backoff = Backoff {
            max_attempts: 1,
            ..Backoff::default()
        };
        let (state, _) = handle_event(ConnectionState::Open, closed(ABNORMAL_CLOSURE), &backoff);
        assert!(matches!(state, ConnectionState::Failed { .. }));
    }

    #[test]
    fn teardown_disconnects_once() {
        let backoff = Backoff::default();
        let (state, action) = handle_event(ConnectionState::Open, ConnectionEvent::Teardown, &backoff);
        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(action, ConnectionAction::Disconnect);

        let (state, action) = handle_event(state, ConnectionEvent::Teardown, &backoff);
        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(action, ConnectionAction::None);
    }

    #[test]
    fn teardown_cancels_pending_retry() {
        let backoff = Backoff::default();
        let reconnecting = ConnectionState::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(5),
            error: "connection closed (1006)".into(),
        };
        let (state, _) = handle_event(reconnecting, ConnectionEvent::Teardown, &backoff);
        let (state, action) = handle_event(state, ConnectionEvent::RetryTimer, &backoff);
        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(action, ConnectionAction::None);
    }

    #[test]
    fn manual_reconnect_resets_attempts() {
        let backoff = Backoff::default();
        let failed = ConnectionState::Failed {
            error: FAILURE_MESSAGE.into(),
        };
        let (state, action) = handle_event(failed, ConnectionEvent::ManualReconnect, &backoff);
        assert_eq!(state, ConnectionState::Connecting { attempt: 0 });
        assert_eq!(action, ConnectionAction::Connect);

        let (state, action) =
            handle_event(ConnectionState::Idle, ConnectionEvent::ManualReconnect, &backoff);
        assert_eq!(state, ConnectionState::Idle);
        assert_eq!(action, ConnectionAction::None);
    }

    #[test]
    fn stale_events_are_ignored() {
        let backoff = Backoff::default();
        let (state, action) = handle_event(ConnectionState::Closed, ConnectionEvent::Opened, &backoff);
        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(action, ConnectionAction::None);

        let (state, action) = handle_event(ConnectionState::Open, ConnectionEvent::ConnectTimeout, &backoff);
        assert_eq!(state, ConnectionState::Open);
        assert_eq!(action, ConnectionAction::None);
    }
}
