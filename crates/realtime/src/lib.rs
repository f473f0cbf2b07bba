//! Realtime notification channel
//!
//! Keeps one logical push channel open to the notification producer. The
//! channel authenticates with the current access token, pings to stay alive,
//! and reconnects with capped exponential backoff after abnormal closures.
//! Inbound frames are turned into typed, deduplicated events.
//!
//! Connection lifecycle:
//! 1. `ConnectionManager::open()` → `Connecting` (10s watchdog)
//! 2. Link established → `Open`, auth frame sent, keepalive started
//! 3. Abnormal close → `Reconnecting` after `min(base * 2^attempt, cap)`
//! 4. `max_attempts` consecutive failures → `Failed` (manual reconnect only)
//! 5. Normal close or `teardown()` → `Closed`, no retry

pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod manager;
pub mod state;

pub use connector::{ConnectFuture, Connector, Inbound, Link, Outbound, Remote, WsConnector};
pub use dispatcher::{DEFAULT_DEDUP_CAPACITY, EventDispatcher, Notification, RealtimeEvent};
pub use error::{Error, Result};
pub use frame::{ClientFrame, InboundFrame, parse_inbound};
pub use manager::{ConnectionConfig, ConnectionManager};
pub use state::{
    ABNORMAL_CLOSURE, Backoff, ConnectionAction, ConnectionEvent, ConnectionState,
    NORMAL_CLOSURE, handle_event,
};
