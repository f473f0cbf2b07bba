//! Connection manager and driver task
//!
//! `ConnectionManager` is the handle callers hold. It forwards commands to a
//! driver task that owns the link, the pending connect, and every timer
//! (connect watchdog, keepalive, retry). The driver feeds events through
//! `state::handle_event` and executes the resulting actions.
//!
//! Timer discipline is re-applied after every transition: the watchdog and
//! pending connect only exist while `Connecting`, the keepalive and link only
//! while `Open`, the retry timer only while `Reconnecting`. A stale timer or
//! link can therefore never act on a newer connection.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use session_auth::CredentialStore;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};
use url::Url;

use crate::connector::{ConnectFuture, Connector, Inbound, Link, Outbound};
use crate::dispatcher::EventDispatcher;
use crate::error::{Error, Result};
use crate::frame::{ClientFrame, InboundFrame, parse_inbound};
use crate::state::{
    ABNORMAL_CLOSURE, Backoff, ConnectionAction, ConnectionEvent, ConnectionState,
    NORMAL_CLOSURE, handle_event,
};

/// Channel timing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Watchdog for a single connect attempt
    pub connect_timeout: Duration,
    /// Interval between keepalive pings while open
    pub keepalive_interval: Duration,
    pub backoff: Backoff,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            backoff: Backoff::default(),
        }
    }
}

enum Command {
    Open { url: Url, token: Option<String> },
    Send { text: String, reply: oneshot::Sender<bool> },
    ManualReconnect,
    Teardown,
}

/// Handle to the realtime channel.
///
/// Dropping the manager aborts the driver, which drops the link.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Start the driver task in `Idle`.
    ///
    /// When `credentials` is given, the token is re-read from it on every
    /// connect and auth frame; otherwise the token passed to `open()` is used.
    pub fn spawn(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        dispatcher: EventDispatcher,
        credentials: Option<Arc<CredentialStore>>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionState::Idle);

        let driver = Driver::new(config, connector, dispatcher, credentials, status_tx);
        let handle = tokio::spawn(driver.run(rx));

        Self {
            commands,
            status,
            driver: Mutex::new(Some(handle)),
        }
    }

    /// Open the channel, replacing any existing link.
    pub fn open(&self, url: Url, token: Option<String>) -> Result<()> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidUrl {
                url: url.to_string(),
                reason: "scheme must be ws or wss".into(),
            });
        }
        self.commands
            .send(Command::Open { url, token })
            .map_err(|_| Error::Shutdown)
    }

    /// Send a message on the open channel.
    ///
    /// Returns `false` unless the channel is open and the frame was handed
    /// to the transport.
    pub async fn send<T: Serialize>(&self, message: &T) -> bool {
        if !self.status.borrow().is_open() {
            return false;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound message");
                return false;
            }
        };
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Send { text, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Reconnect now, forgetting past failures.
    pub fn manual_reconnect(&self) {
        let _ = self.commands.send(Command::ManualReconnect);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().clone()
    }

    /// Follow connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Whether the driver is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Close with a normal closure, cancel every timer and stop the driver.
    ///
    /// Safe to call more than once.
    pub async fn teardown(&self) {
        let _ = self.commands.send(Command::Teardown);
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "connection driver ended abnormally");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}

struct Driver {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    dispatcher: EventDispatcher,
    credentials: Option<Arc<CredentialStore>>,
    status: watch::Sender<ConnectionState>,
    state: ConnectionState,
    url: Option<Url>,
    /// Token from `open()`, used when no credential store is attached
    token: Option<String>,
    client_id: String,
    link: Option<Link>,
    pending: Option<ConnectFuture>,
    watchdog: Option<Pin<Box<Sleep>>>,
    keepalive: Option<Interval>,
    retry: Option<Pin<Box<Sleep>>>,
}

impl Driver {
    fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        dispatcher: EventDispatcher,
        credentials: Option<Arc<CredentialStore>>,
        status: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            config,
            connector,
            dispatcher,
            credentials,
            status,
            state: ConnectionState::Idle,
            url: None,
            token: None,
            client_id: uuid::Uuid::new_v4().to_string(),
            link: None,
            pending: None,
            watchdog: None,
            keepalive: None,
            retry: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Teardown) | None => {
                        self.apply(ConnectionEvent::Teardown).await;
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                },
                result = connect_result(&mut self.pending) => {
                    self.pending = None;
                    match result {
                        Ok(link) => {
                            self.link = Some(link);
                            self.apply(ConnectionEvent::Opened).await;
                        }
                        Err(e) => {
                            debug!(error = %e, "connect attempt failed");
                            self.apply(ConnectionEvent::ConnectFailed(e.to_string())).await;
                        }
                    }
                }
                _ = expired(&mut self.watchdog) => {
                    warn!("connect attempt timed out");
                    self.pending = None;
                    self.apply(ConnectionEvent::ConnectTimeout).await;
                }
                inbound = next_inbound(&mut self.link) => match inbound {
                    Some(Inbound::Text(text)) => self.on_text(&text),
                    Some(Inbound::Closed { code, reason }) => {
                        self.link = None;
                        info!(code, reason = %reason, "realtime channel closed");
                        self.apply(ConnectionEvent::Closed { code, reason }).await;
                    }
                    None => {
                        self.link = None;
                        self.apply(ConnectionEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "transport dropped".into(),
                        })
                        .await;
                    }
                },
                _ = next_tick(&mut self.keepalive) => {
                    self.send_frame(&ClientFrame::Ping {});
                }
                _ = expired(&mut self.retry) => {
                    self.retry = None;
                    self.apply(ConnectionEvent::RetryTimer).await;
                }
            }
        }
        debug!("connection driver stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Open { url, token } => {
                self.url = Some(url);
                self.token = token;
                self.apply(ConnectionEvent::Open).await;
            }
            Command::Send { text, reply } => {
                let _ = reply.send(self.send_text(text));
            }
            Command::ManualReconnect => {
                info!("manual reconnect requested");
                self.apply(ConnectionEvent::ManualReconnect).await;
            }
            // Handled by the run loop
            Command::Teardown => {}
        }
    }

    async fn apply(&mut self, event: ConnectionEvent) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Idle);
        let (next, action) = handle_event(state, event, &self.config.backoff);
        self.state = next;
        self.status.send_replace(self.state.clone());

        match action {
            ConnectionAction::Connect => self.connect().await,
            ConnectionAction::Authenticate => self.authenticate().await,
            ConnectionAction::ScheduleRetry { delay } => {
                info!(
                    delay_ms = delay.as_millis() as u64,
                    error = self.state.error().unwrap_or_default(),
                    "reconnecting after delay"
                );
                metrics::counter!("realtime_reconnects_total").increment(1);
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            ConnectionAction::ReportFailure { error } => {
                warn!(error = %error, "realtime channel failed, giving up");
            }
            ConnectionAction::Disconnect => {
                if let Some(link) = self.link.take() {
                    link.close(NORMAL_CLOSURE, "client teardown");
                }
            }
            ConnectionAction::None => {}
        }

        self.enforce_timers();
    }

    fn enforce_timers(&mut self) {
        if !matches!(self.state, ConnectionState::Connecting { .. }) {
            self.pending = None;
            self.watchdog = None;
        }
        if !self.state.is_open() {
            self.keepalive = None;
            if let Some(link) = self.link.take() {
                link.close(NORMAL_CLOSURE, "connection superseded");
            }
        }
        if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            self.retry = None;
        }
    }

    // `&mut self`: the pending connect is not `Sync`, so `&self` across the await is not `Send`
    async fn current_token(&mut self) -> Option<String> {
        match &self.credentials {
            Some(store) => store.access_token().await,
            None => self.token.clone(),
        }
    }

    async fn connect(&mut self) {
        if let Some(link) = self.link.take() {
            link.close(NORMAL_CLOSURE, "new connection initializing");
        }
        let Some(mut url) = self.url.clone() else {
            return;
        };
        if let Some(token) = self.current_token().await {
            url.query_pairs_mut().append_pair("token", &token);
        }

        let attempt = match self.state {
            ConnectionState::Connecting { attempt } => attempt,
            _ => 0,
        };
        debug!(attempt, host = url.host_str().unwrap_or(""), "connecting realtime channel");
        metrics::counter!("realtime_connects_total").increment(1);

        self.pending = Some(self.connector.connect(url));
        self.watchdog = Some(Box::pin(tokio::time::sleep(self.config.connect_timeout)));
    }

    async fn authenticate(&mut self) {
        info!("realtime channel open");
        if let Some(token) = self.current_token().await {
            let frame = ClientFrame::Auth {
                token,
                timestamp: now_millis(),
                client_id: self.client_id.clone(),
            };
            self.send_frame(&frame);
        }

        let period = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.keepalive = Some(keepalive);
    }

    fn on_text(&mut self, text: &str) {
        match parse_inbound(text) {
            Ok(InboundFrame::Pong) => debug!("keepalive pong"),
            Ok(InboundFrame::Payload(value)) => {
                self.dispatcher.dispatch(value);
            }
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    fn send_frame(&self, frame: &ClientFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(error = %e, "failed to serialize frame");
                false
            }
        }
    }

    fn send_text(&self, text: String) -> bool {
        if !self.state.is_open() {
            return false;
        }
        match &self.link {
            Some(link) => link.outbound.send(Outbound::Text(text)).is_ok(),
            None => false,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

async fn connect_result(pending: &mut Option<ConnectFuture>) -> Result<Link> {
    match pending {
        Some(connect) => connect.await,
        None => std::future::pending().await,
    }
}

async fn expired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_inbound(link: &mut Option<Link>) -> Option<Inbound> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
