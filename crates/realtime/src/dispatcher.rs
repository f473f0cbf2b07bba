//! Inbound event dispatch with deduplication
//!
//! Frames are classified into `RealtimeEvent`s and forwarded in arrival
//! order. Frames carrying an identifier (`notification_id`, `id` or
//! `event_id`) are remembered in a small ordered buffer; a repeat of a
//! remembered id is dropped. Reconnects replay the unread batch, so the
//! buffer is what keeps consumers from seeing the same notification twice.

use std::collections::VecDeque;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Number of recent event ids remembered for deduplication
pub const DEFAULT_DEDUP_CAPACITY: usize = 100;

/// A notification as emitted by the producer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Notification {
    #[serde(default, alias = "notification_id", deserialize_with = "opaque_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "notification_text")]
    pub text: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub related_model_id: Option<Value>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Typed inbound events.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// Unread notification count
    NotificationCount { count: u64 },
    Notification(Notification),
    /// Server accepted the auth frame
    Authenticated,
    ServerError { message: String },
    /// Anything else, passed through untouched
    Other(Value),
}

impl RealtimeEvent {
    /// Label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeEvent::NotificationCount { .. } => "notification_count",
            RealtimeEvent::Notification(_) => "notification",
            RealtimeEvent::Authenticated => "authenticated",
            RealtimeEvent::ServerError { .. } => "server_error",
            RealtimeEvent::Other(_) => "other",
        }
    }
}

/// Turns inbound frames into deduplicated events on a channel.
pub struct EventDispatcher {
    seen: VecDeque<String>,
    capacity: usize,
    events: mpsc::UnboundedSender<RealtimeEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher remembering up to `capacity` ids, and the
    /// receiving end of its event channel.
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<RealtimeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            seen: VecDeque::with_capacity(capacity),
            capacity,
            events,
        };
        (dispatcher, rx)
    }

    /// Dispatch one server frame. Returns how many events were forwarded.
    ///
    /// `{"notifications": [...]}` batches are split and each element is
    /// deduplicated on its own.
    pub fn dispatch(&mut self, frame: Value) -> usize {
        match frame {
            Value::Object(mut map) if map.get("notifications").is_some_and(Value::is_array) => {
                let Some(Value::Array(items)) = map.remove("notifications") else {
                    return 0;
                };
                let mut forwarded = 0;
                for item in items {
                    if !self.accept(&item) {
                        continue;
                    }
                    if let Some(n) = notification(item) {
                        forwarded += usize::from(self.forward(RealtimeEvent::Notification(n)));
                    }
                }
                forwarded
            }
            frame => {
                if !self.accept(&frame) {
                    return 0;
                }
                usize::from(self.forward(classify(frame)))
            }
        }
    }

    /// Record the frame's id; `false` if it was already seen.
    fn accept(&mut self, frame: &Value) -> bool {
        let Some(id) = event_id(frame) else {
            return true;
        };
        if self.seen.contains(&id) {
            debug!(event_id = %id, "duplicate event dropped");
            metrics::counter!("realtime_duplicates_total").increment(1);
            return false;
        }
        if self.capacity == 0 {
            return true;
        }
        if self.seen.len() == self.capacity {
            self.seen.pop_front();
        }
        self.seen.push_back(id);
        true
    }

    fn forward(&self, event: RealtimeEvent) -> bool {
        let kind = event.kind();
        trace!(kind, "dispatching event");
        metrics::counter!("realtime_events_total", "kind" => kind).increment(1);
        self.events.send(event).is_ok()
    }
}

fn event_id(frame: &Value) -> Option<String> {
    ["notification_id", "id", "event_id"]
        .iter()
        .find_map(|key| frame.get(*key).and_then(id_string))
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn opaque_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_string))
}

fn notification(frame: Value) -> Option<Notification> {
    match serde_json::from_value(frame) {
        Ok(notification) => Some(notification),
        Err(e) => {
            debug!(error = %e, "unreadable notification dropped");
            None
        }
    }
}

fn classify(frame: Value) -> RealtimeEvent {
    if let Some(count) = frame.get("notifications_count").and_then(Value::as_u64) {
        return RealtimeEvent::NotificationCount { count };
    }
    if frame.get("message").and_then(Value::as_str) == Some("Authenticated") {
        return RealtimeEvent::Authenticated;
    }
    if let Some(error) = frame.get("error") {
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return RealtimeEvent::ServerError { message };
    }
    if frame.get("notification_id").is_some() {
        if let Some(notification) = notification(frame.clone()) {
            return RealtimeEvent::Notification(notification);
        }
    }
    RealtimeEvent::Other(frame)
}
