//! Wire frames for the realtime channel
//!
//! Client frames use internally-tagged JSON (`{"type": "auth", ...}`).
//! Server frames are untyped JSON objects; only `{"type": "pong"}` is
//! interpreted here, everything else goes to the dispatcher.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Frames sent to the notification producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Sent once per open link
    Auth {
        token: String,
        /// Unix milliseconds
        timestamp: u64,
        #[serde(rename = "clientId")]
        client_id: String,
    },
    /// Keepalive; the server answers with `pong`
    Ping {},
}

/// A parsed server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Pong,
    Payload(Value),
}

/// Parse one text frame from the server.
pub fn parse_inbound(text: &str) -> Result<InboundFrame> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| Error::MalformedFrame(e.to_string()))?;
    if !value.is_object() {
        return Err(Error::MalformedFrame(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    }
    if value.get("type").and_then(Value::as_str) == Some("pong") {
        return Ok(InboundFrame::Pong);
    }
    Ok(InboundFrame::Payload(value))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
