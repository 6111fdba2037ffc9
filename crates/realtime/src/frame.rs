//! Realtime wire frames
//!
//! Every frame on the socket is a JSON object `{"event": name, "data": value}`.
//! Server frames either drive the authentication handshake or carry
//! application messages, which are normalized into `RealtimeMessage`
//! envelopes before dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Message type that alert frames are normalized to.
pub const NOTIFICATION: &str = "NOTIFICATION";

/// Application message delivered to dispatcher listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl RealtimeMessage {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decoded server → client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Authenticated { success: bool },
    AuthenticationError(String),
    Messages(Vec<RealtimeMessage>),
    /// Event name this client does not handle.
    Unknown(String),
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Authenticate { user_id: String },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        let frame = match self {
            ClientFrame::Authenticate { user_id } => WireFrame {
                event: "authenticate".into(),
                data: serde_json::json!({ "userId": user_id }),
            },
        };
        // WireFrame holds only strings and JSON values
        serde_json::to_string(&frame).unwrap_or_default()
    }
}

/// Decode one text frame from the server.
pub fn parse_server_frame(text: &str) -> Result<ServerFrame> {
    let frame: WireFrame =
        serde_json::from_str(text).map_err(|e| Error::MalformedFrame(format!("not a frame: {e}")))?;
    let data = frame.data;

    match frame.event.as_str() {
        "authenticated" => {
            // Bare `authenticated` with no body is a success
            let success = match &data {
                serde_json::Value::Null => true,
                serde_json::Value::Bool(b) => *b,
                other => other.get("success").and_then(|s| s.as_bool()).unwrap_or(false),
            };
            Ok(ServerFrame::Authenticated { success })
        }
        "authentication_error" => {
            let reason = match &data {
                serde_json::Value::String(s) => s.clone(),
                other => other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            Ok(ServerFrame::AuthenticationError(reason))
        }
        "message" => {
            let message: RealtimeMessage = serde_json::from_value(data)
                .map_err(|e| Error::MalformedFrame(format!("message envelope: {e}")))?;
            Ok(ServerFrame::Messages(vec![message]))
        }
        "new_alert" => Ok(ServerFrame::Messages(vec![RealtimeMessage::new(NOTIFICATION, data)])),
        "pending_alerts" => match data {
            serde_json::Value::Array(alerts) => Ok(ServerFrame::Messages(
                alerts
                    .into_iter()
                    .map(|alert| RealtimeMessage::new(NOTIFICATION, alert))
                    .collect(),
            )),
            other => Err(Error::MalformedFrame(format!(
                "pending_alerts payload is not an array: {other}"
            ))),
        },
        other => Ok(ServerFrame::Unknown(other.to_string())),
    }
}
