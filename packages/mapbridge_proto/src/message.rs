//! Relay message envelope.
//!
//! Every frame that the server or plugin interprets has the shape
//! `{"type": "...", "status": 200, "data": ...}`. Frames with unknown type
//! tags are never decoded by the relay; they are forwarded as raw bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATUS_OK: u16 = 200;
pub const STATUS_ERROR: u16 = 500;

/// Type tags with meaning to the server or plugin.
pub mod kinds {
    /// Plugin presence, sent to the application. Also the application's
    /// status query to the plugin.
    pub const PLUGIN_STATUS: &str = "PluginStatus";
    /// Application presence, sent to the plugin.
    pub const APP_STATUS: &str = "AppStatus";
    pub const PROJECT_FILES: &str = "ProjectFiles";
    pub const UPLOAD_FILES: &str = "UploadFiles";
    pub const ABORT_UPLOAD: &str = "AbortUpload";
    pub const UPLOAD_PROGRESS: &str = "UploadProgress";
    pub const UPLOAD_ERROR: &str = "UploadError";
    pub const PROJECT_DIRECTORY: &str = "ProjectDirectory";
    pub const PING: &str = "Ping";
    pub const HEARTBEAT: &str = "Heartbeat";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            status: None,
            data: None,
        }
    }

    pub fn with_data(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            status: None,
            data: Some(data),
        }
    }

    /// Reply with status 200.
    pub fn ok(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            status: Some(STATUS_OK),
            data: Some(data),
        }
    }

    /// Reply with status 500 and a human-readable reason.
    pub fn error(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            status: Some(STATUS_ERROR),
            data: Some(Value::String(reason.into())),
        }
    }

    /// Presence frame describing the plugin, addressed to the application.
    pub fn plugin_status(status: PeerStatus) -> Self {
        Self::with_data(kinds::PLUGIN_STATUS, status_value(status))
    }

    /// Presence frame describing the application, addressed to the plugin.
    pub fn app_status(status: PeerStatus) -> Self {
        Self::with_data(kinds::APP_STATUS, status_value(status))
    }

    pub fn is_error(&self) -> bool {
        self.status == Some(STATUS_ERROR)
    }

    /// `data` as a string, if it is one.
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_ref().and_then(Value::as_str)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

fn status_value(status: PeerStatus) -> Value {
    match status {
        PeerStatus::Connected => Value::String("Connected".into()),
        PeerStatus::Disconnected => Value::String("Disconnected".into()),
    }
}

/// Keepalive frames sent by the browser application. They carry no payload
/// for the plugin and are dropped by the relay.
pub fn is_heartbeat(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed == kinds::PING {
        return true;
    }
    // Heartbeat envelopes are tiny; anything larger is payload.
    if !trimmed.starts_with('{') || trimmed.len() > 256 {
        return false;
    }
    match serde_json::from_str::<Message>(trimmed) {
        Ok(msg) => msg.kind == kinds::PING || msg.kind == kinds::HEARTBEAT,
        Err(_) => false,
    }
}
