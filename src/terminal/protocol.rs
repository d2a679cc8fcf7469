//! Terminal Wire Protocol
//!
//! One JSON object per WebSocket frame in each direction.
//!
//! Inbound (operator -> host):
//!
//! ```json
//! { "command": "ls", "args": ["-la"], "streaming": false }
//! ```
//!
//! Outbound (host -> operator):
//!
//! ```json
//! { "type": "stdout", "data": "total 0", "timestamp": "2024-05-01T10:00:00Z" }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel command the browser client sends as a keep-alive; always dropped.
pub const NOOP_COMMAND: &str = "skip";

/// Prefix shared by every pseudo-command (`/help`, `/stop`, ...)
pub const PSEUDO_COMMAND_PREFIX: char = '/';

/// UI directive that clears the operator's screen without spawning anything.
pub const CLEAR_COMMAND: &str = "clear";

/// A command request decoded from one inbound frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRequest {
    /// Command name, or a pseudo-command starting with `/`
    pub command: String,

    /// Raw, untrusted argument tokens
    #[serde(default)]
    pub args: Vec<String>,

    /// Deliver output line-by-line instead of once at exit.
    /// Older clients call this field `lineChoice`.
    #[serde(default, alias = "lineChoice")]
    pub streaming: bool,
}

impl InboundRequest {
    /// Create a new request
    pub fn new(command: impl Into<String>, args: Vec<String>, streaming: bool) -> Self {
        Self {
            command: command.into(),
            args,
            streaming,
        }
    }

    /// Command with surrounding whitespace removed
    pub fn trimmed_command(&self) -> &str {
        self.command.trim()
    }

    /// Whether this request should be dropped before dispatch
    /// (empty, whitespace-only, or the `skip` sentinel)
    pub fn is_noop(&self) -> bool {
        let command = self.trimmed_command();
        command.is_empty() || command == NOOP_COMMAND
    }

    /// Whether this request is a pseudo-command answered without a process
    pub fn is_pseudo_command(&self) -> bool {
        self.trimmed_command().starts_with(PSEUDO_COMMAND_PREFIX)
    }

    /// Whether this request is the `clear` UI directive
    pub fn is_clear(&self) -> bool {
        self.trimmed_command() == CLEAR_COMMAND
    }
}

/// Outbound message kind, serialized as the lowercase `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Ready,
    Stdout,
    Stderr,
    Status,
    Error,
    Clear,
    Time,
}

impl MessageKind {
    /// Wire name, also used as a metrics label
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ready => "ready",
            MessageKind::Stdout => "stdout",
            MessageKind::Stderr => "stderr",
            MessageKind::Status => "status",
            MessageKind::Error => "error",
            MessageKind::Clear => "clear",
            MessageKind::Time => "time",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message for the operator. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    /// Build a message stamped with the current time
    pub fn new(kind: MessageKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn ready(data: impl Into<String>) -> Self {
        Self::new(MessageKind::Ready, data)
    }

    pub fn stdout(data: impl Into<String>) -> Self {
        Self::new(MessageKind::Stdout, data)
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self::new(MessageKind::Stderr, data)
    }

    pub fn status(data: impl Into<String>) -> Self {
        Self::new(MessageKind::Status, data)
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, data)
    }

    pub fn clear() -> Self {
        Self::new(MessageKind::Clear, "")
    }

    /// Heartbeat tick carrying the current time in RFC 3339
    pub fn time() -> Self {
        let now = Utc::now();
        Self {
            kind: MessageKind::Time,
            data: now.to_rfc3339(),
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_request() {
        let req: InboundRequest =
            serde_json::from_str(r#"{"command":"ls","args":["-la"],"streaming":true}"#).unwrap();
        assert_eq!(req.command, "ls");
        assert_eq!(req.args, vec!["-la".to_string()]);
        assert!(req.streaming);
    }

    #[test]
    fn test_decode_defaults_and_alias() {
        let req: InboundRequest = serde_json::from_str(r#"{"command":"uptime"}"#).unwrap();
        assert!(req.args.is_empty());
        assert!(!req.streaming);

        let req: InboundRequest =
            serde_json::from_str(r#"{"command":"top","args":[],"lineChoice":true}"#).unwrap();
        assert!(req.streaming);
    }

    #[test]
    fn test_decode_rejects_missing_command() {
        let result = serde_json::from_str::<InboundRequest>(r#"{"args":["x"]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_noop_detection() {
        assert!(InboundRequest::new("", vec![], false).is_noop());
        assert!(InboundRequest::new("   ", vec![], false).is_noop());
        assert!(InboundRequest::new(" skip ", vec![], false).is_noop());
        assert!(!InboundRequest::new("ls", vec![], false).is_noop());
    }

    #[test]
    fn test_request_classification() {
        assert!(InboundRequest::new("/help", vec![], false).is_pseudo_command());
        assert!(!InboundRequest::new("help", vec![], false).is_pseudo_command());
        assert!(InboundRequest::new(" clear ", vec![], false).is_clear());
        assert!(!InboundRequest::new("clearx", vec![], false).is_clear());
    }

    #[test]
    fn test_encode_outbound_shape() {
        let msg = OutboundMessage::stdout("hello");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "stdout");
        assert_eq!(value["data"], "hello");
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_time_message_carries_rfc3339() {
        let msg = OutboundMessage::time();
        assert_eq!(msg.kind, MessageKind::Time);
        assert!(chrono::DateTime::parse_from_rfc3339(&msg.data).is_ok());
    }

    #[test]
    fn test_kind_names() {
        for kind in [
            MessageKind::Ready,
            MessageKind::Stdout,
            MessageKind::Stderr,
            MessageKind::Status,
            MessageKind::Error,
            MessageKind::Clear,
            MessageKind::Time,
        ] {
            let encoded = serde_json::to_string(&kind).unwrap();
            assert_eq!(encoded, format!("\"{}\"", kind.as_str()));
        }
    }
}
