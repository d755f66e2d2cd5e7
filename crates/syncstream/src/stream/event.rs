//! Typed event payloads carried by the subscribe endpoints.
//!
//! Every frame's JSON payload is discriminated by its `type` field. Kinds we
//! do not know about decode to an `Unknown` variant instead of failing, so a
//! newer server can add event types without breaking older clients.

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Implemented by every payload type a [`FrameParser`](super::FrameParser) can decode.
pub trait StreamEvent: DeserializeOwned {
    /// Returns true for the connection handshake, which carries no update.
    fn is_handshake(&self) -> bool;
}

/// Event emitted by the sync-job progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Connection acknowledged by the server.
    Connected,
    /// Keep-alive without payload.
    Heartbeat,
    /// Absolute counter values, optionally with a terminal flag.
    Progress(ProgressPayload),
    /// Application-level failure reported by the server.
    Error {
        #[serde(default, alias = "error")]
        message: Option<String>,
    },
    /// Any event type this client does not understand.
    #[serde(other)]
    Unknown,
}

impl StreamEvent for SyncEvent {
    fn is_handshake(&self) -> bool {
        matches!(self, SyncEvent::Connected)
    }
}

/// Body of a `progress` event.
///
/// Counter fields are absolute totals for the run. A missing field leaves
/// the current value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProgressPayload {
    #[serde(default)]
    pub inserted: Option<u64>,
    #[serde(default)]
    pub updated: Option<u64>,
    #[serde(default)]
    pub deleted: Option<u64>,
    #[serde(default)]
    pub kept: Option<u64>,
    #[serde(default)]
    pub skipped: Option<u64>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub is_failed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProgressPayload {
    /// Error text carried by the payload, ignoring blank strings.
    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
    }

    /// True when the payload reports a failed run.
    pub fn reports_failure(&self) -> bool {
        self.is_failed || self.error_message().is_some()
    }
}

/// Event emitted by the streaming query endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    Connected,
    Heartbeat,
    /// The answer is about to stream; any previous partial answer is void.
    CompletionStart,
    /// Incremental fragment of the answer text.
    CompletionDelta {
        #[serde(default)]
        text: String,
    },
    /// The answer text is finished. When `text` is present it is the full answer.
    CompletionDone {
        #[serde(default)]
        text: Option<String>,
    },
    /// Full replacement of the result list.
    Results {
        #[serde(default)]
        results: Vec<serde_json::Value>,
    },
    Error {
        #[serde(default, alias = "detail")]
        message: Option<String>,
    },
    /// End of the query stream.
    Done,
    #[serde(other)]
    Unknown,
}

impl StreamEvent for QueryEvent {
    fn is_handshake(&self) -> bool {
        matches!(self, QueryEvent::Connected)
    }
}
