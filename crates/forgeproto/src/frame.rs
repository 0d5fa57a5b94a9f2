//! ForgeFrame Wire Protocol
//!
//! A single-string framing for cross-peer messaging over shared text
//! channels.
//!
//! ## Wire Format
//!
//! ```text
//! forgeframe:{"id":"uid_a7/3","type":"request","name":"handshake",...}
//! └────┬────┘└──────────────────────┬─────────────────────────────┘
//!   prefix                     JSON body
//! ```
//!
//! The channel is shared with other libraries and extensions; the prefix
//! makes our traffic trivially distinguishable. Anything that is not a
//! string, does not carry the prefix, or fails to parse into a well-formed
//! [`Message`] decodes to `None` and is dropped by the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every wire message starts with this literal. Bump on breaking changes.
pub const WIRE_PREFIX: &str = "forgeframe:";

/// Message kinds (the `type` field on the wire).
///
/// - `Request` initiates work and expects an ack plus exactly one response.
/// - `Response` terminates exactly one pending request.
/// - `Ack` confirms receipt of a request and stops retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Ack,
}

impl MessageKind {
    /// The literal used in the `name` field for non-request frames.
    pub fn reserved_name(self) -> Option<&'static str> {
        match self {
            MessageKind::Request => None,
            MessageKind::Response => Some("response"),
            MessageKind::Ack => Some("ack"),
        }
    }
}

/// Identity of the endpoint that emitted a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSource {
    /// Stable per-instance identifier, also used for the implicit handshake.
    pub uid: String,
    /// Origin of the sending document, e.g. `https://consumer.example`.
    pub domain: String,
}

impl MessageSource {
    pub fn new(uid: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            domain: domain.into(),
        }
    }
}

/// Failure payload carried on response frames.
///
/// Reconstructed shallowly on the receiving side; only `message` is
/// guaranteed present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            stack: None,
        }
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: Some(name.into()),
            stack: None,
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A parsed ForgeFrame message.
///
/// `id` is the correlation key, unique per originating endpoint. Request
/// frames carry a handler name in `name`; response and ack frames carry the
/// reserved literals `"response"` / `"ack"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub source: MessageSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Errors during frame decoding.
///
/// Callers that only need the drop decision use [`decode`]; the typed error
/// exists so endpoints can count drops by reason.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("missing wire prefix")]
    MissingPrefix,
    #[error("malformed JSON body: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("empty correlation id")]
    EmptyId,
    #[error("reserved name mismatch for {kind:?}: {name}")]
    ReservedNameMismatch { kind: MessageKind, name: String },
}

impl Message {
    /// Build a request frame.
    pub fn request(
        id: impl Into<String>,
        name: impl Into<String>,
        data: Option<Value>,
        source: MessageSource,
    ) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Request,
            name: name.into(),
            data,
            source,
            error: None,
        }
    }

    /// Build a success response for a request id.
    pub fn response(id: impl Into<String>, data: Option<Value>, source: MessageSource) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Response,
            name: "response".into(),
            data,
            source,
            error: None,
        }
    }

    /// Build an error response for a request id.
    pub fn error_response(id: impl Into<String>, error: WireError, source: MessageSource) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Response,
            name: "response".into(),
            data: None,
            source,
            error: Some(error),
        }
    }

    /// Build an ack for a request id.
    pub fn ack(id: impl Into<String>, source: MessageSource) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Ack,
            name: "ack".into(),
            data: None,
            source,
            error: None,
        }
    }

    /// Serialize to the single-string wire form.
    pub fn encode(&self) -> String {
        let mut out = String::from(WIRE_PREFIX);
        // Message contains only JSON-safe fields; serialization cannot fail.
        out.push_str(&serde_json::to_string(self).unwrap_or_default());
        out
    }

    /// Decode a raw string, or `None` when it is not our traffic.
    ///
    /// This is the drop-silently entry point. Use [`Message::try_decode`]
    /// when the caller wants the reason for diagnostics counters.
    pub fn decode(raw: &str) -> Option<Self> {
        Self::try_decode(raw).ok()
    }

    /// Decode with a typed error for diagnostics.
    pub fn try_decode(raw: &str) -> Result<Self, FrameError> {
        let body = raw.strip_prefix(WIRE_PREFIX).ok_or(FrameError::MissingPrefix)?;
        let msg: Message = serde_json::from_str(body)?;
        if msg.id.is_empty() {
            return Err(FrameError::EmptyId);
        }
        if let Some(reserved) = msg.kind.reserved_name() {
            if msg.name != reserved {
                return Err(FrameError::ReservedNameMismatch {
                    kind: msg.kind,
                    name: msg.name,
                });
            }
        }
        Ok(msg)
    }

    /// Numeric sequence of a correlation id.
    ///
    /// Ids are `uid/N` with N monotonic per originating endpoint; receivers
    /// use the sequence to discard stale prop updates.
    pub fn sequence_of(id: &str) -> Option<u64> {
        id.rsplit('/').next()?.parse().ok()
    }

    /// True when this frame terminates a pending request (response kind).
    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }

    /// True when this frame only confirms receipt.
    pub fn is_ack(&self) -> bool {
        self.kind == MessageKind::Ack
    }
}
