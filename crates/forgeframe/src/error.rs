//! Error taxonomy surfaced to user code.
//!
//! Origin mismatches, decode failures, and unknown request names never
//! appear here: the endpoint drops them silently and counts them in its
//! diagnostics snapshot.

use forgeproto::WireError;

/// Errors surfaced by broker operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// `window.open` equivalent returned nothing.
    #[error("popup blocked")]
    PopupBlocked,

    /// A request did not produce a response within its total timeout.
    #[error("request {name} timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    /// The endpoint was disposed while the request was pending, or before
    /// the operation could be sent.
    #[error("endpoint closed")]
    EndpointClosed,

    /// A prop failed its validator during `render` or `update_props`.
    #[error("prop validation failed for {prop}: {reason}")]
    PropValidation { prop: String, reason: String },

    /// The peer's handler failed; carries the peer error across the wire.
    #[error("peer handler failed: {0}")]
    HandlerFailure(WireError),

    /// A required prop was absent with no default.
    #[error("required prop missing: {prop}")]
    SchemaRequired { prop: String },

    /// A prop value did not match its declared kind.
    #[error("prop {prop} expected {expected}, got {actual}")]
    SchemaTypeMismatch {
        prop: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// An external standard-schema validator rejected a prop.
    #[error("schema validation rejected prop {prop}: {reason}")]
    AsyncSchemaRejected { prop: String, reason: String },

    /// Marshalling hit the nesting cap; cyclic graphs are unsupported.
    #[error("cyclic or too deeply nested structure in marshalled value")]
    CyclicStructure,

    /// Lifecycle stage machine refused a move (e.g. `render` twice).
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// `create` rejected the component configuration.
    #[error("invalid component configuration: {0}")]
    InvalidConfig(String),

    /// The transport refused a send; treated like a closed endpoint by
    /// callers.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Stable kind name carried in the wire `error.name` field.
    pub fn kind_name(&self) -> &'static str {
        match self {
            BrokerError::PopupBlocked => "PopupBlocked",
            BrokerError::Timeout { .. } => "Timeout",
            BrokerError::EndpointClosed => "EndpointClosed",
            BrokerError::PropValidation { .. } => "PropValidationFailure",
            BrokerError::HandlerFailure(_) => "HandlerFailure",
            BrokerError::SchemaRequired { .. } => "SchemaRequired",
            BrokerError::SchemaTypeMismatch { .. } => "SchemaTypeMismatch",
            BrokerError::AsyncSchemaRejected { .. } => "AsyncSchemaRejected",
            BrokerError::CyclicStructure => "CyclicStructure",
            BrokerError::InvalidTransition { .. } => "InvalidTransition",
            BrokerError::InvalidConfig(_) => "InvalidConfig",
            BrokerError::Transport(_) => "TransportFailure",
        }
    }

    /// Convert to the wire error payload for a failing response frame.
    pub fn to_wire(&self) -> WireError {
        match self {
            // Peer failures keep the original payload rather than renesting.
            BrokerError::HandlerFailure(inner) => inner.clone(),
            other => WireError::named(other.kind_name(), other.to_string()),
        }
    }
}

impl From<WireError> for BrokerError {
    fn from(e: WireError) -> Self {
        BrokerError::HandlerFailure(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_conversion_keeps_kind() {
        let err = BrokerError::Timeout {
            name: "handshake".into(),
            timeout_ms: 10_000,
        };
        let wire = err.to_wire();
        assert_eq!(wire.name.as_deref(), Some("Timeout"));
        assert!(wire.message.contains("10000ms"));
    }

    #[test]
    fn handler_failure_passes_through() {
        let original = WireError::named("PropValidationFailure", "count must be a number");
        let err = BrokerError::HandlerFailure(original.clone());
        assert_eq!(err.to_wire(), original);
    }
}
