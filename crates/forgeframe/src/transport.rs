//! Message transport seam.
//!
//! The broker never talks to a real window API. It holds a [`MessagePort`]
//! to post strings at a peer, and an mpsc receiver of [`RawMessage`] for its
//! own inbound traffic. The in-process [`window_pair`] wires two halves
//! together with FIFO delivery and origin-targeted posting, which is all the
//! endpoint assumes of the real thing.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::BrokerError;

/// A message as it arrives off the transport, before decoding.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub data: String,
    /// Origin of the sending document, as reported by the transport.
    pub origin: String,
}

/// Sending half bound to one peer window.
pub trait MessagePort: Send + Sync {
    /// Deliver `data` to the peer iff the peer's origin matches
    /// `target_origin` (or `target_origin` is `*`). A mismatch or a closed
    /// peer drops the message; neither is an error at this layer.
    fn post(&self, data: String, target_origin: &str) -> Result<(), BrokerError>;
}

/// One side's view of a bidirectional channel: where we post, what we hear.
pub struct WindowChannel {
    /// Our own origin, stamped on outbound frames.
    pub origin: String,
    /// Sender towards the peer.
    pub port: Arc<dyn MessagePort>,
    /// Inbound raw traffic.
    pub rx: mpsc::UnboundedReceiver<RawMessage>,
}

struct ChannelPort {
    self_origin: String,
    peer_origin: String,
    tx: mpsc::UnboundedSender<RawMessage>,
}

impl MessagePort for ChannelPort {
    fn post(&self, data: String, target_origin: &str) -> Result<(), BrokerError> {
        if target_origin != "*" && target_origin != self.peer_origin {
            tracing::warn!(
                target = %target_origin,
                peer = %self.peer_origin,
                "post dropped: target origin does not match peer"
            );
            return Ok(());
        }
        if self
            .tx
            .send(RawMessage {
                data,
                origin: self.self_origin.clone(),
            })
            .is_err()
        {
            tracing::debug!(peer = %self.peer_origin, "post dropped: peer channel closed");
        }
        Ok(())
    }
}

/// Build two connected window halves with the given origins.
///
/// Delivery is FIFO per direction, matching the transport ordering the
/// broker is specified against.
pub fn window_pair(origin_a: &str, origin_b: &str) -> (WindowChannel, WindowChannel) {
    let (tx_to_a, rx_a) = mpsc::unbounded_channel();
    let (tx_to_b, rx_b) = mpsc::unbounded_channel();

    let a = WindowChannel {
        origin: origin_a.to_string(),
        port: Arc::new(ChannelPort {
            self_origin: origin_a.to_string(),
            peer_origin: origin_b.to_string(),
            tx: tx_to_b,
        }),
        rx: rx_a,
    };
    let b = WindowChannel {
        origin: origin_b.to_string(),
        port: Arc::new(ChannelPort {
            self_origin: origin_b.to_string(),
            peer_origin: origin_a.to_string(),
            tx: tx_to_a,
        }),
        rx: rx_b,
    };
    (a, b)
}

/// Origin (scheme://host[:port]) of a URL string.
pub fn origin_of(url: &str) -> Result<String, BrokerError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| BrokerError::InvalidConfig(format!("unparseable url {url}: {e}")))?;
    Ok(parsed.origin().ascii_serialization())
}
