//! The endpoint reactor task.
//!
//! Owns the window channel and all per-endpoint I/O state, interleaving:
//! - commands from callers (send request, fire-and-forget, dispose)
//! - inbound raw traffic (filter, decode, ack, dispatch)
//! - the retransmit/timeout schedule
//!
//! Callers talk to it over an mpsc command channel and receive results over
//! oneshot responders, so no lock is ever held across an await.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use forgeproto::{FrameError, Message, MessageKind, MessageSource};

use super::correlator::{Correlator, Pending, RETRY_INITIAL};
use super::{Handler, RequestMeta, StatsInner};
use crate::error::BrokerError;
use crate::transport::{MessagePort, WindowChannel};

pub(super) enum ReactorCommand {
    Request {
        msg: Message,
        timeout: Duration,
        responder: oneshot::Sender<Result<Option<Value>, BrokerError>>,
    },
}

pub(super) struct Reactor {
    pub name: String,
    pub own_source: MessageSource,
    pub peer_origin: String,
    pub expected_peer: Option<String>,
    pub channel: WindowChannel,
    pub cmd_rx: mpsc::UnboundedReceiver<ReactorCommand>,
    pub handlers: Arc<DashMap<String, Handler>>,
    pub stats: Arc<StatsInner>,
    pub cancel: CancellationToken,
    pub first_frame: Option<oneshot::Sender<MessageSource>>,
}

impl Reactor {
    pub async fn run(mut self) {
        let mut correlator = Correlator::new();
        let mut expected_peer_uid: Option<String> = self.expected_peer.take();
        let mut rx_closed = false;

        debug!(endpoint = %self.name, "reactor started");

        loop {
            // A year out stands in for "no scheduled work".
            let wake = correlator
                .next_wakeup()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(31_536_000));

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(
                        endpoint = %self.name,
                        pending = correlator.pending_len(),
                        "endpoint disposed, rejecting pending requests"
                    );
                    correlator.fail_all(BrokerError::EndpointClosed);
                    self.handlers.clear();
                    break;
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ReactorCommand::Request { msg, timeout, responder }) => {
                            self.send_new_request(&mut correlator, msg, timeout, responder);
                        }
                        None => {
                            correlator.fail_all(BrokerError::EndpointClosed);
                            break;
                        }
                    }
                }

                raw = self.channel.rx.recv(), if !rx_closed => {
                    match raw {
                        Some(raw) => self.on_raw(
                            &mut correlator,
                            &mut expected_peer_uid,
                            &raw.data,
                            &raw.origin,
                        ),
                        None => {
                            // Peer window gone; pending requests still time out.
                            debug!(endpoint = %self.name, "peer channel closed");
                            rx_closed = true;
                        }
                    }
                }

                _ = tokio::time::sleep_until(wake) => {
                    let now = Instant::now();
                    for retransmit in correlator.due_retransmits(now) {
                        trace!(endpoint = %self.name, id = %retransmit.id, "retransmitting request");
                        self.stats.retransmits.fetch_add(1, Ordering::Relaxed);
                        self.post(&retransmit.encoded);
                    }
                    for expired in correlator.expire(now) {
                        let timeout_ms = expired.timeout.as_millis() as u64;
                        debug!(
                            endpoint = %self.name,
                            name = %expired.name,
                            timeout_ms,
                            "request timed out"
                        );
                        let _ = expired.responder.send(Err(BrokerError::Timeout {
                            name: expired.name,
                            timeout_ms,
                        }));
                    }
                }
            }
        }

        debug!(endpoint = %self.name, "reactor exiting");
    }

    fn send_new_request(
        &self,
        correlator: &mut Correlator,
        msg: Message,
        timeout: Duration,
        responder: oneshot::Sender<Result<Option<Value>, BrokerError>>,
    ) {
        let encoded = msg.encode();
        let now = Instant::now();
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        self.post(&encoded);
        correlator.insert(
            msg.id.clone(),
            Pending {
                name: msg.name.clone(),
                encoded,
                responder,
                deadline: now + timeout,
                ack_received: false,
                next_retry: now + RETRY_INITIAL,
                retry_interval: RETRY_INITIAL,
                timeout,
            },
        );
        trace!(
            endpoint = %self.name,
            id = %msg.id,
            name = %msg.name,
            pending = correlator.pending_len(),
            "request sent"
        );
    }

    fn on_raw(
        &mut self,
        correlator: &mut Correlator,
        expected_peer_uid: &mut Option<String>,
        data: &str,
        origin: &str,
    ) {
        if self.peer_origin != "*" && origin != self.peer_origin {
            self.stats.dropped_origin.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %self.name, %origin, "dropped frame: origin mismatch");
            return;
        }

        let msg = match Message::try_decode(data) {
            Ok(msg) => msg,
            Err(FrameError::MissingPrefix) => return, // foreign traffic, not even counted
            Err(e) => {
                self.stats.dropped_decode.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %self.name, error = %e, "dropped frame: decode failure");
                return;
            }
        };

        // The claimed source domain must agree with the transport origin.
        if self.peer_origin != "*" && msg.source.domain != origin {
            self.stats.dropped_origin.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %self.name, claimed = %msg.source.domain, "dropped frame: source domain spoof");
            return;
        }

        // The first valid frame establishes the peer uid unless it was
        // pinned up front; afterwards every frame must carry it.
        match expected_peer_uid {
            None => {
                *expected_peer_uid = Some(msg.source.uid.clone());
            }
            Some(uid) if *uid != msg.source.uid => {
                self.stats.dropped_peer_uid.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %self.name, got = %msg.source.uid, "dropped frame: peer uid mismatch");
                return;
            }
            Some(_) => {}
        }
        if let Some(tx) = self.first_frame.take() {
            let _ = tx.send(msg.source.clone());
        }

        match msg.kind {
            MessageKind::Ack => {
                if !correlator.mark_acked(&msg.id) {
                    trace!(endpoint = %self.name, id = %msg.id, "late ack ignored");
                }
            }
            MessageKind::Response => match correlator.take(&msg.id) {
                Some(pending) => {
                    let outcome = match msg.error {
                        Some(wire) => Err(BrokerError::HandlerFailure(wire)),
                        None => Ok(msg.data),
                    };
                    let _ = pending.responder.send(outcome);
                }
                None => {
                    self.stats.orphan_responses.fetch_add(1, Ordering::Relaxed);
                    debug!(endpoint = %self.name, id = %msg.id, "orphan response discarded");
                }
            },
            MessageKind::Request => self.on_request(correlator, msg),
        }
    }

    fn on_request(&self, correlator: &mut Correlator, msg: Message) {
        if correlator.record_seen(&msg.id) {
            // Already handled; re-ack so the peer stops retransmitting, but
            // never re-invoke the handler.
            self.post(&Message::ack(msg.id.clone(), self.own_source.clone()).encode());
            self.stats.duplicate_requests.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %self.name, id = %msg.id, "duplicate request re-acked");
            return;
        }

        let handler = match self.handlers.get(&msg.name) {
            Some(h) => h.clone(),
            None => {
                // No ack: a handler registered moments from now still gets
                // the retransmit; a genuinely unknown request times out at
                // the caller.
                correlator.forget_seen(&msg.id);
                self.stats.unknown_names.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %self.name, name = %msg.name, "dropped request: no handler");
                return;
            }
        };

        self.post(&Message::ack(msg.id.clone(), self.own_source.clone()).encode());

        // Handlers may suspend; never block the reactor on them.
        let port = self.channel.port.clone();
        let peer_origin = self.peer_origin.clone();
        let own_source = self.own_source.clone();
        let endpoint_name = self.name.clone();
        let meta = RequestMeta {
            id: msg.id.clone(),
            name: msg.name.clone(),
            source: msg.source,
        };
        tokio::spawn(async move {
            let response = match handler(msg.data, meta).await {
                Ok(data) => Message::response(msg.id, data, own_source),
                Err(err) => {
                    debug!(endpoint = %endpoint_name, name = %msg.name, error = %err, "handler failed");
                    Message::error_response(msg.id, err.to_wire(), own_source)
                }
            };
            post_to(&*port, &peer_origin, &response.encode(), &endpoint_name);
        });
    }

    fn post(&self, encoded: &str) {
        post_to(&*self.channel.port, &self.peer_origin, encoded, &self.name);
    }
}

fn post_to(port: &dyn MessagePort, peer_origin: &str, encoded: &str, endpoint_name: &str) {
    if let Err(e) = port.post(encoded.to_string(), peer_origin) {
        warn!(endpoint = %endpoint_name, error = %e, "post failed");
    }
}
