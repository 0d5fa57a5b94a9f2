//! Per-peer broker endpoint.
//!
//! An [`Endpoint`] binds one local instance to one peer window: it sends
//! correlated requests with ack-gated retransmit and a hard total timeout,
//! dispatches inbound requests to registered handlers, and rejects
//! everything that fails origin or peer-uid checks. All I/O lives in a
//! dedicated reactor task; the public type is a cheap clone handle.

mod correlator;
mod reactor;

pub use correlator::{DEFAULT_TIMEOUT, RETRY_INITIAL, RETRY_MAX};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use forgeproto::{Message, MessageSource};

use crate::error::BrokerError;
use crate::transport::WindowChannel;
use reactor::{Reactor, ReactorCommand};

/// Inbound request context handed to handlers.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub id: String,
    pub name: String,
    pub source: MessageSource,
}

/// What a handler produces: response data, or an error for the wire.
pub type HandlerFuture = BoxFuture<'static, Result<Option<Value>, BrokerError>>;

/// An inbound request handler.
pub type Handler = Arc<dyn Fn(Option<Value>, RequestMeta) -> HandlerFuture + Send + Sync>;

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F>(f: F) -> Handler
where
    F: Fn(Option<Value>, RequestMeta) -> HandlerFuture + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Per-call request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the endpoint's total timeout for this request.
    pub timeout: Option<Duration>,
}

/// Endpoint construction parameters.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Display name for logging, e.g. `consumer:uid_3f`.
    pub name: String,
    pub own_uid: String,
    pub own_domain: String,
    /// Expected peer origin, or `*` to accept any.
    pub peer_origin: String,
    /// Pin the peer uid up front. When `None` the first valid frame
    /// establishes it (the implicit handshake).
    pub expected_peer_uid: Option<String>,
    /// Default total per-request timeout.
    pub timeout: Duration,
}

impl EndpointConfig {
    pub fn new(
        name: impl Into<String>,
        own_uid: impl Into<String>,
        own_domain: impl Into<String>,
        peer_origin: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            own_uid: own_uid.into(),
            own_domain: own_domain.into(),
            peer_origin: peer_origin.into(),
            expected_peer_uid: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expected_peer(mut self, uid: impl Into<String>) -> Self {
        self.expected_peer_uid = Some(uid.into());
        self
    }
}

#[derive(Default)]
pub(crate) struct StatsInner {
    pub sent: AtomicU64,
    pub retransmits: AtomicU64,
    pub dropped_origin: AtomicU64,
    pub dropped_decode: AtomicU64,
    pub dropped_peer_uid: AtomicU64,
    pub orphan_responses: AtomicU64,
    pub duplicate_requests: AtomicU64,
    pub unknown_names: AtomicU64,
}

/// Diagnostics snapshot. Dropped frames never surface as errors; they are
/// visible only here.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub sent: u64,
    pub retransmits: u64,
    pub dropped_origin: u64,
    pub dropped_decode: u64,
    pub dropped_peer_uid: u64,
    pub orphan_responses: u64,
    pub duplicate_requests: u64,
    pub unknown_names: u64,
}

struct EndpointInner {
    config: EndpointConfig,
    cmd_tx: mpsc::UnboundedSender<ReactorCommand>,
    /// Direct port handle for fire-and-forget posts that must not race
    /// reactor shutdown (`close`, proxy `release`).
    port: Arc<dyn crate::transport::MessagePort>,
    handlers: Arc<DashMap<String, Handler>>,
    stats: Arc<StatsInner>,
    cancel: CancellationToken,
    counter: AtomicU64,
    timeout_override: Mutex<Option<Duration>>,
}

/// Handle to one peer binding. Clones share the same reactor.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Bind to a peer channel and spawn the reactor.
    ///
    /// `first_frame` fires once, on the first valid inbound frame, carrying
    /// the peer source that established the uid handshake.
    pub fn spawn(
        config: EndpointConfig,
        channel: WindowChannel,
        first_frame: Option<oneshot::Sender<MessageSource>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handlers: Arc<DashMap<String, Handler>> = Arc::new(DashMap::new());
        let stats = Arc::new(StatsInner::default());
        let cancel = CancellationToken::new();
        let port = channel.port.clone();

        let reactor = Reactor {
            name: config.name.clone(),
            own_source: MessageSource::new(config.own_uid.clone(), config.own_domain.clone()),
            peer_origin: config.peer_origin.clone(),
            expected_peer: config.expected_peer_uid.clone(),
            channel,
            cmd_rx,
            handlers: handlers.clone(),
            stats: stats.clone(),
            cancel: cancel.clone(),
            first_frame,
        };
        tokio::spawn(reactor.run());

        Self {
            inner: Arc::new(EndpointInner {
                config,
                cmd_tx,
                port,
                handlers,
                stats,
                cancel,
                counter: AtomicU64::new(1),
                timeout_override: Mutex::new(None),
            }),
        }
    }

    /// Send a request and suspend until response, timeout, or disposal.
    pub async fn send_request(
        &self,
        name: &str,
        data: Option<Value>,
        opts: RequestOptions,
    ) -> Result<Option<Value>, BrokerError> {
        if self.is_disposed() {
            return Err(BrokerError::EndpointClosed);
        }
        let timeout = opts
            .timeout
            .or(*self.inner.timeout_override.lock().expect("timeout lock"))
            .unwrap_or(self.inner.config.timeout);

        let msg = Message::request(self.next_id(), name, data, self.own_source());
        let (responder, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(ReactorCommand::Request {
                msg,
                timeout,
                responder,
            })
            .map_err(|_| BrokerError::EndpointClosed)?;
        rx.await.map_err(|_| BrokerError::EndpointClosed)?
    }

    /// Post a request once with no pending record and no retry. Posts
    /// straight through the port so a dispose racing behind it cannot drop
    /// the frame. Loss-tolerant; used for `close` and proxy `release`.
    pub fn notify(&self, name: &str, data: Option<Value>) {
        let msg = Message::request(self.next_id(), name, data, self.own_source());
        let _ = self
            .inner
            .port
            .post(msg.encode(), &self.inner.config.peer_origin);
    }

    /// Register a handler for inbound requests named `name`.
    pub fn register_handler(&self, name: impl Into<String>, handler: Handler) {
        self.inner.handlers.insert(name.into(), handler);
    }

    /// Remove a handler (used when releasing proxy tokens).
    pub fn remove_handler(&self, name: &str) {
        self.inner.handlers.remove(name);
    }

    /// Per-instance timeout override (the builtin `timeout` prop).
    pub fn set_timeout_override(&self, timeout: Option<Duration>) {
        *self.inner.timeout_override.lock().expect("timeout lock") = timeout;
    }

    /// Reject all pending requests, clear handlers, stop the reactor.
    pub fn dispose(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn stats(&self) -> EndpointStats {
        let s = &self.inner.stats;
        EndpointStats {
            sent: s.sent.load(Ordering::Relaxed),
            retransmits: s.retransmits.load(Ordering::Relaxed),
            dropped_origin: s.dropped_origin.load(Ordering::Relaxed),
            dropped_decode: s.dropped_decode.load(Ordering::Relaxed),
            dropped_peer_uid: s.dropped_peer_uid.load(Ordering::Relaxed),
            orphan_responses: s.orphan_responses.load(Ordering::Relaxed),
            duplicate_requests: s.duplicate_requests.load(Ordering::Relaxed),
            unknown_names: s.unknown_names.load(Ordering::Relaxed),
        }
    }

    pub fn own_uid(&self) -> &str {
        &self.inner.config.own_uid
    }

    pub fn own_domain(&self) -> &str {
        &self.inner.config.own_domain
    }

    pub fn peer_origin(&self) -> &str {
        &self.inner.config.peer_origin
    }

    fn own_source(&self) -> MessageSource {
        MessageSource::new(
            self.inner.config.own_uid.clone(),
            self.inner.config.own_domain.clone(),
        )
    }

    /// Correlation ids are `uid/N` with N monotonic per endpoint; globally
    /// unique because uids are.
    fn next_id(&self) -> String {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}/{}", self.inner.config.own_uid, n)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.config.name)
            .field("peer_origin", &self.inner.config.peer_origin)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::window_pair;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const CONSUMER: &str = "https://consumer.example";
    const HOST: &str = "https://host.example";

    fn endpoints() -> (Endpoint, Endpoint) {
        let (a, b) = window_pair(CONSUMER, HOST);
        let consumer = Endpoint::spawn(
            EndpointConfig::new("consumer", "uid_c", CONSUMER, HOST),
            a,
            None,
        );
        let host = Endpoint::spawn(EndpointConfig::new("host", "uid_h", HOST, CONSUMER), b, None);
        (consumer, host)
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let (consumer, host) = endpoints();

        host.register_handler(
            "greet",
            handler_fn(|data, _meta| {
                async move {
                    let who = data
                        .and_then(|d| d.get("who").and_then(|w| w.as_str().map(String::from)))
                        .unwrap_or_default();
                    Ok(Some(json!({ "greeting": format!("hello {who}") })))
                }
                .boxed()
            }),
        );

        let out = consumer
            .send_request("greet", Some(json!({"who": "Ada"})), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(out, Some(json!({"greeting": "hello Ada"})));
    }

    #[tokio::test]
    async fn handler_error_crosses_the_wire() {
        let (consumer, host) = endpoints();

        host.register_handler(
            "explode",
            handler_fn(|_, _| {
                async {
                    Err(BrokerError::PropValidation {
                        prop: "count".into(),
                        reason: "must be a number".into(),
                    })
                }
                .boxed()
            }),
        );

        let err = consumer
            .send_request("explode", None, RequestOptions::default())
            .await
            .unwrap_err();
        match err {
            BrokerError::HandlerFailure(wire) => {
                assert_eq!(wire.name.as_deref(), Some("PropValidationFailure"));
                assert!(wire.message.contains("count"));
            }
            other => panic!("expected handler failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (consumer, _host) = endpoints();
        // No handler registered on the host: the request is acked by the
        // peer endpoint but never answered.
        let err = consumer
            .send_request("void", None, RequestOptions::default())
            .await
            .unwrap_err();
        match err {
            BrokerError::Timeout { name, timeout_ms } => {
                assert_eq!(name, "void");
                assert_eq!(timeout_ms, 10_000);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(consumer.stats().sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_override() {
        let (consumer, _host) = endpoints();
        let started = tokio::time::Instant::now();
        let err = consumer
            .send_request(
                "void",
                None,
                RequestOptions {
                    timeout: Some(Duration::from_millis(500)),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout { timeout_ms: 500, .. }));
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_suppresses_retransmits() {
        let (consumer, host) = endpoints();

        // Slow handler: acked immediately, answered after 3s. With the ack
        // in place no retransmit should ever fire.
        host.register_handler(
            "slow",
            handler_fn(|_, _| {
                async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Ok(Some(json!("done")))
                }
                .boxed()
            }),
        );

        let out = consumer
            .send_request("slow", None, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(out, Some(json!("done")));
        assert_eq!(consumer.stats().retransmits, 0);
    }

    #[tokio::test]
    async fn dispose_rejects_pending() {
        let (consumer, _host) = endpoints();
        let c2 = consumer.clone();
        let pending = tokio::spawn(async move {
            c2.send_request("void", None, RequestOptions::default()).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        consumer.dispose();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::EndpointClosed));

        // Further sends fail fast.
        let err = consumer
            .send_request("anything", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::EndpointClosed));
    }

    #[tokio::test]
    async fn frames_from_wrong_origin_are_dropped() {
        let (a, b) = window_pair(CONSUMER, "https://evil.example");
        let consumer = Endpoint::spawn(
            EndpointConfig::new("consumer", "uid_c", CONSUMER, HOST),
            a,
            None,
        );
        let evil = Endpoint::spawn(
            EndpointConfig::new("evil", "uid_e", "https://evil.example", CONSUMER),
            b,
            None,
        );

        let called = Arc::new(AtomicU64::new(0));
        let called2 = called.clone();
        consumer.register_handler(
            "steal",
            handler_fn(move |_, _| {
                called2.fetch_add(1, Ordering::Relaxed);
                async { Ok(None) }.boxed()
            }),
        );

        let err = evil
            .send_request(
                "steal",
                None,
                RequestOptions {
                    timeout: Some(Duration::from_millis(300)),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout { .. }));
        assert_eq!(called.load(Ordering::Relaxed), 0);
        assert!(consumer.stats().dropped_origin > 0);
    }

    #[tokio::test]
    async fn peer_uid_pinned_after_first_frame() {
        // Two hosts sharing one consumer channel would be a cross-talk bug;
        // the uid pin is what prevents it. Simulate by posting a forged
        // frame with a different uid directly into the consumer channel.
        let (a, b) = window_pair(CONSUMER, HOST);
        let port_to_consumer = b.port.clone();
        let consumer = Endpoint::spawn(
            EndpointConfig::new("consumer", "uid_c", CONSUMER, HOST),
            a,
            None,
        );
        let host = Endpoint::spawn(EndpointConfig::new("host", "uid_h", HOST, CONSUMER), b, None);

        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = hits.clone();
        consumer.register_handler(
            "mark",
            handler_fn(move |_, _| {
                hits2.fetch_add(1, Ordering::Relaxed);
                async { Ok(None) }.boxed()
            }),
        );

        // Legitimate first frame pins uid_h.
        host.send_request("mark", None, RequestOptions::default())
            .await
            .unwrap();

        // Forged frame with a different uid is dropped.
        let forged = Message::request(
            "uid_x/1",
            "mark",
            None,
            MessageSource::new("uid_x", HOST),
        );
        port_to_consumer.post(forged.encode(), "*").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(consumer.stats().dropped_peer_uid, 1);
    }

    #[tokio::test]
    async fn duplicate_request_not_reinvoked() {
        let (a, b) = window_pair(CONSUMER, HOST);
        let port_to_consumer = b.port.clone();
        let consumer = Endpoint::spawn(
            EndpointConfig::new("consumer", "uid_c", CONSUMER, HOST),
            a,
            None,
        );
        let _host_channel_kept_alive = b.rx;

        let hits = Arc::new(AtomicU64::new(0));
        let hits2 = hits.clone();
        consumer.register_handler(
            "once",
            handler_fn(move |_, _| {
                hits2.fetch_add(1, Ordering::Relaxed);
                async { Ok(None) }.boxed()
            }),
        );

        let dup = Message::request("uid_h/9", "once", None, MessageSource::new("uid_h", HOST));
        port_to_consumer.post(dup.encode(), "*").unwrap();
        port_to_consumer.post(dup.encode(), "*").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(consumer.stats().duplicate_requests, 1);
    }

    #[tokio::test]
    async fn concurrent_requests_correlate_out_of_order() {
        let (consumer, host) = endpoints();

        // Echo with a delay inversely proportional to the payload, so the
        // second request answers first.
        host.register_handler(
            "echo",
            handler_fn(|data, _| {
                async move {
                    let n = data.as_ref().and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(100 - 10 * n)).await;
                    Ok(Some(json!(n)))
                }
                .boxed()
            }),
        );

        let mut joins = Vec::new();
        for n in 0..5u64 {
            let c = consumer.clone();
            joins.push(tokio::spawn(async move {
                c.send_request("echo", Some(json!(n)), RequestOptions::default())
                    .await
                    .unwrap()
            }));
        }
        for (n, join) in joins.into_iter().enumerate() {
            assert_eq!(join.await.unwrap(), Some(json!(n as u64)));
        }
    }
}
