//! Host-side controller.
//!
//! The embedded document calls [`attach`] with the window the consumer
//! opened and the shared component definition. Attach performs the
//! handshake, installs the live prop bag, and reports `ready`; user code
//! then works exclusively through [`LiveProps`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use forgeproto::{names, Message};

use crate::consumer::ComponentConfig;
use crate::endpoint::{handler_fn, Endpoint, EndpointConfig, RequestOptions};
use crate::error::BrokerError;
use crate::serializer::Serializer;
use crate::surface::{parse_window_name, HostWindow};
use crate::types::Dimensions;
use crate::value::{ErrorValue, PropBag, PropValue};

static CURRENT_WINDOW: LazyLock<Mutex<Option<Arc<HostWindow>>>> =
    LazyLock::new(|| Mutex::new(None));

/// Install the window this runtime was loaded into. The in-process surface
/// calls this in the playground; a real adapter would call it at startup.
pub fn set_current_window(window: Arc<HostWindow>) {
    *CURRENT_WINDOW.lock().expect("window lock") = Some(window);
}

pub fn clear_current_window() {
    *CURRENT_WINDOW.lock().expect("window lock") = None;
}

pub fn current_window() -> Option<Arc<HostWindow>> {
    CURRENT_WINDOW.lock().expect("window lock").clone()
}

/// True when the current window was opened by a ForgeFrame consumer.
pub fn is_host() -> bool {
    current_window()
        .map(|w| parse_window_name(&w.name).is_some())
        .unwrap_or(false)
}

/// True when this runtime embeds components rather than being embedded.
pub fn is_consumer() -> bool {
    !is_host()
}

/// Identity of the embedding page, as visible from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRef {
    pub uid: String,
    pub domain: String,
}

type PropsListener = Arc<dyn Fn(&PropBag) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&ErrorValue) + Send + Sync>;

/// Detaches a listener registered with `on_props`/`on_error`.
pub struct Unsubscriber(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscriber {
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

struct LivePropsInner {
    uid: String,
    tag: String,
    consumer_domain: String,
    endpoint: Endpoint,
    serializer: Serializer,
    props: Mutex<PropBag>,
    /// Sequence of the newest applied `propUpdate`; older deltas are stale.
    last_update_seq: Mutex<u64>,
    props_listeners: Arc<Mutex<HashMap<u64, PropsListener>>>,
    error_listeners: Arc<Mutex<HashMap<u64, ErrorListener>>>,
    next_listener_id: AtomicU64,
    closed: AtomicBool,
    content_size_tx: Mutex<Option<mpsc::UnboundedSender<Dimensions>>>,
}

/// The live prop bag delivered to host user code.
///
/// Identity is stable for the life of the instance; entries are replaced in
/// place on each `propUpdate` from the consumer.
#[derive(Clone)]
pub struct LiveProps {
    inner: Arc<LivePropsInner>,
}

impl LiveProps {
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn get_consumer(&self) -> ConsumerRef {
        ConsumerRef {
            uid: self.inner.uid.clone(),
            domain: self.inner.consumer_domain.clone(),
        }
    }

    pub fn get_consumer_domain(&self) -> String {
        self.inner.consumer_domain.clone()
    }

    /// Current value of one prop.
    pub fn get(&self, name: &str) -> Option<PropValue> {
        self.inner.props.lock().expect("props lock").get(name).cloned()
    }

    /// Copy of the whole bag.
    pub fn snapshot(&self) -> PropBag {
        self.inner.props.lock().expect("props lock").clone()
    }

    /// Call a function-valued prop.
    pub async fn call(&self, name: &str, args: Vec<PropValue>) -> Result<PropValue, BrokerError> {
        let f = self
            .get(name)
            .and_then(|v| v.as_function().cloned())
            .ok_or_else(|| BrokerError::PropValidation {
                prop: name.to_string(),
                reason: "not a function prop".into(),
            })?;
        f.call(args).await
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Observe prop updates; the listener receives each applied delta.
    pub fn on_props<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&PropBag) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .props_listeners
            .lock()
            .expect("listeners lock")
            .insert(id, Arc::new(listener));
        let listeners = self.inner.props_listeners.clone();
        Unsubscriber(Some(Box::new(move || {
            listeners.lock().expect("listeners lock").remove(&id);
        })))
    }

    /// Observe errors that would otherwise only be logged.
    pub fn on_error<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&ErrorValue) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .error_listeners
            .lock()
            .expect("listeners lock")
            .insert(id, Arc::new(listener));
        let listeners = self.inner.error_listeners.clone();
        Unsubscriber(Some(Box::new(move || {
            listeners.lock().expect("listeners lock").remove(&id);
        })))
    }

    /// Ask the consumer to close this component. Best-effort notify, then
    /// local teardown.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        info!(uid = %self.inner.uid, "host closing");
        self.inner.endpoint.notify(names::CLOSE, None);
        self.inner.serializer.purge();
        self.inner.endpoint.dispose();
        Ok(())
    }

    pub async fn focus(&self) -> Result<(), BrokerError> {
        self.request(names::FOCUS, None).await
    }

    pub async fn show(&self) -> Result<(), BrokerError> {
        self.request(names::SHOW, None).await
    }

    pub async fn hide(&self) -> Result<(), BrokerError> {
        self.request(names::HIDE, None).await
    }

    /// Resize the frame surface on the consumer side.
    pub async fn resize(&self, dims: &Dimensions) -> Result<(), BrokerError> {
        let data = serde_json::to_value(dims)
            .map_err(|e| BrokerError::Transport(format!("bad dimensions: {e}")))?;
        self.request(names::RESIZE, Some(data)).await
    }

    /// Deliver a value to the consumer's export sink.
    pub async fn export(&self, value: PropValue) -> Result<(), BrokerError> {
        let marshalled = self.inner.serializer.marshal(&value)?;
        self.request(names::EXPORT, Some(json!({ "value": marshalled })))
            .await
    }

    /// Report a new content size; the auto-resize driver throttles and
    /// forwards it as `resize` requests. No-op unless the component
    /// definition enabled `auto_resize`.
    pub fn content_resized(&self, dims: Dimensions) {
        if let Some(tx) = self
            .inner
            .content_size_tx
            .lock()
            .expect("content size lock")
            .as_ref()
        {
            let _ = tx.send(dims);
        }
    }

    async fn request(&self, name: &str, data: Option<Value>) -> Result<(), BrokerError> {
        if self.closed() {
            return Err(BrokerError::EndpointClosed);
        }
        self.inner
            .endpoint
            .send_request(name, data, RequestOptions::default())
            .await?;
        Ok(())
    }

    fn fire_props(&self, delta: &PropBag) {
        let listeners: Vec<PropsListener> = self
            .inner
            .props_listeners
            .lock()
            .expect("listeners lock")
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(delta);
        }
    }

    fn fire_error(&self, error: &ErrorValue) {
        let listeners: Vec<ErrorListener> = self
            .inner
            .error_listeners
            .lock()
            .expect("listeners lock")
            .values()
            .cloned()
            .collect();
        if listeners.is_empty() {
            warn!(uid = %self.inner.uid, error = %error.message, "host error with no listener");
        }
        for listener in listeners {
            listener(error);
        }
    }
}

impl std::fmt::Debug for LiveProps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveProps")
            .field("uid", &self.inner.uid)
            .field("tag", &self.inner.tag)
            .field("closed", &self.closed())
            .finish()
    }
}

fn domain_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.iter().any(|d| d == "*" || d == origin)
}

/// Attach to the window this host page was loaded into.
pub async fn attach(
    window: Arc<HostWindow>,
    config: &ComponentConfig,
) -> Result<LiveProps, BrokerError> {
    let (tag, uid) = parse_window_name(&window.name).ok_or_else(|| {
        BrokerError::InvalidConfig("window was not opened by a ForgeFrame consumer".into())
    })?;
    let own_domain = window.origin()?;

    // Referrer fallback chain collapses to the opener's origin in the
    // in-process surface.
    let peer_origin = window.referrer.clone().unwrap_or_else(|| "*".to_string());

    if !domain_allowed(&config.allowed_parent_domains, &peer_origin) {
        return Err(BrokerError::InvalidConfig(format!(
            "consumer origin {peer_origin} is not an allowed parent domain"
        )));
    }

    let channel = window
        .take_channel()
        .ok_or_else(|| BrokerError::Transport("window already attached".into()))?;

    let endpoint = Endpoint::spawn(
        EndpointConfig::new(format!("host:{uid}"), uid.clone(), own_domain, peer_origin.clone())
            .with_expected_peer(uid.clone())
            .with_timeout(config.timeout),
        channel,
        None,
    );
    let serializer = Serializer::attach(endpoint.clone());

    let live = LiveProps {
        inner: Arc::new(LivePropsInner {
            uid: uid.clone(),
            tag: tag.clone(),
            consumer_domain: peer_origin,
            endpoint: endpoint.clone(),
            serializer: serializer.clone(),
            props: Mutex::new(PropBag::new()),
            last_update_seq: Mutex::new(0),
            props_listeners: Arc::new(Mutex::new(HashMap::new())),
            error_listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            content_size_tx: Mutex::new(None),
        }),
    };

    // propUpdate → apply delta in place, oldest-wins-never: a delta whose
    // sequence is below the newest applied one is discarded.
    let update_live = live.clone();
    let update_ser = serializer.clone();
    endpoint.register_handler(
        names::PROP_UPDATE,
        handler_fn(move |data, meta| {
            let live = update_live.clone();
            let ser = update_ser.clone();
            async move {
                let seq = Message::sequence_of(&meta.id).unwrap_or(0);
                {
                    let mut last = live.inner.last_update_seq.lock().expect("seq lock");
                    if seq <= *last {
                        debug!(uid = %live.inner.uid, seq, newest = *last, "stale prop update discarded");
                        return Ok(None);
                    }
                    *last = seq;
                }

                let mut delta = PropBag::new();
                if let Some(entries) = data
                    .as_ref()
                    .and_then(|d| d.get("props"))
                    .and_then(Value::as_object)
                {
                    let mut props = live.inner.props.lock().expect("props lock");
                    for (name, wire) in entries {
                        let value = ser.unmarshal(wire);
                        if matches!(value, PropValue::Undefined) {
                            props.remove(name);
                        } else {
                            props.insert(name.clone(), value.clone());
                        }
                        delta.insert(name.clone(), value);
                    }
                }
                live.fire_props(&delta);
                Ok(None)
            }
            .boxed()
        }),
    );

    // Peer-initiated close.
    let close_live = live.clone();
    endpoint.register_handler(
        names::CLOSE,
        handler_fn(move |_data, _meta| {
            let live = close_live.clone();
            async move {
                if !live.inner.closed.swap(true, Ordering::Relaxed) {
                    info!(uid = %live.inner.uid, "consumer closed this component");
                    let live = live.clone();
                    tokio::spawn(async move {
                        live.inner.serializer.purge();
                        live.inner.endpoint.dispose();
                    });
                }
                Ok(None)
            }
            .boxed()
        }),
    );

    // The handshake doubles as our first outbound frame, which establishes
    // this uid with the consumer endpoint.
    let response = match endpoint
        .send_request(names::HANDSHAKE, None, RequestOptions::default())
        .await
    {
        Ok(r) => r,
        Err(e) => {
            serializer.purge();
            endpoint.dispose();
            return Err(e);
        }
    };

    if let Some(data) = &response {
        if let Some(remote_tag) = data.get("tag").and_then(Value::as_str) {
            if remote_tag != tag {
                debug!(window_tag = %tag, consumer_tag = %remote_tag, "tag mismatch at handshake");
            }
        }
        if let Some(entries) = data.get("props").and_then(Value::as_object) {
            let mut props = live.inner.props.lock().expect("props lock");
            for (name, wire) in entries {
                props.insert(name.clone(), serializer.unmarshal(wire));
            }
        }
    }

    if let Some(auto_resize) = &config.auto_resize {
        let (tx, rx) = mpsc::unbounded_channel();
        *live.inner.content_size_tx.lock().expect("content size lock") = Some(tx);
        spawn_auto_resize(live.clone(), auto_resize.clone(), rx);
    }

    if let Err(e) = endpoint
        .send_request(names::READY, None, RequestOptions::default())
        .await
    {
        serializer.purge();
        endpoint.dispose();
        return Err(e);
    }

    info!(uid = %uid, tag = %tag, "host attached");
    Ok(live)
}

/// Attach using the ambient current window.
pub async fn attach_current(config: &ComponentConfig) -> Result<LiveProps, BrokerError> {
    let window = current_window().ok_or_else(|| {
        BrokerError::InvalidConfig("no current window; this runtime is not a host".into())
    })?;
    attach(window, config).await
}

/// Forward observed content sizes as throttled `resize` requests: at most
/// one request per frame interval, latest size wins.
fn spawn_auto_resize(
    live: LiveProps,
    auto_resize: crate::consumer::AutoResize,
    mut rx: mpsc::UnboundedReceiver<Dimensions>,
) {
    const FRAME: std::time::Duration = std::time::Duration::from_millis(16);
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            // Coalesce everything already queued behind the first signal.
            let mut latest = first;
            while let Ok(next) = rx.try_recv() {
                latest = next;
            }

            let dims = Dimensions {
                width: auto_resize.width.then_some(latest.width).flatten(),
                height: auto_resize.height.then_some(latest.height).flatten(),
            };
            if dims.width.is_none() && dims.height.is_none() {
                continue;
            }
            if let Err(e) = live.resize(&dims).await {
                if matches!(e, BrokerError::EndpointClosed) {
                    break;
                }
                live.fire_error(&ErrorValue::from(&e));
            }
            tokio::time::sleep(FRAME).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::window_pair;

    #[test]
    fn domain_allowlist() {
        let any = vec!["*".to_string()];
        assert!(domain_allowed(&any, "https://anything.example"));

        let strict = vec!["https://consumer.example".to_string()];
        assert!(domain_allowed(&strict, "https://consumer.example"));
        assert!(!domain_allowed(&strict, "https://other.example"));
        assert!(!domain_allowed(&[], "https://consumer.example"));
    }

    #[tokio::test]
    async fn hostness_detection() {
        clear_current_window();
        assert!(!is_host());
        assert!(is_consumer());

        let (_a, b) = window_pair("https://consumer.example", "https://host.example");
        set_current_window(Arc::new(HostWindow::new(
            "__forgeframe__demo__uid_1__",
            "https://host.example/widget",
            Some("https://consumer.example".into()),
            b,
        )));
        assert!(is_host());
        assert!(!is_consumer());

        clear_current_window();
        assert!(!is_host());
    }

    #[tokio::test]
    async fn attach_rejects_foreign_window() {
        let (_a, b) = window_pair("https://consumer.example", "https://host.example");
        let window = Arc::new(HostWindow::new(
            "plain-window",
            "https://host.example/widget",
            None,
            b,
        ));
        let config = ComponentConfig::new("demo", "https://host.example/widget");
        assert!(matches!(
            attach(window, &config).await,
            Err(BrokerError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn attach_enforces_parent_allowlist() {
        let (_a, b) = window_pair("https://evil.example", "https://host.example");
        let window = Arc::new(HostWindow::new(
            "__forgeframe__demo__uid_1__",
            "https://host.example/widget",
            Some("https://evil.example".into()),
            b,
        ));
        let config = ComponentConfig::new("demo", "https://host.example/widget")
            .allowed_parent_domains(["https://consumer.example"]);
        let err = attach(window, &config).await.unwrap_err();
        match err {
            BrokerError::InvalidConfig(msg) => assert!(msg.contains("evil.example")),
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
