//! Consumer-side component factory and instance controller.
//!
//! `create(config)` validates a component definition and returns a factory;
//! `Component::init(props)` binds a prop bag to a fresh instance; `render`
//! drives the lifecycle state machine:
//!
//! ```text
//! Idle → Opening → Prerendered → Rendered
//!                    any non-terminal → Closing → Closed
//! ```
//!
//! The instance owns the view, the endpoint, and the cleanup stack; the
//! host side only ever owns its own listeners.

pub mod registry;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use forgeproto::names;

use crate::cleanup::CleanupStack;
use crate::endpoint::{handler_fn, Endpoint, EndpointConfig, RequestOptions, DEFAULT_TIMEOUT};
use crate::error::BrokerError;
use crate::events::{EventEmitter, EventKind};
use crate::projector::{diff_host_props, project, ProjectCtx};
use crate::schema::PropsSchema;
use crate::serializer::Serializer;
use crate::surface::{window_name_for, FrameSurface, FrameView, OpenRequest};
use crate::transport::origin_of;
use crate::types::{Dimensions, RenderContext};
use crate::value::{ErrorValue, PropBag, PropValue};

/// Template producing markup for the container or prerender view.
pub type TemplateFn = Arc<dyn Fn(&TemplateCtx<'_>) -> String + Send + Sync>;

/// Context handed to render templates.
pub struct TemplateCtx<'a> {
    pub uid: &'a str,
    pub tag: &'a str,
    pub dimensions: Option<&'a Dimensions>,
}

/// Host-driven automatic resizing configuration.
#[derive(Debug, Clone, Default)]
pub struct AutoResize {
    pub width: bool,
    pub height: bool,
    /// Selector of the observed content root; `None` observes the body.
    pub element: Option<String>,
}

/// Component definition shared by both sides of the boundary.
#[derive(Clone)]
pub struct ComponentConfig {
    pub tag: String,
    pub url: String,
    pub dimensions: Option<Dimensions>,
    pub style: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    pub props: PropsSchema,
    pub container_template: Option<TemplateFn>,
    pub prerender_template: Option<TemplateFn>,
    pub auto_resize: Option<AutoResize>,
    pub timeout: Duration,
    pub allowed_parent_domains: Vec<String>,
    pub trusted_domains: Vec<String>,
    pub context: RenderContext,
}

impl ComponentConfig {
    pub fn new(tag: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            url: url.into(),
            dimensions: None,
            style: BTreeMap::new(),
            attributes: BTreeMap::new(),
            props: PropsSchema::new(),
            container_template: None,
            prerender_template: None,
            auto_resize: None,
            timeout: DEFAULT_TIMEOUT,
            allowed_parent_domains: vec!["*".into()],
            trusted_domains: Vec::new(),
            context: RenderContext::Iframe,
        }
    }

    pub fn props(mut self, schema: PropsSchema) -> Self {
        self.props = schema;
        self
    }

    pub fn dimensions(mut self, dims: Dimensions) -> Self {
        self.dimensions = Some(dims);
        self
    }

    pub fn style(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.style.insert(key.into(), value.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn allowed_parent_domains(
        mut self,
        domains: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.allowed_parent_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn trusted_domains(mut self, domains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.trusted_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn context(mut self, context: RenderContext) -> Self {
        self.context = context;
        self
    }

    pub fn auto_resize(mut self, auto_resize: AutoResize) -> Self {
        self.auto_resize = Some(auto_resize);
        self
    }

    pub fn container_template<F>(mut self, f: F) -> Self
    where
        F: Fn(&TemplateCtx<'_>) -> String + Send + Sync + 'static,
    {
        self.container_template = Some(Arc::new(f));
        self
    }

    pub fn prerender_template<F>(mut self, f: F) -> Self
    where
        F: Fn(&TemplateCtx<'_>) -> String + Send + Sync + 'static,
    {
        self.prerender_template = Some(Arc::new(f));
        self
    }
}

/// Validate a component definition and build its factory.
pub fn create(config: ComponentConfig) -> Result<Component, BrokerError> {
    if config.tag.is_empty() {
        return Err(BrokerError::InvalidConfig("tag must not be empty".into()));
    }
    if config.tag.contains("__") {
        return Err(BrokerError::InvalidConfig(
            "tag must not contain double underscores".into(),
        ));
    }
    origin_of(&config.url)?;
    Ok(Component {
        config: Arc::new(config),
    })
}

/// Factory for instances of one component definition.
#[derive(Clone)]
pub struct Component {
    config: Arc<ComponentConfig>,
}

impl Component {
    pub fn tag(&self) -> &str {
        &self.config.tag
    }

    pub fn config(&self) -> &ComponentConfig {
        &self.config
    }

    /// Bind a prop bag to a fresh instance. Validation happens at `render`.
    pub fn init(&self, props: PropBag) -> Instance {
        let uid = format!("uid_{}", Uuid::new_v4().simple());
        Instance {
            inner: Arc::new(InstanceInner {
                uid,
                config: self.config.clone(),
                stage: Mutex::new(Stage::Idle),
                user_props: Mutex::new(props),
                effective_props: Mutex::new(PropBag::new()),
                host_props: Mutex::new(PropBag::new()),
                events: EventEmitter::new(),
                cleanup: CleanupStack::new(),
                endpoint: Mutex::new(None),
                serializer: Mutex::new(None),
                view: Mutex::new(None),
                exports: Mutex::new(PropValue::Undefined),
                render_waiter: Mutex::new(None),
            }),
        }
    }
}

/// Lifecycle stage; progresses monotonically except that failures route
/// through `Closing` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Opening,
    Prerendered,
    Rendered,
    Closing,
    Closed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Opening => "opening",
            Stage::Prerendered => "prerendered",
            Stage::Rendered => "rendered",
            Stage::Closing => "closing",
            Stage::Closed => "closed",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Stage::Closing | Stage::Closed)
    }
}

struct InstanceInner {
    uid: String,
    config: Arc<ComponentConfig>,
    stage: Mutex<Stage>,
    user_props: Mutex<PropBag>,
    effective_props: Mutex<PropBag>,
    host_props: Mutex<PropBag>,
    events: EventEmitter,
    cleanup: CleanupStack,
    endpoint: Mutex<Option<Endpoint>>,
    serializer: Mutex<Option<Serializer>>,
    view: Mutex<Option<Arc<dyn FrameView>>>,
    exports: Mutex<PropValue>,
    render_waiter: Mutex<Option<oneshot::Sender<Result<(), BrokerError>>>>,
}

/// A live component instance. Clones share state.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

impl Instance {
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    pub fn tag(&self) -> &str {
        &self.inner.config.tag
    }

    pub fn stage(&self) -> Stage {
        *self.inner.stage.lock().expect("stage lock")
    }

    pub fn event(&self) -> EventEmitter {
        self.inner.events.clone()
    }

    /// Value the host delivered via `export`, if any.
    pub fn exports(&self) -> PropValue {
        self.inner.exports.lock().expect("exports lock").clone()
    }

    /// Endpoint diagnostics, once rendered.
    pub fn endpoint_stats(&self) -> Option<crate::endpoint::EndpointStats> {
        self.inner
            .endpoint
            .lock()
            .expect("endpoint lock")
            .as_ref()
            .map(|e| e.stats())
    }

    /// Open the view and drive the instance to `Rendered`.
    pub async fn render(
        &self,
        surface: Arc<dyn FrameSurface>,
        container: &str,
        context: Option<RenderContext>,
    ) -> Result<(), BrokerError> {
        let context = context.unwrap_or(self.inner.config.context);
        self.advance(Stage::Opening)?;
        registry::register(self);
        self.inner.events.emit(EventKind::Render, &PropValue::Undefined);
        self.fire_prop("onRender", vec![]);

        match self.render_inner(surface, container, context).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    async fn render_inner(
        &self,
        surface: Arc<dyn FrameSurface>,
        container: &str,
        context: RenderContext,
    ) -> Result<(), BrokerError> {
        let config = &self.inner.config;
        let peer_origin = origin_of(&config.url)?;
        let own_origin = surface.origin();
        let same_domain = peer_origin == own_origin;

        // Validate and project the prop bag; a validation failure aborts
        // before anything is created.
        let user = self.inner.user_props.lock().expect("props lock").clone();
        let projection = project(
            &config.props,
            &user,
            &ProjectCtx {
                peer_origin: &peer_origin,
                same_domain,
                uid: &self.inner.uid,
                tag: &config.tag,
            },
        )
        .await?;

        // The builtin `timeout` prop tunes the endpoint; it never crosses.
        let timeout_override = projection
            .effective
            .get("timeout")
            .and_then(PropValue::as_number)
            .map(|ms| Duration::from_millis(ms as u64));
        let mut host_props = projection.host_props;
        host_props.remove("timeout");

        *self.inner.effective_props.lock().expect("props lock") = projection.effective;
        *self.inner.host_props.lock().expect("props lock") = host_props;

        let url = url_with_query(&config.url, &projection.query_params)?;

        if config.prerender_template.is_some() {
            self.inner.events.emit(EventKind::Prerender, &PropValue::Undefined);
            self.fire_prop("onPrerender", vec![]);
        }

        let view = surface
            .open(OpenRequest {
                window_name: window_name_for(&config.tag, &self.inner.uid),
                url,
                context,
                container: container.to_string(),
                dimensions: config.dimensions.clone(),
                style: config.style.clone(),
                attributes: config.attributes.clone(),
                prerender: config.prerender_template.is_some(),
            })
            .await?;

        let channel = view
            .take_channel()
            .ok_or_else(|| BrokerError::Transport("view yielded no channel".into()))?;

        {
            let cleanup_view = view.clone();
            self.inner
                .cleanup
                .register("destroy view", move || cleanup_view.destroy());
        }
        *self.inner.view.lock().expect("view lock") = Some(view);

        let (first_frame_tx, first_frame_rx) = oneshot::channel();
        let endpoint = Endpoint::spawn(
            EndpointConfig::new(
                format!("consumer:{}", self.inner.uid),
                self.inner.uid.clone(),
                own_origin,
                peer_origin,
            )
            .with_expected_peer(self.inner.uid.clone())
            .with_timeout(config.timeout),
            channel,
            Some(first_frame_tx),
        );
        endpoint.set_timeout_override(timeout_override);
        let serializer = Serializer::attach(endpoint.clone());

        {
            let cleanup_endpoint = endpoint.clone();
            let cleanup_serializer = serializer.clone();
            self.inner.cleanup.register("dispose endpoint", move || {
                cleanup_serializer.purge();
                cleanup_endpoint.dispose();
            });
        }
        *self.inner.endpoint.lock().expect("endpoint lock") = Some(endpoint.clone());
        *self.inner.serializer.lock().expect("serializer lock") = Some(serializer.clone());

        // First frame from the matching uid: the implicit handshake.
        let prerender_self = self.clone();
        tokio::spawn(async move {
            if first_frame_rx.await.is_ok() {
                if prerender_self.advance(Stage::Prerendered).is_ok() {
                    prerender_self
                        .inner
                        .events
                        .emit(EventKind::Prerendered, &PropValue::Undefined);
                    prerender_self.fire_prop("onPrerendered", vec![]);
                }
            }
        });

        self.register_builtin_handlers(&endpoint, &serializer);

        let (render_tx, render_rx) = oneshot::channel();
        *self.inner.render_waiter.lock().expect("waiter lock") = Some(render_tx);

        info!(uid = %self.inner.uid, tag = %config.tag, context = context.as_str(), "component opening");

        let timeout = timeout_override.unwrap_or(config.timeout);
        match tokio::time::timeout(timeout, render_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrokerError::EndpointClosed),
            Err(_) => Err(BrokerError::Timeout {
                name: "render".into(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn register_builtin_handlers(&self, endpoint: &Endpoint, serializer: &Serializer) {
        // handshake → initial host-projected prop bag.
        let hs_self = self.clone();
        let hs_ser = serializer.clone();
        endpoint.register_handler(
            names::HANDSHAKE,
            handler_fn(move |_data, _meta| {
                let this = hs_self.clone();
                let ser = hs_ser.clone();
                async move {
                    let host_props = this.inner.host_props.lock().expect("props lock").clone();
                    let mut marshalled = serde_json::Map::new();
                    for (name, value) in &host_props {
                        if let Some(v) = ser.marshal_top(value)? {
                            marshalled.insert(name.clone(), v);
                        }
                    }
                    Ok(Some(json!({
                        "tag": this.inner.config.tag,
                        "props": Value::Object(marshalled),
                    })))
                }
                .boxed()
            }),
        );

        // ready → host installed its props; swap in the real view.
        let ready_self = self.clone();
        endpoint.register_handler(
            names::READY,
            handler_fn(move |_data, _meta| {
                let this = ready_self.clone();
                async move {
                    this.advance(Stage::Rendered)?;
                    if let Some(view) = this.view() {
                        view.swap_prerender();
                    }
                    if let Some(tx) = this.inner.render_waiter.lock().expect("waiter lock").take() {
                        let _ = tx.send(Ok(()));
                    }
                    this.inner.events.emit(EventKind::Rendered, &PropValue::Undefined);
                    this.fire_prop("onRendered", vec![]);
                    Ok(None)
                }
                .boxed()
            }),
        );

        // resize → apply to the frame surface.
        let resize_self = self.clone();
        endpoint.register_handler(
            names::RESIZE,
            handler_fn(move |data, _meta| {
                let this = resize_self.clone();
                async move {
                    let dims: Dimensions = data
                        .map(serde_json::from_value)
                        .transpose()
                        .map_err(|e| BrokerError::Transport(format!("bad dimensions: {e}")))?
                        .unwrap_or_default();
                    this.apply_dimensions(&dims);
                    let payload = this.dims_payload(&dims);
                    this.inner.events.emit(EventKind::Resize, &payload);
                    this.fire_prop("onResize", vec![payload]);
                    Ok(None)
                }
                .boxed()
            }),
        );

        let focus_self = self.clone();
        endpoint.register_handler(
            names::FOCUS,
            handler_fn(move |_data, _meta| {
                let this = focus_self.clone();
                async move {
                    if let Some(view) = this.view() {
                        view.focus();
                    }
                    this.inner.events.emit(EventKind::Focus, &PropValue::Undefined);
                    this.fire_prop("onFocus", vec![]);
                    Ok(None)
                }
                .boxed()
            }),
        );

        let show_self = self.clone();
        endpoint.register_handler(
            names::SHOW,
            handler_fn(move |_data, _meta| {
                let this = show_self.clone();
                async move {
                    if let Some(view) = this.view() {
                        view.show();
                    }
                    this.inner.events.emit(EventKind::Show, &PropValue::Undefined);
                    this.inner
                        .events
                        .emit(EventKind::Display, &PropValue::Bool(true));
                    this.fire_prop("onDisplay", vec![PropValue::Bool(true)]);
                    Ok(None)
                }
                .boxed()
            }),
        );

        let hide_self = self.clone();
        endpoint.register_handler(
            names::HIDE,
            handler_fn(move |_data, _meta| {
                let this = hide_self.clone();
                async move {
                    if let Some(view) = this.view() {
                        view.hide();
                    }
                    this.inner.events.emit(EventKind::Hide, &PropValue::Undefined);
                    this.inner
                        .events
                        .emit(EventKind::Display, &PropValue::Bool(false));
                    this.fire_prop("onDisplay", vec![PropValue::Bool(false)]);
                    Ok(None)
                }
                .boxed()
            }),
        );

        // export → host hands a value to the consumer.
        let export_self = self.clone();
        let export_ser = serializer.clone();
        endpoint.register_handler(
            names::EXPORT,
            handler_fn(move |data, _meta| {
                let this = export_self.clone();
                let ser = export_ser.clone();
                async move {
                    let value = ser.unmarshal_top(data.as_ref().and_then(|d| d.get("value")));
                    *this.inner.exports.lock().expect("exports lock") = value;
                    Ok(None)
                }
                .boxed()
            }),
        );

        // close → peer-initiated teardown. Respond first, then tear down.
        let close_self = self.clone();
        endpoint.register_handler(
            names::CLOSE,
            handler_fn(move |_data, _meta| {
                let this = close_self.clone();
                async move {
                    tokio::spawn(async move {
                        let _ = this.close_with(None, false).await;
                    });
                    Ok(None)
                }
                .boxed()
            }),
        );
    }

    /// Merge a partial prop bag, re-project, and push the delta to the host.
    pub async fn update_props(&self, partial: PropBag) -> Result<(), BrokerError> {
        if self.stage().is_terminal() {
            return Err(BrokerError::EndpointClosed);
        }

        let merged: PropBag = {
            let current = self.inner.user_props.lock().expect("props lock");
            let mut merged = current.clone();
            merged.extend(partial);
            merged
        };

        let config = &self.inner.config;
        let peer_origin = origin_of(&config.url)?;
        let endpoint = self.endpoint().ok_or(BrokerError::EndpointClosed)?;
        let serializer = self
            .inner
            .serializer
            .lock()
            .expect("serializer lock")
            .clone()
            .ok_or(BrokerError::EndpointClosed)?;
        let same_domain = peer_origin == endpoint.own_domain();

        let projection = project(
            &config.props,
            &merged,
            &ProjectCtx {
                peer_origin: &peer_origin,
                same_domain,
                uid: &self.inner.uid,
                tag: &config.tag,
            },
        )
        .await?;

        let mut new_host = projection.host_props;
        new_host.remove("timeout");

        let delta = {
            let old_host = self.inner.host_props.lock().expect("props lock");
            diff_host_props(&old_host, &new_host)
        };

        *self.inner.user_props.lock().expect("props lock") = merged;
        *self.inner.effective_props.lock().expect("props lock") = projection.effective;
        *self.inner.host_props.lock().expect("props lock") = new_host;

        if delta.is_empty() {
            return Ok(());
        }

        let mut marshalled = serde_json::Map::new();
        for (name, value) in &delta {
            marshalled.insert(
                name.clone(),
                serializer.marshal(value)?,
            );
        }
        endpoint
            .send_request(
                names::PROP_UPDATE,
                Some(json!({ "props": Value::Object(marshalled) })),
                RequestOptions::default(),
            )
            .await?;

        let payload = PropValue::Object(delta);
        self.inner.events.emit(EventKind::Props, &payload);
        self.fire_prop("onProps", vec![payload]);
        Ok(())
    }

    /// Close the instance; the only cancellation primitive.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.close_with(None, true).await
    }

    async fn fail(&self, err: BrokerError) {
        let _ = self.close_with(Some(err), true).await;
    }

    async fn close_with(
        &self,
        err: Option<BrokerError>,
        notify_peer: bool,
    ) -> Result<(), BrokerError> {
        {
            let mut stage = self.inner.stage.lock().expect("stage lock");
            if stage.is_terminal() {
                return Ok(());
            }
            debug!(uid = %self.inner.uid, from = stage.as_str(), "closing");
            *stage = Stage::Closing;
        }

        // A render in flight learns the outcome before resources go away.
        if let Some(tx) = self.inner.render_waiter.lock().expect("waiter lock").take() {
            let _ = tx.send(Err(err.clone().unwrap_or(BrokerError::EndpointClosed)));
        }

        if let Some(err) = &err {
            let payload = PropValue::Error(ErrorValue::from(err));
            self.inner.events.emit(EventKind::Error, &payload);
            self.fire_prop("onError", vec![payload]);
        }

        self.inner.events.emit(EventKind::Close, &PropValue::Undefined);
        self.fire_prop("onClose", vec![]);

        if notify_peer {
            if let Some(endpoint) = self.endpoint() {
                if !endpoint.is_disposed() {
                    // Best effort; the peer may already be gone.
                    endpoint.notify(names::CLOSE, None);
                }
            }
        }

        self.inner.cleanup.run();

        *self.inner.stage.lock().expect("stage lock") = Stage::Closed;
        registry::unregister(&self.inner.uid);
        info!(uid = %self.inner.uid, "component closed");

        self.inner.events.emit(EventKind::Destroy, &PropValue::Undefined);
        self.fire_prop("onDestroy", vec![]);
        Ok(())
    }

    /// Focus the view locally.
    pub fn focus(&self) {
        if let Some(view) = self.view() {
            view.focus();
        }
        self.inner.events.emit(EventKind::Focus, &PropValue::Undefined);
    }

    /// Resize the view locally.
    pub fn resize(&self, dims: &Dimensions) {
        self.apply_dimensions(dims);
        let payload = self.dims_payload(dims);
        self.inner.events.emit(EventKind::Resize, &payload);
    }

    pub fn show(&self) {
        if let Some(view) = self.view() {
            view.show();
        }
        self.inner.events.emit(EventKind::Show, &PropValue::Undefined);
    }

    pub fn hide(&self) {
        if let Some(view) = self.view() {
            view.hide();
        }
        self.inner.events.emit(EventKind::Hide, &PropValue::Undefined);
    }

    fn advance(&self, to: Stage) -> Result<(), BrokerError> {
        let mut stage = self.inner.stage.lock().expect("stage lock");
        let allowed = matches!(
            (*stage, to),
            (Stage::Idle, Stage::Opening)
                | (Stage::Opening, Stage::Prerendered)
                | (Stage::Opening, Stage::Rendered)
                | (Stage::Prerendered, Stage::Rendered)
        );
        if !allowed {
            return Err(BrokerError::InvalidTransition {
                from: stage.as_str(),
                to: to.as_str(),
            });
        }
        debug!(uid = %self.inner.uid, from = stage.as_str(), to = to.as_str(), "stage advance");
        *stage = to;
        Ok(())
    }

    /// Invoke a lifecycle callback prop, detached; a failing callback is
    /// logged and reported on the error event, never propagated.
    fn fire_prop(&self, name: &str, args: Vec<PropValue>) {
        let f = {
            let props = self.inner.effective_props.lock().expect("props lock");
            props.get(name).and_then(|v| v.as_function().cloned())
        };
        if let Some(f) = f {
            let events = self.inner.events.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = f.call(args).await {
                    warn!(prop = %name, error = %e, "lifecycle callback failed");
                    events.emit(EventKind::Error, &PropValue::Error(ErrorValue::from(&e)));
                }
            });
        }
    }

    fn view(&self) -> Option<Arc<dyn FrameView>> {
        self.inner.view.lock().expect("view lock").clone()
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint.lock().expect("endpoint lock").clone()
    }

    fn apply_dimensions(&self, dims: &Dimensions) {
        if let Some(view) = self.view() {
            view.apply_dimensions(dims);
        }
    }

    fn dims_payload(&self, dims: &Dimensions) -> PropValue {
        let mut entries = BTreeMap::new();
        if let Some(w) = &dims.width {
            entries.insert(
                "width".to_string(),
                match w {
                    crate::types::Dimension::Px(n) => PropValue::Number(*n),
                    crate::types::Dimension::Css(s) => PropValue::String(s.clone()),
                },
            );
        }
        if let Some(h) = &dims.height {
            entries.insert(
                "height".to_string(),
                match h {
                    crate::types::Dimension::Px(n) => PropValue::Number(*n),
                    crate::types::Dimension::Css(s) => PropValue::String(s.clone()),
                },
            );
        }
        PropValue::Object(entries)
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("uid", &self.inner.uid)
            .field("tag", &self.inner.config.tag)
            .field("stage", &self.stage().as_str())
            .finish()
    }
}

fn url_with_query(base: &str, params: &[(String, String)]) -> Result<String, BrokerError> {
    let mut url = url::Url::parse(base)
        .map_err(|e| BrokerError::InvalidConfig(format!("unparseable url {base}: {e}")))?;
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in params {
            pairs.append_pair(k, v);
        }
    }
    Ok(url.into())
}
