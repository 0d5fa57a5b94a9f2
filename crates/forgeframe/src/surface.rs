//! Frame surface seam.
//!
//! The surface is the external collaborator that creates and destroys the
//! embedded view. The broker drives it through [`FrameSurface`] and
//! [`FrameView`] and never assumes more than these traits promise. The
//! in-process implementation backs the test suites and the playground: an
//! "iframe" is a channel pair, a "popup" the same with a blockable knob.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::BrokerError;
use crate::transport::{origin_of, window_pair, WindowChannel};
use crate::types::{Dimensions, RenderContext};

/// Window-name payload marker. The consumer names the view with this shape
/// and the host detects hostness by parsing it back out.
const NAME_PREFIX: &str = "__forgeframe__";

/// Compose the window name carrying the instance identity.
pub fn window_name_for(tag: &str, uid: &str) -> String {
    format!("{NAME_PREFIX}{tag}__{uid}__")
}

/// Parse `(tag, uid)` out of a window name, or `None` for foreign windows.
pub fn parse_window_name(name: &str) -> Option<(String, String)> {
    let rest = name.strip_prefix(NAME_PREFIX)?.strip_suffix("__")?;
    let (tag, uid) = rest.split_once("__")?;
    if tag.is_empty() || uid.is_empty() {
        return None;
    }
    Some((tag.to_string(), uid.to_string()))
}

/// What the consumer controller asks the surface to create.
pub struct OpenRequest {
    pub window_name: String,
    /// Remote URL with query params already baked in.
    pub url: String,
    pub context: RenderContext,
    /// Container selector/handle in the embedding document.
    pub container: String,
    pub dimensions: Option<Dimensions>,
    pub style: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    /// Whether a prerender view should show until the host is ready.
    pub prerender: bool,
}

/// Creates views. One per embedding document.
#[async_trait]
pub trait FrameSurface: Send + Sync {
    /// Origin of the embedding document.
    fn origin(&self) -> String;

    /// Create the view and hand back its control handle. A blocked popup
    /// fails with [`BrokerError::PopupBlocked`] and creates nothing.
    async fn open(&self, req: OpenRequest) -> Result<Arc<dyn FrameView>, BrokerError>;
}

/// A live view the consumer controller owns.
pub trait FrameView: Send + Sync {
    /// The message channel to the embedded document. Yields once.
    fn take_channel(&self) -> Option<WindowChannel>;

    fn apply_dimensions(&self, dims: &Dimensions);
    fn dimensions(&self) -> Option<Dimensions>;
    fn show(&self);
    fn hide(&self);
    fn visible(&self) -> bool;
    fn focus(&self);
    /// Replace the prerender view with the real frame.
    fn swap_prerender(&self);
    fn prerender_active(&self) -> bool;
    fn destroy(&self);
    fn destroyed(&self) -> bool;
}

/// The embedded document's side of an opened view, as the host runtime
/// receives it: window name, final URL, referrer, and the message channel.
pub struct HostWindow {
    pub name: String,
    pub url: String,
    pub referrer: Option<String>,
    channel: Mutex<Option<WindowChannel>>,
}

impl HostWindow {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        referrer: Option<String>,
        channel: WindowChannel,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            referrer,
            channel: Mutex::new(Some(channel)),
        }
    }

    /// Own origin, derived from the loaded URL.
    pub fn origin(&self) -> Result<String, BrokerError> {
        origin_of(&self.url)
    }

    /// Query parameters baked into the URL by the consumer.
    pub fn query_params(&self) -> Vec<(String, String)> {
        url::Url::parse(&self.url)
            .map(|u| {
                u.query_pairs()
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn take_channel(&self) -> Option<WindowChannel> {
        self.channel.lock().expect("host window lock").take()
    }
}

/// In-process surface: views are channel pairs inside one runtime.
pub struct InProcessSurface {
    origin: String,
    popups_blocked: AtomicBool,
    windows: DashMap<String, Arc<HostWindow>>,
    views: DashMap<String, Arc<InProcessView>>,
}

impl InProcessSurface {
    pub fn new(origin: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            origin: origin.into(),
            popups_blocked: AtomicBool::new(false),
            windows: DashMap::new(),
            views: DashMap::new(),
        })
    }

    /// Simulate a popup blocker for tests.
    pub fn block_popups(&self) {
        self.popups_blocked.store(true, Ordering::Relaxed);
    }

    /// The host half of an opened view, keyed by instance uid.
    pub fn host_window(&self, uid: &str) -> Option<Arc<HostWindow>> {
        self.windows.get(uid).map(|w| w.clone())
    }

    /// The consumer-side view handle, for assertions.
    pub fn view(&self, uid: &str) -> Option<Arc<InProcessView>> {
        self.views.get(uid).map(|v| v.clone())
    }
}

#[async_trait]
impl FrameSurface for InProcessSurface {
    fn origin(&self) -> String {
        self.origin.clone()
    }

    async fn open(&self, req: OpenRequest) -> Result<Arc<dyn FrameView>, BrokerError> {
        if req.context == RenderContext::Popup && self.popups_blocked.load(Ordering::Relaxed) {
            return Err(BrokerError::PopupBlocked);
        }

        let host_origin = origin_of(&req.url)?;
        let (consumer_half, host_half) = window_pair(&self.origin, &host_origin);

        let view = Arc::new(InProcessView {
            context: req.context,
            container: req.container,
            dims: Mutex::new(req.dimensions),
            style: req.style,
            attributes: req.attributes,
            visible: AtomicBool::new(true),
            focus_count: AtomicU32::new(0),
            prerender: AtomicBool::new(req.prerender),
            destroyed: AtomicBool::new(false),
            channel: Mutex::new(Some(consumer_half)),
        });

        let host_window = Arc::new(HostWindow::new(
            req.window_name.clone(),
            req.url,
            Some(self.origin.clone()),
            host_half,
        ));

        if let Some((_, uid)) = parse_window_name(&req.window_name) {
            self.windows.insert(uid.clone(), host_window);
            self.views.insert(uid, view.clone());
        }

        Ok(view)
    }
}

/// In-process stand-in for an iframe element or popup handle.
pub struct InProcessView {
    pub context: RenderContext,
    pub container: String,
    dims: Mutex<Option<Dimensions>>,
    pub style: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    visible: AtomicBool,
    focus_count: AtomicU32,
    prerender: AtomicBool,
    destroyed: AtomicBool,
    channel: Mutex<Option<WindowChannel>>,
}

impl InProcessView {
    pub fn focus_count(&self) -> u32 {
        self.focus_count.load(Ordering::Relaxed)
    }
}

impl FrameView for InProcessView {
    fn take_channel(&self) -> Option<WindowChannel> {
        self.channel.lock().expect("view lock").take()
    }

    fn apply_dimensions(&self, dims: &Dimensions) {
        let mut current = self.dims.lock().expect("view lock");
        let merged = match current.as_ref() {
            Some(existing) => existing.merged_with(dims),
            None => dims.clone(),
        };
        *current = Some(merged);
    }

    fn dimensions(&self) -> Option<Dimensions> {
        self.dims.lock().expect("view lock").clone()
    }

    fn show(&self) {
        self.visible.store(true, Ordering::Relaxed);
    }

    fn hide(&self) {
        self.visible.store(false, Ordering::Relaxed);
    }

    fn visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    fn focus(&self) {
        self.focus_count.fetch_add(1, Ordering::Relaxed);
    }

    fn swap_prerender(&self) {
        self.prerender.store(false, Ordering::Relaxed);
    }

    fn prerender_active(&self) -> bool {
        self.prerender.load(Ordering::Relaxed)
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
        self.channel.lock().expect("view lock").take();
    }

    fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }
}
