//! forgeframe - cross-peer property-and-call broker
//!
//! Embeds a remote document as a component and gives both sides one typed
//! surface to exchange props, invoke each other's functions, and observe
//! lifecycle events, over nothing more than a text message channel.
//!
//! ## Sides
//!
//! - The **consumer** defines a component with [`create`], binds props with
//!   [`Component::init`], and renders into a [`surface::FrameSurface`].
//! - The **host** — the embedded document — calls [`host::attach`] with the
//!   same component definition and receives a [`host::LiveProps`] bag that
//!   stays in sync with the consumer's source of truth.
//!
//! Everything between them is the broker: prefixed-JSON frames
//! (`forgeproto`), a per-peer endpoint with ack-gated retransmit and
//! timeouts, a serializer that carries functions and promises as token
//! proxies, and a prop projector that decides what crosses the boundary.

pub mod cleanup;
pub mod consumer;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod host;
pub mod projector;
pub mod schema;
pub mod serializer;
pub mod surface;
pub mod transport;
pub mod types;
pub mod value;

pub use consumer::registry::{destroy_all, get_component};
pub use consumer::{create, AutoResize, Component, ComponentConfig, Instance, Stage};
pub use error::BrokerError;
pub use events::{EventEmitter, EventKind, EventSubscription};
pub use host::{attach, attach_current, is_consumer, is_host, ConsumerRef, LiveProps};
pub use schema::{PropDefinition, PropKind, PropsSchema, StandardSchema};
pub use surface::{FrameSurface, FrameView, HostWindow, InProcessSurface};
pub use types::{Dimension, Dimensions, RenderContext};
pub use value::{ErrorValue, PropBag, PropValue, RemoteFn, RemotePromise};
