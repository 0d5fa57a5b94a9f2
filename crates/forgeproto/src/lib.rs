//! forgeproto - Wire protocol types for the ForgeFrame cross-peer broker
//!
//! This crate defines the frame model and codec for messages exchanged
//! between a consumer page and its embedded host across a shared text
//! channel. The broker itself lives in the `forgeframe` crate; everything
//! here is pure data with no I/O.

pub mod frame;
pub mod names;

pub use frame::{FrameError, Message, MessageKind, MessageSource, WireError, WIRE_PREFIX};
