//! Builtin request names.
//!
//! These names are reserved on every endpoint; user-tokenised function
//! requests use opaque tokens that never collide with them (tokens carry the
//! `fn_` prefix).

/// Consumer ⇐ host: first request after the view loads, returns the initial
/// projected prop bag.
pub const HANDSHAKE: &str = "handshake";
/// Consumer ⇐ host: host finished installing props, swap in the real view.
pub const READY: &str = "ready";
/// Consumer ⇒ host: changed host-visible prop entries.
pub const PROP_UPDATE: &str = "propUpdate";
/// Host ⇒ consumer: apply new dimensions to the frame surface.
pub const RESIZE: &str = "resize";
/// Host ⇒ consumer: focus the frame surface.
pub const FOCUS: &str = "focus";
/// Either direction: tear the instance down.
pub const CLOSE: &str = "close";
/// Host ⇒ consumer: reveal the frame surface.
pub const SHOW: &str = "show";
/// Host ⇒ consumer: conceal the frame surface.
pub const HIDE: &str = "hide";
/// Host ⇒ consumer: deliver a value to the consumer's export sink.
pub const EXPORT: &str = "export";
/// Either direction: settle a marshalled promise token.
pub const SETTLE: &str = "settle";
/// Either direction: release a proxy token the far side dropped.
pub const RELEASE: &str = "release";

/// All builtin names, for collision checks.
pub const ALL: &[&str] = &[
    HANDSHAKE, READY, PROP_UPDATE, RESIZE, FOCUS, CLOSE, SHOW, HIDE, EXPORT, SETTLE, RELEASE,
];

/// True when `name` is reserved for the broker itself.
pub fn is_builtin(name: &str) -> bool {
    ALL.contains(&name)
}
