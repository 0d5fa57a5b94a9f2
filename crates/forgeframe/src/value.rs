//! The prop value tree.
//!
//! A prop bag is heterogeneous: JSON-like data plus functions, promises,
//! errors, and dates. Only the JSON-like subset crosses the wire directly;
//! the serializer replaces the rest with token placeholders.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::error::BrokerError;
use forgeproto::WireError;

/// An ordered user prop bag.
pub type PropBag = BTreeMap<String, PropValue>;

/// A value in a prop bag.
#[derive(Clone)]
pub enum PropValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<PropValue>),
    Object(BTreeMap<String, PropValue>),
    /// Callable; crosses the wire as a token proxy.
    Function(RemoteFn),
    /// One-shot awaitable; crosses the wire as a token settled later.
    Promise(RemotePromise),
    /// Shallow error record.
    Error(ErrorValue),
    /// Crosses as ISO-8601.
    Date(DateTime<Utc>),
    /// Distinct from `Null`, matching the source environment's two empties.
    Undefined,
}

impl PropValue {
    /// Variant name for diagnostics and schema mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropValue::Null => "null",
            PropValue::Bool(_) => "boolean",
            PropValue::Number(_) => "number",
            PropValue::String(_) => "string",
            PropValue::Array(_) => "array",
            PropValue::Object(_) => "object",
            PropValue::Function(_) => "function",
            PropValue::Promise(_) => "promise",
            PropValue::Error(_) => "error",
            PropValue::Date(_) => "date",
            PropValue::Undefined => "undefined",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&RemoteFn> {
        match self {
            PropValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn object(entries: impl IntoIterator<Item = (&'static str, PropValue)>) -> Self {
        PropValue::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

impl std::fmt::Debug for PropValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropValue::Null => write!(f, "Null"),
            PropValue::Bool(b) => write!(f, "Bool({})", b),
            PropValue::Number(n) => write!(f, "Number({})", n),
            PropValue::String(s) => write!(f, "String({:?})", s),
            PropValue::Array(a) => f.debug_tuple("Array").field(a).finish(),
            PropValue::Object(o) => f.debug_tuple("Object").field(o).finish(),
            PropValue::Function(func) => write!(f, "Function({})", func.token_hint()),
            PropValue::Promise(_) => write!(f, "Promise"),
            PropValue::Error(e) => f.debug_tuple("Error").field(e).finish(),
            PropValue::Date(d) => write!(f, "Date({})", d.to_rfc3339()),
            PropValue::Undefined => write!(f, "Undefined"),
        }
    }
}

impl PartialEq for PropValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropValue::Null, PropValue::Null) => true,
            (PropValue::Undefined, PropValue::Undefined) => true,
            (PropValue::Bool(a), PropValue::Bool(b)) => a == b,
            (PropValue::Number(a), PropValue::Number(b)) => a == b,
            (PropValue::String(a), PropValue::String(b)) => a == b,
            (PropValue::Array(a), PropValue::Array(b)) => a == b,
            (PropValue::Object(a), PropValue::Object(b)) => a == b,
            // Reference identity: equal iff literally the same callable.
            (PropValue::Function(a), PropValue::Function(b)) => a.same_as(b),
            (PropValue::Promise(a), PropValue::Promise(b)) => a.same_as(b),
            (PropValue::Error(a), PropValue::Error(b)) => a == b,
            (PropValue::Date(a), PropValue::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        PropValue::String(s.to_string())
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        PropValue::String(s)
    }
}

impl From<f64> for PropValue {
    fn from(n: f64) -> Self {
        PropValue::Number(n)
    }
}

impl From<i64> for PropValue {
    fn from(n: i64) -> Self {
        PropValue::Number(n as f64)
    }
}

impl From<i32> for PropValue {
    fn from(n: i32) -> Self {
        PropValue::Number(n as f64)
    }
}

impl From<bool> for PropValue {
    fn from(b: bool) -> Self {
        PropValue::Bool(b)
    }
}

/// The boxed async callable behind a [`RemoteFn`].
pub type FnImpl =
    dyn Fn(Vec<PropValue>) -> BoxFuture<'static, Result<PropValue, BrokerError>> + Send + Sync;

/// A callable prop.
///
/// Either a local closure supplied by user code, or a proxy reconstructed by
/// the serializer that forwards calls across the endpoint. Callers cannot
/// tell the difference; both suspend until the result is available.
#[derive(Clone)]
pub struct RemoteFn {
    inner: Arc<FnImpl>,
    /// Set on proxies: the far-side token this callable forwards to.
    proxy_token: Option<Arc<str>>,
}

impl RemoteFn {
    /// Wrap an async closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<PropValue>) -> BoxFuture<'static, Result<PropValue, BrokerError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            inner: Arc::new(f),
            proxy_token: None,
        }
    }

    /// Wrap a synchronous closure.
    pub fn from_sync<F>(f: F) -> Self
    where
        F: Fn(Vec<PropValue>) -> Result<PropValue, BrokerError> + Send + Sync + 'static,
    {
        Self::new(move |args| {
            let out = f(args);
            async move { out }.boxed()
        })
    }

    pub(crate) fn proxy<F>(token: Arc<str>, f: F) -> Self
    where
        F: Fn(Vec<PropValue>) -> BoxFuture<'static, Result<PropValue, BrokerError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            inner: Arc::new(f),
            proxy_token: Some(token),
        }
    }

    /// Invoke with marshalled-compatible arguments.
    pub async fn call(&self, args: Vec<PropValue>) -> Result<PropValue, BrokerError> {
        (self.inner)(args).await
    }

    /// Identity comparison; two clones of one callable are the same.
    pub fn same_as(&self, other: &RemoteFn) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Pointer identity key for proxy-table reuse.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// The far-side token when this callable is a proxy.
    pub(crate) fn proxy_token(&self) -> Option<&str> {
        self.proxy_token.as_deref()
    }

    fn token_hint(&self) -> &str {
        self.proxy_token.as_deref().unwrap_or("local")
    }
}

/// Settlement result of a [`RemotePromise`].
pub type Settlement = Result<PropValue, ErrorValue>;

type SharedSettlement = Shared<BoxFuture<'static, Settlement>>;

/// A one-shot awaitable prop.
///
/// Cloning shares the settlement; every clone observes the same outcome.
#[derive(Clone)]
pub struct RemotePromise {
    inner: SharedSettlement,
}

impl RemotePromise {
    /// Wrap a future that settles the promise.
    pub fn new<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Settlement> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }

    /// An already-resolved promise.
    pub fn resolved(value: PropValue) -> Self {
        Self::new(async move { Ok(value) })
    }

    /// An already-rejected promise.
    pub fn rejected(error: ErrorValue) -> Self {
        Self::new(async move { Err(error) })
    }

    /// A pending promise plus the settler that completes it.
    pub fn pending() -> (Self, PromiseSettler) {
        let (tx, rx) = oneshot::channel::<Settlement>();
        let promise = Self::new(async move {
            rx.await
                .unwrap_or_else(|_| Err(ErrorValue::new("promise settler dropped")))
        });
        (promise, PromiseSettler { tx })
    }

    /// Suspend until the promise settles.
    pub async fn wait(&self) -> Settlement {
        self.inner.clone().await
    }

    pub fn same_as(&self, other: &RemotePromise) -> bool {
        Shared::ptr_eq(&self.inner, &other.inner)
    }
}

/// Completes a pending [`RemotePromise`] exactly once.
pub struct PromiseSettler {
    tx: oneshot::Sender<Settlement>,
}

impl PromiseSettler {
    pub fn resolve(self, value: PropValue) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn reject(self, error: ErrorValue) {
        let _ = self.tx.send(Err(error));
    }

    pub fn settle(self, outcome: Settlement) {
        let _ = self.tx.send(outcome);
    }
}

/// Shallow error record; survives marshalling with the same fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub message: String,
    pub name: Option<String>,
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            stack: None,
        }
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: Some(name.into()),
            stack: None,
        }
    }
}

impl From<WireError> for ErrorValue {
    fn from(e: WireError) -> Self {
        Self {
            message: e.message,
            name: e.name,
            stack: e.stack,
        }
    }
}

impl From<ErrorValue> for WireError {
    fn from(e: ErrorValue) -> Self {
        WireError {
            message: e.message,
            name: e.name,
            stack: e.stack,
        }
    }
}

impl From<&BrokerError> for ErrorValue {
    fn from(e: &BrokerError) -> Self {
        ErrorValue::from(e.to_wire())
    }
}
