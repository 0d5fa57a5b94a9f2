//! Value marshalling across the endpoint.
//!
//! Walks a [`PropValue`] tree into JSON-safe form before it crosses the
//! wire, replacing functions, promises, errors, and dates with tagged
//! placeholders; the inverse walk reconstructs live proxies on the
//! receiving side.
//!
//! ## Placeholders
//!
//! ```text
//! function  {"__kind":"fn","token":"fn_<uuid>"}
//! promise   {"__kind":"promise","token":"promise_<uuid>"}
//! error     {"__kind":"error","message":...,"name":?,"stack":?}
//! date      {"__kind":"date","iso":"2026-08-01T00:00:00+00:00"}
//! undefined {"__kind":"undef"}              (nested positions only)
//! ```
//!
//! Function tokens are registered as request handlers on the owning
//! endpoint; the far-side proxy is a callable that sends a request named by
//! the token. Promise tokens are one-shot: the owner pushes a `settle`
//! request when its promise settles. Objects whose `__kind` is not one of
//! the known tags pass through as plain data.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use forgeproto::names::{RELEASE, SETTLE};

use crate::endpoint::{handler_fn, Endpoint, RequestOptions};
use crate::error::BrokerError;
use crate::value::{ErrorValue, PromiseSettler, PropValue, RemoteFn, RemotePromise};

/// Nesting cap; a tree this deep is treated as cyclic and rejected.
pub const MAX_MARSHAL_DEPTH: usize = 64;

struct SerializerInner {
    endpoint: Endpoint,
    /// Local callable identity → token, so the same function crossing twice
    /// from its owner presents the same token to the far side.
    fn_tokens: DashMap<usize, String>,
    /// Far-owned promise tokens this side is waiting on.
    settlers: DashMap<String, PromiseSettler>,
    /// Settlements that arrived before their placeholder was unmarshalled;
    /// a fast-settling promise can overtake the frame carrying its token.
    early_settles: DashMap<String, Value>,
}

/// Bidirectional marshaller bound to one endpoint.
///
/// Clones share the proxy state. Created via [`Serializer::attach`], which
/// installs the `settle` and `release` builtin handlers.
#[derive(Clone)]
pub struct Serializer {
    inner: Arc<SerializerInner>,
}

impl Serializer {
    /// Bind to an endpoint and install the proxy builtins.
    pub fn attach(endpoint: Endpoint) -> Self {
        let ser = Self {
            inner: Arc::new(SerializerInner {
                endpoint: endpoint.clone(),
                fn_tokens: DashMap::new(),
                settlers: DashMap::new(),
                early_settles: DashMap::new(),
            }),
        };

        let settle_ser = ser.clone();
        endpoint.register_handler(
            SETTLE,
            handler_fn(move |data, _meta| {
                let ser = settle_ser.clone();
                async move {
                    ser.on_settle(data.unwrap_or(Value::Null));
                    Ok(None)
                }
                .boxed()
            }),
        );

        let release_ep = endpoint.clone();
        endpoint.register_handler(
            RELEASE,
            handler_fn(move |data, _meta| {
                let endpoint = release_ep.clone();
                async move {
                    if let Some(token) = data.as_ref().and_then(|d| d.get("token")).and_then(Value::as_str)
                    {
                        endpoint.remove_handler(token);
                    }
                    Ok(None)
                }
                .boxed()
            }),
        );

        ser
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Marshal a top-level value. `Undefined` is allowed directly here and
    /// becomes an absent payload.
    pub fn marshal_top(&self, value: &PropValue) -> Result<Option<Value>, BrokerError> {
        match value {
            PropValue::Undefined => Ok(None),
            other => Ok(Some(self.marshal_at(other, 0)?)),
        }
    }

    /// Marshal a nested value.
    pub fn marshal(&self, value: &PropValue) -> Result<Value, BrokerError> {
        self.marshal_at(value, 0)
    }

    fn marshal_at(&self, value: &PropValue, depth: usize) -> Result<Value, BrokerError> {
        if depth > MAX_MARSHAL_DEPTH {
            return Err(BrokerError::CyclicStructure);
        }
        Ok(match value {
            PropValue::Null => Value::Null,
            PropValue::Bool(b) => Value::Bool(*b),
            // Non-finite numbers have no JSON form; they cross as null.
            PropValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            PropValue::String(s) => Value::String(s.clone()),
            PropValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.marshal_at(v, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            PropValue::Object(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.clone(), self.marshal_at(v, depth + 1)?);
                }
                Value::Object(map)
            }
            PropValue::Function(f) => self.marshal_function(f),
            PropValue::Promise(p) => self.marshal_promise(p),
            PropValue::Error(e) => {
                let mut map = serde_json::Map::new();
                map.insert("__kind".into(), json!("error"));
                map.insert("message".into(), json!(e.message));
                if let Some(name) = &e.name {
                    map.insert("name".into(), json!(name));
                }
                if let Some(stack) = &e.stack {
                    map.insert("stack".into(), json!(stack));
                }
                Value::Object(map)
            }
            PropValue::Date(d) => json!({"__kind": "date", "iso": d.to_rfc3339()}),
            PropValue::Undefined => json!({"__kind": "undef"}),
        })
    }

    /// Register (or refresh) the token handler for a callable and emit its
    /// placeholder. Re-registration is deliberate: a token the far side
    /// released comes back to life if the function crosses again.
    fn marshal_function(&self, f: &RemoteFn) -> Value {
        let token = self
            .inner
            .fn_tokens
            .entry(f.identity())
            .or_insert_with(|| format!("fn_{}", Uuid::new_v4().simple()))
            .clone();

        let call_ser = self.clone();
        let call_f = f.clone();
        self.inner.endpoint.register_handler(
            token.clone(),
            handler_fn(move |data, _meta| {
                let ser = call_ser.clone();
                let f = call_f.clone();
                async move {
                    let args = data
                        .as_ref()
                        .and_then(|d| d.get("args"))
                        .and_then(Value::as_array)
                        .map(|items| items.iter().map(|v| ser.unmarshal(v)).collect())
                        .unwrap_or_default();
                    let out = f.call(args).await?;
                    Ok(ser
                        .marshal_top(&out)?
                        .map(|v| json!({ "result": v })))
                }
                .boxed()
            }),
        );

        json!({"__kind": "fn", "token": token})
    }

    /// One-shot: the owner subscribes and pushes `settle` when it resolves.
    fn marshal_promise(&self, p: &RemotePromise) -> Value {
        let token = format!("promise_{}", Uuid::new_v4().simple());

        let ser = self.clone();
        let promise = p.clone();
        let settle_token = token.clone();
        tokio::spawn(async move {
            let payload = match promise.wait().await {
                Ok(value) => match ser.marshal_top(&value) {
                    Ok(marshalled) => {
                        let mut obj = json!({"token": settle_token, "ok": true});
                        if let Some(v) = marshalled {
                            obj["value"] = v;
                        }
                        obj
                    }
                    Err(e) => json!({
                        "token": settle_token,
                        "ok": false,
                        "error": {"message": e.to_string(), "name": e.kind_name()},
                    }),
                },
                Err(e) => {
                    let mut err = json!({"message": e.message});
                    if let Some(name) = &e.name {
                        err["name"] = json!(name);
                    }
                    if let Some(stack) = &e.stack {
                        err["stack"] = json!(stack);
                    }
                    json!({"token": settle_token, "ok": false, "error": err})
                }
            };
            if let Err(e) = ser
                .inner
                .endpoint
                .send_request(SETTLE, Some(payload), RequestOptions::default())
                .await
            {
                debug!(error = %e, "promise settle not delivered");
            }
        });

        json!({"__kind": "promise", "token": token})
    }

    /// Reconstruct a live value from its wire form. Absent payloads are
    /// top-level `Undefined`.
    pub fn unmarshal_top(&self, value: Option<&Value>) -> PropValue {
        match value {
            None => PropValue::Undefined,
            Some(v) => self.unmarshal(v),
        }
    }

    /// Reconstruct a nested value.
    pub fn unmarshal(&self, value: &Value) -> PropValue {
        match value {
            Value::Null => PropValue::Null,
            Value::Bool(b) => PropValue::Bool(*b),
            Value::Number(n) => PropValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => PropValue::String(s.clone()),
            Value::Array(items) => {
                PropValue::Array(items.iter().map(|v| self.unmarshal(v)).collect())
            }
            Value::Object(map) => match map.get("__kind").and_then(Value::as_str) {
                Some("fn") => self.unmarshal_function(map),
                Some("promise") => self.unmarshal_promise(map),
                Some("error") => PropValue::Error(ErrorValue {
                    message: map
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: map.get("name").and_then(Value::as_str).map(String::from),
                    stack: map.get("stack").and_then(Value::as_str).map(String::from),
                }),
                Some("date") => {
                    let iso = map.get("iso").and_then(Value::as_str).unwrap_or_default();
                    match chrono::DateTime::parse_from_rfc3339(iso) {
                        Ok(d) => PropValue::Date(d.with_timezone(&chrono::Utc)),
                        // Keep the raw text rather than inventing a date.
                        Err(_) => PropValue::String(iso.to_string()),
                    }
                }
                Some("undef") => PropValue::Undefined,
                _ => PropValue::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), self.unmarshal(v)))
                        .collect::<BTreeMap<_, _>>(),
                ),
            },
        }
    }

    fn unmarshal_function(&self, map: &serde_json::Map<String, Value>) -> PropValue {
        let token: Arc<str> = map
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .into();

        // Dropping the last clone of the proxy tells the owner to release
        // the token.
        let guard = Arc::new(ReleaseGuard {
            token: token.to_string(),
            endpoint: self.inner.endpoint.clone(),
        });

        let ser = self.clone();
        let call_token = token.clone();
        let proxy = RemoteFn::proxy(token, move |args| {
            let ser = ser.clone();
            let token = call_token.clone();
            let _guard = guard.clone();
            async move {
                let marshalled: Vec<Value> = args
                    .iter()
                    .map(|a| ser.marshal(a))
                    .collect::<Result<_, _>>()?;
                let response = ser
                    .inner
                    .endpoint
                    .send_request(&token, Some(json!({ "args": marshalled })), RequestOptions::default())
                    .await?;
                Ok(match response {
                    None => PropValue::Undefined,
                    Some(data) => ser.unmarshal_top(data.get("result")),
                })
            }
            .boxed()
        });
        PropValue::Function(proxy)
    }

    fn unmarshal_promise(&self, map: &serde_json::Map<String, Value>) -> PropValue {
        let token = map
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let (promise, settler) = RemotePromise::pending();
        match self.inner.early_settles.remove(&token) {
            Some((_, payload)) => self.apply_settlement(settler, &payload),
            None => {
                self.inner.settlers.insert(token, settler);
            }
        }
        PropValue::Promise(promise)
    }

    fn on_settle(&self, data: Value) {
        let Some(token) = data.get("token").and_then(Value::as_str) else {
            return;
        };
        match self.inner.settlers.remove(token) {
            Some((_, settler)) => self.apply_settlement(settler, &data),
            None => {
                debug!(%token, "settle before placeholder; buffering");
                self.inner.early_settles.insert(token.to_string(), data);
            }
        }
    }

    fn apply_settlement(&self, settler: PromiseSettler, data: &Value) {
        if data.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            settler.resolve(self.unmarshal_top(data.get("value")));
        } else {
            let err = data.get("error");
            settler.reject(ErrorValue {
                message: err
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("promise rejected")
                    .to_string(),
                name: err
                    .and_then(|e| e.get("name"))
                    .and_then(Value::as_str)
                    .map(String::from),
                stack: err
                    .and_then(|e| e.get("stack"))
                    .and_then(Value::as_str)
                    .map(String::from),
            });
        }
    }

    /// Drop all proxy state. Pending far-owned promises reject; called on
    /// endpoint disposal.
    pub fn purge(&self) {
        self.inner.fn_tokens.clear();
        self.inner.early_settles.clear();
        let tokens: Vec<String> = self
            .inner
            .settlers
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for token in tokens {
            if let Some((_, settler)) = self.inner.settlers.remove(&token) {
                settler.reject(ErrorValue::named("EndpointClosed", "endpoint closed"));
            }
        }
    }
}

struct ReleaseGuard {
    token: String,
    endpoint: Endpoint,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.endpoint.is_disposed() {
            self.endpoint
                .notify(RELEASE, Some(json!({ "token": self.token })));
        }
    }
}
