//! Prop schema as data.
//!
//! A component declares its props as a map of [`PropDefinition`]s: a tagged
//! kind plus the flags the projector reads when deciding what crosses the
//! boundary. The validator is pure; anything effectful (decorators, value
//! functions) receives an explicit [`PropCtx`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::value::{PropBag, PropValue};

/// Lifecycle callback props. Always consumer-local: invoked by the instance
/// controller in response to endpoint events, never marshalled to the host.
pub const LIFECYCLE_PROPS: &[&str] = &[
    "onRendered",
    "onClose",
    "onError",
    "onResize",
    "onFocus",
    "onProps",
    "onDisplay",
    "onPrerendered",
    "onPrerender",
    "onRender",
    "onDestroy",
];

/// True when `name` is a lifecycle callback prop.
pub fn is_lifecycle_prop(name: &str) -> bool {
    LIFECYCLE_PROPS.contains(&name)
}

/// Declared kind of a prop.
#[derive(Clone)]
pub enum PropKind {
    String,
    Number,
    Boolean,
    Function,
    Array,
    Object,
    /// Exactly this value.
    Literal(PropValue),
    /// One of these values.
    Enum(Vec<PropValue>),
    Any,
}

impl PropKind {
    pub fn expected_name(&self) -> &'static str {
        match self {
            PropKind::String => "string",
            PropKind::Number => "number",
            PropKind::Boolean => "boolean",
            PropKind::Function => "function",
            PropKind::Array => "array",
            PropKind::Object => "object",
            PropKind::Literal(_) => "literal",
            PropKind::Enum(_) => "enum",
            PropKind::Any => "any",
        }
    }

    /// Kind check. An array where an object is declared is a mismatch, not
    /// a coercion.
    pub fn check(&self, prop: &str, value: &PropValue) -> Result<(), BrokerError> {
        let ok = match self {
            PropKind::String => matches!(value, PropValue::String(_)),
            PropKind::Number => matches!(value, PropValue::Number(_)),
            PropKind::Boolean => matches!(value, PropValue::Bool(_)),
            PropKind::Function => matches!(value, PropValue::Function(_)),
            PropKind::Array => matches!(value, PropValue::Array(_)),
            PropKind::Object => matches!(value, PropValue::Object(_)),
            PropKind::Literal(expected) => value == expected,
            PropKind::Enum(options) => options.contains(value),
            PropKind::Any => true,
        };
        if ok {
            Ok(())
        } else {
            Err(BrokerError::SchemaTypeMismatch {
                prop: prop.to_string(),
                expected: self.expected_name(),
                actual: value.type_name(),
            })
        }
    }
}

impl std::fmt::Debug for PropKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.expected_name())
    }
}

/// Context handed to value functions, decorators, and validators.
pub struct PropCtx<'a> {
    pub props: &'a PropBag,
    pub peer_origin: &'a str,
    pub uid: &'a str,
    pub tag: &'a str,
}

/// Computes a prop value from context.
pub type ValueFn = Arc<dyn Fn(&PropCtx<'_>) -> PropValue + Send + Sync>;

/// Rewrites a prop value; `decorate` runs on the consumer view,
/// `host_decorate` on the surviving host view.
pub type DecorateFn = Arc<dyn Fn(PropValue, &PropCtx<'_>) -> PropValue + Send + Sync>;

/// User validator; an `Err` aborts `render`/`update_props`.
pub type ValidateFn = Arc<dyn Fn(&PropValue, &PropCtx<'_>) -> Result<(), String> + Send + Sync>;

/// Builds one query-string entry from a prop value.
pub type QueryTransform =
    Arc<dyn Fn(&str, &PropValue) -> Option<(String, String)> + Send + Sync>;

/// Where a default comes from.
#[derive(Clone)]
pub enum ValueSource {
    Literal(PropValue),
    Compute(ValueFn),
}

impl ValueSource {
    fn resolve(&self, ctx: &PropCtx<'_>) -> PropValue {
        match self {
            ValueSource::Literal(v) => v.clone(),
            ValueSource::Compute(f) => f(ctx),
        }
    }
}

/// How a prop projects into the remote URL query string.
#[derive(Clone)]
pub enum QueryParam {
    /// Use the prop's own name.
    Flag,
    /// Use this name.
    Name(String),
    /// Full control; return `None` to skip.
    Transform(QueryTransform),
}

/// External validator capability, so third-party schema libraries can
/// substitute for the built-in kind checks. Validation may suspend.
#[async_trait]
pub trait StandardSchema: Send + Sync {
    fn version(&self) -> u32;
    fn vendor(&self) -> &str;
    /// Returns the (possibly normalised) value, or a rejection reason.
    async fn validate(&self, value: &PropValue) -> Result<PropValue, String>;
}

/// One prop's declaration.
#[derive(Clone)]
pub struct PropDefinition {
    pub kind: PropKind,
    pub required: bool,
    /// Accepted input name when the canonical name is absent. When both are
    /// present the canonical name wins.
    pub alias: Option<String>,
    pub default: Option<ValueSource>,
    /// Overrides user input entirely when present.
    pub value: Option<ValueFn>,
    pub send_to_host: bool,
    /// Only project to a same-domain host.
    pub same_domain: bool,
    /// Only project when the peer origin is a member.
    pub trusted_domains: Option<Vec<String>>,
    pub query_param: Option<QueryParam>,
    pub decorate: Option<DecorateFn>,
    pub host_decorate: Option<DecorateFn>,
    pub validate: Option<ValidateFn>,
    pub standard: Option<Arc<dyn StandardSchema>>,
}

impl PropDefinition {
    pub fn of(kind: PropKind) -> Self {
        Self {
            kind,
            required: false,
            alias: None,
            default: None,
            value: None,
            send_to_host: true,
            same_domain: false,
            trusted_domains: None,
            query_param: None,
            decorate: None,
            host_decorate: None,
            validate: None,
            standard: None,
        }
    }

    pub fn string() -> Self {
        Self::of(PropKind::String)
    }

    pub fn number() -> Self {
        Self::of(PropKind::Number)
    }

    pub fn boolean() -> Self {
        Self::of(PropKind::Boolean)
    }

    pub fn function() -> Self {
        Self::of(PropKind::Function)
    }

    pub fn array() -> Self {
        Self::of(PropKind::Array)
    }

    pub fn object() -> Self {
        Self::of(PropKind::Object)
    }

    pub fn literal(value: impl Into<PropValue>) -> Self {
        Self::of(PropKind::Literal(value.into()))
    }

    pub fn one_of(options: impl IntoIterator<Item = PropValue>) -> Self {
        Self::of(PropKind::Enum(options.into_iter().collect()))
    }

    pub fn any() -> Self {
        Self::of(PropKind::Any)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<PropValue>) -> Self {
        self.default = Some(ValueSource::Literal(value.into()));
        self
    }

    pub fn default_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&PropCtx<'_>) -> PropValue + Send + Sync + 'static,
    {
        self.default = Some(ValueSource::Compute(Arc::new(f)));
        self
    }

    pub fn computed<F>(mut self, f: F) -> Self
    where
        F: Fn(&PropCtx<'_>) -> PropValue + Send + Sync + 'static,
    {
        self.value = Some(Arc::new(f));
        self
    }

    pub fn consumer_only(mut self) -> Self {
        self.send_to_host = false;
        self
    }

    pub fn same_domain_only(mut self) -> Self {
        self.same_domain = true;
        self
    }

    pub fn trusted_domains(mut self, domains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.trusted_domains = Some(domains.into_iter().map(Into::into).collect());
        self
    }

    pub fn query_param(mut self) -> Self {
        self.query_param = Some(QueryParam::Flag);
        self
    }

    pub fn query_param_named(mut self, name: impl Into<String>) -> Self {
        self.query_param = Some(QueryParam::Name(name.into()));
        self
    }

    pub fn query_param_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &PropValue) -> Option<(String, String)> + Send + Sync + 'static,
    {
        self.query_param = Some(QueryParam::Transform(Arc::new(f)));
        self
    }

    pub fn decorate<F>(mut self, f: F) -> Self
    where
        F: Fn(PropValue, &PropCtx<'_>) -> PropValue + Send + Sync + 'static,
    {
        self.decorate = Some(Arc::new(f));
        self
    }

    pub fn host_decorate<F>(mut self, f: F) -> Self
    where
        F: Fn(PropValue, &PropCtx<'_>) -> PropValue + Send + Sync + 'static,
    {
        self.host_decorate = Some(Arc::new(f));
        self
    }

    pub fn validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&PropValue, &PropCtx<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(f));
        self
    }

    pub fn standard(mut self, schema: Arc<dyn StandardSchema>) -> Self {
        self.standard = Some(schema);
        self
    }
}

/// A component's prop declarations, keyed by canonical name.
#[derive(Clone, Default)]
pub struct PropsSchema {
    entries: BTreeMap<String, PropDefinition>,
}

impl PropsSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prop(mut self, name: impl Into<String>, def: PropDefinition) -> Self {
        self.entries.insert(name.into(), def);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropDefinition> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropDefinition)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_checks() {
        assert!(PropKind::String.check("name", &PropValue::from("Ada")).is_ok());
        assert!(PropKind::Number.check("count", &PropValue::from(1.0)).is_ok());
        assert!(PropKind::Boolean.check("flag", &PropValue::from(true)).is_ok());
        assert!(PropKind::Object
            .check("cfg", &PropValue::Object(Default::default()))
            .is_ok());
        assert!(PropKind::Any.check("x", &PropValue::Null).is_ok());

        let err = PropKind::Number.check("count", &PropValue::from("7")).unwrap_err();
        match err {
            BrokerError::SchemaTypeMismatch { prop, expected, actual } => {
                assert_eq!(prop, "count");
                assert_eq!(expected, "number");
                assert_eq!(actual, "string");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn array_is_not_an_object() {
        let err = PropKind::Object
            .check("cfg", &PropValue::Array(vec![]))
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::SchemaTypeMismatch { expected: "object", actual: "array", .. }
        ));
    }

    #[test]
    fn literal_and_enum_kinds() {
        assert!(PropKind::Literal(PropValue::from("fixed"))
            .check("mode", &PropValue::from("fixed"))
            .is_ok());
        assert!(PropKind::Literal(PropValue::from("fixed"))
            .check("mode", &PropValue::from("loose"))
            .is_err());

        let kind = PropKind::Enum(vec![PropValue::from("a"), PropValue::from("b")]);
        assert!(kind.check("letter", &PropValue::from("b")).is_ok());
        assert!(kind.check("letter", &PropValue::from("c")).is_err());
    }

    #[test]
    fn lifecycle_prop_names() {
        assert!(is_lifecycle_prop("onRendered"));
        assert!(is_lifecycle_prop("onProps"));
        assert!(!is_lifecycle_prop("onGreet"));
        assert!(!is_lifecycle_prop("name"));
    }

    #[test]
    fn builder_defaults() {
        let def = PropDefinition::string();
        assert!(!def.required);
        assert!(def.send_to_host);
        assert!(!def.same_domain);
        assert!(def.alias.is_none());

        let def = PropDefinition::number()
            .required()
            .alias("n")
            .default_value(0.0);
        assert!(def.required);
        assert_eq!(def.alias.as_deref(), Some("n"));
        assert!(def.default.is_some());
    }
}
