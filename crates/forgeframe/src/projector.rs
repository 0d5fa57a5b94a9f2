//! Prop projection.
//!
//! Computes the views of a user prop bag: the consumer-local effective bag,
//! the host-visible subset, and the query-string entries baked into the
//! remote URL. Also produces the delta sent by `update_props`.
//!
//! Per-prop pipeline, in order: resolve the effective value (alias-resolved
//! user input, then `value(ctx)`, then `default`), required check, built-in
//! kind check (or the standard-schema validator when one is attached),
//! `decorate`, user `validate`, redaction, `host_decorate`, query
//! projection.

use serde_json::Value;

use crate::error::BrokerError;
use crate::schema::{is_lifecycle_prop, PropCtx, PropDefinition, PropsSchema, QueryParam, ValueSource};
use crate::value::{PropBag, PropValue};

/// Inputs the projector needs beyond the bag and schema.
pub struct ProjectCtx<'a> {
    pub peer_origin: &'a str,
    pub same_domain: bool,
    pub uid: &'a str,
    pub tag: &'a str,
}

/// The three computed views.
#[derive(Debug, Default)]
pub struct Projection {
    /// Full consumer-local bag after defaults and decoration.
    pub effective: PropBag,
    /// What crosses to the host, after redaction and `host_decorate`.
    pub host_props: PropBag,
    /// Entries appended to the remote URL.
    pub query_params: Vec<(String, String)>,
}

/// Project `user` through `schema`.
///
/// Fails on the first invalid prop; `render` and `update_props` abort on
/// that failure without any partial effect on the host.
pub async fn project(
    schema: &PropsSchema,
    user: &PropBag,
    ctx: &ProjectCtx<'_>,
) -> Result<Projection, BrokerError> {
    let mut out = Projection::default();

    // Props without a declaration pass through untouched; lifecycle
    // callbacks stay consumer-local whether declared or not.
    for (name, value) in user {
        if schema.get(name).is_none() && !is_alias_of(schema, name) {
            out.effective.insert(name.clone(), value.clone());
            if !is_lifecycle_prop(name) {
                out.host_props.insert(name.clone(), value.clone());
            }
        }
    }

    for (name, def) in schema.iter() {
        let prop_ctx = PropCtx {
            props: user,
            peer_origin: ctx.peer_origin,
            uid: ctx.uid,
            tag: ctx.tag,
        };

        let mut value = match resolve_effective(name, def, user, &prop_ctx) {
            Some(v) => v,
            None => {
                if def.required {
                    return Err(BrokerError::SchemaRequired { prop: name.clone() });
                }
                continue;
            }
        };

        match &def.standard {
            Some(standard) => {
                value = standard.validate(&value).await.map_err(|reason| {
                    BrokerError::AsyncSchemaRejected {
                        prop: name.clone(),
                        reason,
                    }
                })?;
            }
            None => def.kind.check(name, &value)?,
        }

        if let Some(decorate) = &def.decorate {
            value = decorate(value, &prop_ctx);
        }

        if let Some(validate) = &def.validate {
            validate(&value, &prop_ctx).map_err(|reason| BrokerError::PropValidation {
                prop: name.clone(),
                reason,
            })?;
        }

        out.effective.insert(name.clone(), value.clone());

        if let Some((qp_name, qp_value)) = query_entry(name, def, &value) {
            out.query_params.push((qp_name, qp_value));
        }

        if projects_to_host(name, def, ctx) {
            let host_value = match &def.host_decorate {
                Some(host_decorate) => host_decorate(value, &prop_ctx),
                None => value,
            };
            out.host_props.insert(name.clone(), host_value);
        }
    }

    Ok(out)
}

/// Host-visible entries that changed between two projections. Keys that
/// disappeared are carried as `Undefined` so the host deletes them.
pub fn diff_host_props(old: &PropBag, new: &PropBag) -> PropBag {
    let mut delta = PropBag::new();
    for (name, value) in new {
        if old.get(name) != Some(value) {
            delta.insert(name.clone(), value.clone());
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            delta.insert(name.clone(), PropValue::Undefined);
        }
    }
    delta
}

fn is_alias_of(schema: &PropsSchema, name: &str) -> bool {
    schema.iter().any(|(_, def)| def.alias.as_deref() == Some(name))
}

fn resolve_effective(
    name: &str,
    def: &PropDefinition,
    user: &PropBag,
    ctx: &PropCtx<'_>,
) -> Option<PropValue> {
    // Canonical name wins over its alias when both are present.
    let input = user
        .get(name)
        .or_else(|| def.alias.as_deref().and_then(|alias| user.get(alias)))
        .filter(|v| !matches!(v, PropValue::Undefined));

    if let Some(v) = input {
        return Some(v.clone());
    }
    if let Some(value_fn) = &def.value {
        return Some(value_fn(ctx));
    }
    if let Some(default) = &def.default {
        return Some(match default {
            ValueSource::Literal(v) => v.clone(),
            ValueSource::Compute(f) => f(ctx),
        });
    }
    None
}

fn projects_to_host(name: &str, def: &PropDefinition, ctx: &ProjectCtx<'_>) -> bool {
    if is_lifecycle_prop(name) || !def.send_to_host {
        return false;
    }
    if def.same_domain && !ctx.same_domain {
        return false;
    }
    if let Some(trusted) = &def.trusted_domains {
        if !trusted
            .iter()
            .any(|d| d == "*" || d == ctx.peer_origin)
        {
            return false;
        }
    }
    true
}

fn query_entry(name: &str, def: &PropDefinition, value: &PropValue) -> Option<(String, String)> {
    let qp = def.query_param.as_ref()?;
    match qp {
        QueryParam::Transform(f) => f(name, value),
        QueryParam::Flag | QueryParam::Name(_) => {
            let key = match qp {
                QueryParam::Name(n) => n.clone(),
                _ => name.to_string(),
            };
            query_stringify(value).map(|s| (key, s))
        }
    }
}

/// Render a prop value for the query string. Functions, promises,
/// undefined, and null are skipped; structured data is JSON-stringified.
fn query_stringify(value: &PropValue) -> Option<String> {
    match value {
        PropValue::String(s) => Some(s.clone()),
        PropValue::Number(n) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
        PropValue::Number(n) => Some(n.to_string()),
        PropValue::Bool(b) => Some(b.to_string()),
        PropValue::Date(d) => Some(d.to_rfc3339()),
        PropValue::Array(_) | PropValue::Object(_) => {
            plain_json(value).map(|v| v.to_string())
        }
        PropValue::Function(_)
        | PropValue::Promise(_)
        | PropValue::Error(_)
        | PropValue::Undefined
        | PropValue::Null => None,
    }
}

/// Data-only JSON rendering; non-data leaves are omitted.
fn plain_json(value: &PropValue) -> Option<Value> {
    match value {
        PropValue::Null => Some(Value::Null),
        PropValue::Bool(b) => Some(Value::Bool(*b)),
        PropValue::Number(n) => serde_json::Number::from_f64(*n).map(Value::Number),
        PropValue::String(s) => Some(Value::String(s.clone())),
        PropValue::Date(d) => Some(Value::String(d.to_rfc3339())),
        PropValue::Array(items) => Some(Value::Array(
            items.iter().filter_map(plain_json).collect(),
        )),
        PropValue::Object(entries) => Some(Value::Object(
            entries
                .iter()
                .filter_map(|(k, v)| plain_json(v).map(|v| (k.clone(), v)))
                .collect(),
        )),
        PropValue::Function(_) | PropValue::Promise(_) | PropValue::Error(_) | PropValue::Undefined => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PropDefinition, StandardSchema};
    use crate::value::RemoteFn;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const HOST_ORIGIN: &str = "https://host.example";

    fn ctx() -> ProjectCtx<'static> {
        ProjectCtx {
            peer_origin: HOST_ORIGIN,
            same_domain: false,
            uid: "uid_1",
            tag: "demo",
        }
    }

    fn bag(entries: Vec<(&str, PropValue)>) -> PropBag {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[tokio::test]
    async fn defaults_and_requireds() {
        let schema = PropsSchema::new()
            .prop("name", PropDefinition::string().required())
            .prop("count", PropDefinition::number().default_value(0.0));

        let projection = project(&schema, &bag(vec![("name", "Ada".into())]), &ctx())
            .await
            .unwrap();
        assert_eq!(projection.effective.get("count"), Some(&PropValue::Number(0.0)));
        assert_eq!(projection.host_props.get("name"), Some(&PropValue::String("Ada".into())));

        let err = project(&schema, &bag(vec![]), &ctx()).await.unwrap_err();
        assert!(matches!(err, BrokerError::SchemaRequired { prop } if prop == "name"));
    }

    #[tokio::test]
    async fn consumer_only_props_redacted() {
        let schema = PropsSchema::new()
            .prop("secret", PropDefinition::string().consumer_only())
            .prop("visible", PropDefinition::string());

        let projection = project(
            &schema,
            &bag(vec![("secret", "s3cr3t".into()), ("visible", "ok".into())]),
            &ctx(),
        )
        .await
        .unwrap();

        assert!(projection.effective.contains_key("secret"));
        assert!(!projection.host_props.contains_key("secret"));
        assert!(projection.host_props.contains_key("visible"));
    }

    #[tokio::test]
    async fn same_domain_props_redacted_cross_domain() {
        let schema = PropsSchema::new().prop("token", PropDefinition::string().same_domain_only());
        let user = bag(vec![("token", "t".into())]);

        let cross = project(&schema, &user, &ctx()).await.unwrap();
        assert!(!cross.host_props.contains_key("token"));

        let same = project(
            &schema,
            &user,
            &ProjectCtx {
                same_domain: true,
                ..ctx()
            },
        )
        .await
        .unwrap();
        assert!(same.host_props.contains_key("token"));
    }

    #[tokio::test]
    async fn trusted_domains_whitelist() {
        let schema = PropsSchema::new().prop(
            "apiKey",
            PropDefinition::string().trusted_domains(["https://partner.example"]),
        );
        let user = bag(vec![("apiKey", "k".into())]);

        let untrusted = project(&schema, &user, &ctx()).await.unwrap();
        assert!(!untrusted.host_props.contains_key("apiKey"));

        let trusted = project(
            &schema,
            &user,
            &ProjectCtx {
                peer_origin: "https://partner.example",
                ..ctx()
            },
        )
        .await
        .unwrap();
        assert!(trusted.host_props.contains_key("apiKey"));
    }

    #[tokio::test]
    async fn decorate_runs_before_host_decorate() {
        let schema = PropsSchema::new().prop(
            "greeting",
            PropDefinition::string()
                .decorate(|v, _| {
                    PropValue::String(format!("{}-decorated", v.as_str().unwrap_or_default()))
                })
                .host_decorate(|v, _| {
                    PropValue::String(format!("{}-hosted", v.as_str().unwrap_or_default()))
                }),
        );

        let projection = project(&schema, &bag(vec![("greeting", "hi".into())]), &ctx())
            .await
            .unwrap();
        assert_eq!(
            projection.effective.get("greeting"),
            Some(&PropValue::String("hi-decorated".into()))
        );
        assert_eq!(
            projection.host_props.get("greeting"),
            Some(&PropValue::String("hi-decorated-hosted".into()))
        );
    }

    #[tokio::test]
    async fn canonical_name_wins_over_alias() {
        let schema = PropsSchema::new().prop("color", PropDefinition::string().alias("colour"));

        let projection = project(
            &schema,
            &bag(vec![("color", "red".into()), ("colour", "rouge".into())]),
            &ctx(),
        )
        .await
        .unwrap();
        assert_eq!(
            projection.effective.get("color"),
            Some(&PropValue::String("red".into()))
        );
        // The alias key itself does not leak through as an unknown prop.
        assert!(!projection.host_props.contains_key("colour"));

        let alias_only = project(&schema, &bag(vec![("colour", "rouge".into())]), &ctx())
            .await
            .unwrap();
        assert_eq!(
            alias_only.effective.get("color"),
            Some(&PropValue::String("rouge".into()))
        );
    }

    #[tokio::test]
    async fn validate_failure_aborts() {
        let schema = PropsSchema::new().prop(
            "count",
            PropDefinition::number().validate(|v, _| {
                if v.as_number().unwrap_or(0.0) < 0.0 {
                    Err("must be non-negative".into())
                } else {
                    Ok(())
                }
            }),
        );

        let err = project(&schema, &bag(vec![("count", (-1.0).into())]), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PropValidation { prop, .. } if prop == "count"));
    }

    #[tokio::test]
    async fn computed_and_default_precedence() {
        let schema = PropsSchema::new()
            .prop(
                "origin",
                PropDefinition::string().computed(|ctx| PropValue::String(ctx.peer_origin.into())),
            )
            .prop("mode", PropDefinition::string().default_value("auto"));

        // User input wins over value(ctx); value(ctx) wins over default.
        let projection = project(&schema, &bag(vec![("origin", "custom".into())]), &ctx())
            .await
            .unwrap();
        assert_eq!(
            projection.effective.get("origin"),
            Some(&PropValue::String("custom".into()))
        );

        let projection = project(&schema, &bag(vec![]), &ctx()).await.unwrap();
        assert_eq!(
            projection.effective.get("origin"),
            Some(&PropValue::String(HOST_ORIGIN.into()))
        );
        assert_eq!(
            projection.effective.get("mode"),
            Some(&PropValue::String("auto".into()))
        );
    }

    #[tokio::test]
    async fn query_param_projection() {
        let schema = PropsSchema::new()
            .prop("page", PropDefinition::number().query_param())
            .prop("label", PropDefinition::string().query_param_named("l"))
            .prop("config", PropDefinition::object().query_param())
            .prop("onPick", PropDefinition::function().query_param());

        let projection = project(
            &schema,
            &bag(vec![
                ("page", 3.0.into()),
                ("label", "hi there".into()),
                (
                    "config",
                    PropValue::object([("depth", 2.0.into())]),
                ),
                (
                    "onPick",
                    PropValue::Function(RemoteFn::from_sync(|_| Ok(PropValue::Null))),
                ),
            ]),
            &ctx(),
        )
        .await
        .unwrap();

        let mut params = projection.query_params.clone();
        params.sort();
        assert_eq!(
            params,
            vec![
                ("config".to_string(), "{\"depth\":2.0}".to_string()),
                ("l".to_string(), "hi there".to_string()),
                ("page".to_string(), "3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn lifecycle_props_never_cross() {
        let schema = PropsSchema::new().prop("onRendered", PropDefinition::function());
        let noop = PropValue::Function(RemoteFn::from_sync(|_| Ok(PropValue::Undefined)));

        let projection = project(&schema, &bag(vec![("onRendered", noop.clone())]), &ctx())
            .await
            .unwrap();
        assert!(projection.effective.contains_key("onRendered"));
        assert!(!projection.host_props.contains_key("onRendered"));

        // Undeclared lifecycle callbacks stay local too.
        let projection = project(&PropsSchema::new(), &bag(vec![("onClose", noop)]), &ctx())
            .await
            .unwrap();
        assert!(!projection.host_props.contains_key("onClose"));
    }

    struct UppercaseSchema;

    #[async_trait]
    impl StandardSchema for UppercaseSchema {
        fn version(&self) -> u32 {
            1
        }
        fn vendor(&self) -> &str {
            "uppercase"
        }
        async fn validate(&self, value: &PropValue) -> Result<PropValue, String> {
            match value {
                PropValue::String(s) => Ok(PropValue::String(s.to_uppercase())),
                other => Err(format!("expected string, got {}", other.type_name())),
            }
        }
    }

    #[tokio::test]
    async fn standard_schema_substitutes() {
        let schema = PropsSchema::new().prop(
            "code",
            PropDefinition::string().standard(Arc::new(UppercaseSchema)),
        );

        let projection = project(&schema, &bag(vec![("code", "abc".into())]), &ctx())
            .await
            .unwrap();
        assert_eq!(
            projection.effective.get("code"),
            Some(&PropValue::String("ABC".into()))
        );

        let err = project(&schema, &bag(vec![("code", 1.0.into())]), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AsyncSchemaRejected { prop, .. } if prop == "code"));
    }

    #[test]
    fn diff_detects_changes_and_removals() {
        let old = bag(vec![("a", 1.0.into()), ("b", "x".into()), ("gone", true.into())]);
        let new = bag(vec![("a", 1.0.into()), ("b", "y".into()), ("fresh", 9.0.into())]);

        let delta = diff_host_props(&old, &new);
        assert!(!delta.contains_key("a"));
        assert_eq!(delta.get("b"), Some(&PropValue::String("y".into())));
        assert_eq!(delta.get("fresh"), Some(&PropValue::Number(9.0)));
        assert_eq!(delta.get("gone"), Some(&PropValue::Undefined));
    }
}
