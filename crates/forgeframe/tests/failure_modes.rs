//! Failure semantics: blocked popups, origin mismatches, timeouts, and
//! validation failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use forgeframe::{
    create, host, BrokerError, ComponentConfig, EventKind, Instance, InProcessSurface,
    PropBag, PropDefinition, PropValue, PropsSchema, RemoteFn, RenderContext, Stage,
};

const CONSUMER_ORIGIN: &str = "https://consumer.example";
const HOST_URL: &str = "https://widgets.example/panel";

fn bag(entries: Vec<(&str, PropValue)>) -> PropBag {
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

async fn render_and_attach(
    surface: &Arc<InProcessSurface>,
    instance: &Instance,
    config: &ComponentConfig,
) -> host::LiveProps {
    let render_instance = instance.clone();
    let render_surface = surface.clone();
    let render = tokio::spawn(async move {
        render_instance.render(render_surface, "#app", None).await
    });

    let window = loop {
        if let Some(w) = surface.host_window(instance.uid()) {
            break w;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    let live = host::attach(window, config).await.expect("attach failed");
    render.await.expect("render task").expect("render failed");
    live
}

#[tokio::test]
async fn blocked_popup_rejects_and_closes() {
    let surface = InProcessSurface::new(CONSUMER_ORIGIN);
    surface.block_popups();

    let config = ComponentConfig::new("panel", HOST_URL);
    let component = create(config).unwrap();
    let instance = component.init(PropBag::new());

    let errors = Arc::new(Mutex::new(Vec::<PropValue>::new()));
    let sink = errors.clone();
    instance.event().on(EventKind::Error, move |payload| {
        sink.lock().unwrap().push(payload.clone());
        Ok(())
    });

    let err = instance
        .render(surface.clone(), "#app", Some(RenderContext::Popup))
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::PopupBlocked));
    assert_eq!(instance.stage(), Stage::Closed);
    assert_eq!(errors.lock().unwrap().len(), 1);
    // No view, no endpoint, nothing registered.
    assert!(surface.view(instance.uid()).is_none());
    assert!(instance.endpoint_stats().is_none());
    assert!(forgeframe::get_component(instance.uid()).is_none());
}

#[tokio::test]
async fn unanswered_render_times_out_with_error_event() {
    // Nothing ever attaches on the host side, so `ready` never arrives.
    let surface = InProcessSurface::new(CONSUMER_ORIGIN);
    let config =
        ComponentConfig::new("panel", HOST_URL).timeout(Duration::from_millis(300));
    let component = create(config).unwrap();
    let instance = component.init(PropBag::new());

    let errors = Arc::new(Mutex::new(Vec::<PropValue>::new()));
    let sink = errors.clone();
    instance.event().on(EventKind::Error, move |payload| {
        sink.lock().unwrap().push(payload.clone());
        Ok(())
    });

    let err = instance
        .render(surface.clone(), "#app", None)
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::Timeout { timeout_ms: 300, .. }));
    assert_eq!(instance.stage(), Stage::Closed);
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn cross_origin_host_is_never_heard() {
    // The component points at trusted.example but the document actually
    // loaded from other.example: every frame it sends is dropped and the
    // render fails without any host handler running.
    let surface = InProcessSurface::new(CONSUMER_ORIGIN);
    let config = ComponentConfig::new("panel", "https://trusted.example/panel")
        .timeout(Duration::from_millis(300));
    let component = create(config.clone()).unwrap();
    let instance = component.init(PropBag::new());

    let render_instance = instance.clone();
    let render_surface = surface.clone();
    let render = tokio::spawn(async move {
        render_instance.render(render_surface, "#app", None).await
    });

    let window = loop {
        if let Some(w) = surface.host_window(instance.uid()) {
            break w;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    // Simulate the document really living on another origin: rebind the
    // channel under other.example and try to attach from there.
    let channel = window.take_channel().unwrap();
    let forged = Arc::new(forgeframe::HostWindow::new(
        window.name.clone(),
        "https://other.example/panel",
        window.referrer.clone(),
        channel,
    ));
    let attach_result = host::attach(forged, &config).await;

    // The host's handshake goes unanswered (its origin never matches), and
    // the consumer render times out.
    assert!(attach_result.is_err());
    let err = render.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { .. }));
    assert_eq!(instance.stage(), Stage::Closed);
}

#[tokio::test]
async fn never_responding_function_rejects_at_the_caller() {
    let surface = InProcessSurface::new(CONSUMER_ORIGIN);
    let config = ComponentConfig::new("panel", HOST_URL)
        .timeout(Duration::from_millis(400))
        .props(PropsSchema::new().prop("onStall", PropDefinition::function()));
    let component = create(config.clone()).unwrap();

    let stall = RemoteFn::new(|_args| futures::future::pending().boxed());
    let instance = component.init(bag(vec![("onStall", PropValue::Function(stall))]));
    let live = render_and_attach(&surface, &instance, &config).await;

    let err = live.call("onStall", vec![]).await.unwrap_err();
    match err {
        BrokerError::Timeout { timeout_ms, .. } => assert_eq!(timeout_ms, 400),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn validation_failure_aborts_render() {
    let surface = InProcessSurface::new(CONSUMER_ORIGIN);
    let config = ComponentConfig::new("panel", HOST_URL)
        .props(PropsSchema::new().prop("count", PropDefinition::number().required()));
    let component = create(config).unwrap();

    // Missing required prop.
    let instance = component.init(PropBag::new());
    let err = instance.render(surface.clone(), "#app", None).await.unwrap_err();
    assert!(matches!(err, BrokerError::SchemaRequired { .. }));
    assert_eq!(instance.stage(), Stage::Closed);

    // Wrong kind.
    let instance = component.init(bag(vec![("count", "seven".into())]));
    let err = instance.render(surface.clone(), "#app", None).await.unwrap_err();
    assert!(matches!(err, BrokerError::SchemaTypeMismatch { .. }));
    assert!(surface.view(instance.uid()).is_none());
}

#[tokio::test]
async fn update_props_validation_failure_leaves_host_untouched() {
    let surface = InProcessSurface::new(CONSUMER_ORIGIN);
    let config = ComponentConfig::new("panel", HOST_URL).props(
        PropsSchema::new().prop(
            "count",
            PropDefinition::number().default_value(1.0).validate(|v, _| {
                if v.as_number().unwrap_or(0.0) < 0.0 {
                    Err("must be non-negative".into())
                } else {
                    Ok(())
                }
            }),
        ),
    );
    let component = create(config.clone()).unwrap();
    let instance = component.init(PropBag::new());
    let live = render_and_attach(&surface, &instance, &config).await;

    let err = instance
        .update_props(bag(vec![("count", (-5.0).into())]))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PropValidation { .. }));
    assert_eq!(live.get("count"), Some(PropValue::Number(1.0)));
}

#[tokio::test]
async fn host_attach_refused_for_disallowed_parent() {
    let surface = InProcessSurface::new(CONSUMER_ORIGIN);
    // The shared definition only trusts another-consumer.example, so the
    // host refuses to complete the handshake with this embedder.
    let config = ComponentConfig::new("panel", HOST_URL)
        .allowed_parent_domains(["https://another-consumer.example"])
        .timeout(Duration::from_millis(300));
    let component = create(config.clone()).unwrap();
    let instance = component.init(PropBag::new());

    let render_instance = instance.clone();
    let render_surface = surface.clone();
    let render = tokio::spawn(async move {
        render_instance.render(render_surface, "#app", None).await
    });

    let window = loop {
        if let Some(w) = surface.host_window(instance.uid()) {
            break w;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let err = host::attach(window, &config).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidConfig(_)));

    // With no host, the render times out and the instance closes.
    assert!(render.await.unwrap().is_err());
    assert_eq!(instance.stage(), Stage::Closed);
}
