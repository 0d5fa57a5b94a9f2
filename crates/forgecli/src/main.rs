//! ForgeFrame playground.
//!
//! Runs a consumer and a host in one process over the in-process surface
//! and walks the whole broker: render, handshake, function props, live
//! updates, host-driven resize, export, close.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;

use forgeframe::{
    create, host, ComponentConfig, Dimensions, EventKind, FrameView, InProcessSurface,
    PropBag, PropDefinition, PropValue, PropsSchema, RemoteFn, RenderContext,
};

#[derive(Parser)]
#[command(name = "forgecli", about = "ForgeFrame in-process playground", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a full component lifecycle and print every observable step.
    Demo {
        /// Render into a popup instead of an iframe.
        #[arg(long)]
        popup: bool,
        /// Simulate a popup blocker.
        #[arg(long)]
        block_popups: bool,
        /// Component timeout in milliseconds.
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forgeframe=info,forgecli=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo {
            popup,
            block_popups,
            timeout_ms,
        } => demo(popup, block_popups, timeout_ms).await,
    }
}

fn step(label: &str, detail: &str) {
    println!("{} {}", format!("[{label}]").green().bold(), detail);
}

async fn demo(popup: bool, block_popups: bool, timeout_ms: u64) -> Result<()> {
    let surface = InProcessSurface::new("https://consumer.example");
    if block_popups {
        surface.block_popups();
    }

    let config = ComponentConfig::new("greeter", "https://widgets.example/greeter")
        .dimensions(Dimensions::new(320, 240))
        .timeout(Duration::from_millis(timeout_ms))
        .props(
            PropsSchema::new()
                .prop("name", PropDefinition::string().required())
                .prop("count", PropDefinition::number().default_value(0.0))
                .prop("onGreet", PropDefinition::function()),
        );

    let component = create(config.clone()).context("component definition rejected")?;

    let on_greet = RemoteFn::from_sync(|args| {
        let who = args
            .first()
            .and_then(PropValue::as_str)
            .unwrap_or("someone")
            .to_string();
        println!("        consumer closure invoked: greet {who}");
        Ok(PropValue::String(format!("hello {who}")))
    });

    let mut props = PropBag::new();
    props.insert("name".into(), "Ada".into());
    props.insert("onGreet".into(), PropValue::Function(on_greet));
    let instance = component.init(props);

    instance.event().on(EventKind::Rendered, |_| {
        println!("        event: rendered");
        Ok(())
    });
    instance.event().on(EventKind::Resize, |dims| {
        println!("        event: resize {dims:?}");
        Ok(())
    });
    instance.event().on(EventKind::Close, |_| {
        println!("        event: close");
        Ok(())
    });

    let context = if popup {
        RenderContext::Popup
    } else {
        RenderContext::Iframe
    };

    step("render", &format!("opening {} view", context.as_str()));
    let render_instance = instance.clone();
    let render_surface: Arc<InProcessSurface> = surface.clone();
    let render = tokio::spawn(async move {
        render_instance
            .render(render_surface, "#app", Some(context))
            .await
    });

    // The "remote document" side of the demo.
    let window = loop {
        if let Some(w) = surface.host_window(instance.uid()) {
            break w;
        }
        if render.is_finished() {
            // Render failed before the window existed (e.g. blocked popup).
            render.await??;
            unreachable!("render reported success without a window");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    step("attach", "host runtime attaching to its window");
    let live = host::attach(window, &config).await?;
    render.await??;
    step("rendered", &format!("uid {}", instance.uid()));

    step(
        "props",
        &format!(
            "host sees name={:?} count={:?}",
            live.get("name"),
            live.get("count")
        ),
    );

    let _sub = live.on_props(|delta| {
        println!("        host delta: {delta:?}");
    });

    step("call", "host invokes onGreet(\"world\")");
    let reply = live.call("onGreet", vec!["world".into()]).await?;
    step("call", &format!("returned {reply:?}"));

    step("update", "consumer sets count = 7");
    let mut update = PropBag::new();
    update.insert("count".into(), 7.0.into());
    instance.update_props(update).await?;
    step("update", &format!("host sees count={:?}", live.get("count")));

    step("resize", "host requests height 500");
    live.resize(&Dimensions::height(500)).await?;
    let dims = surface
        .view(instance.uid())
        .and_then(|v| v.dimensions())
        .context("view disappeared")?;
    step(
        "resize",
        &format!(
            "view is now {} x {}",
            dims.width.map(|d| d.to_css()).unwrap_or_default(),
            dims.height.map(|d| d.to_css()).unwrap_or_default(),
        ),
    );

    step("export", "host exports its API version");
    live.export(PropValue::object([("version", 1.0.into())]))
        .await?;
    step("export", &format!("consumer received {:?}", instance.exports()));

    if let Some(stats) = instance.endpoint_stats() {
        step(
            "stats",
            &format!(
                "sent={} retransmits={} dropped_origin={}",
                stats.sent, stats.retransmits, stats.dropped_origin
            ),
        );
    }

    step("close", "consumer closes the component");
    instance.close().await?;
    step("done", &format!("final stage {}", instance.stage().as_str()));
    Ok(())
}
