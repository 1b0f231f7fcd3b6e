use std::cell::RefCell;
use std::sync::Once;

use tracing::{Level, Span};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

// Global one-time initialization for the logging backend
static INIT: Once = Once::new();

// Keep the entered guard in thread-local storage (no Sync needed)
thread_local! {
    static COMPONENT_GUARD: RefCell<Option<tracing::span::Entered<'static>>> = const { RefCell::new(None) };
}

/// Install the subscriber from a textual level ("warn", "debug", ...).
pub fn init_tracing(level: &str) {
    init(parse_level(level));
}

fn install(level: Level) {
    // RUST_LOG directives win over the default level when present.
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    // Another subscriber may already be installed by the host application.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

pub fn init(level: Level) {
    INIT.call_once(|| {
        install(level);
        tracing::info!("Tracing initialized at level = {}", level);
    });
}

// Same as `init`, but also enters a permanent span with `crate = component`
// on the calling thread so its events carry the label.
pub fn init_with_component(level: Level, component: &str) {
    INIT.call_once(|| {
        install(level);

        let span = tracing::info_span!("component", crate = component);
        let span_static: &'static Span = Box::leak(Box::new(span));
        COMPONENT_GUARD.with(|cell| {
            let guard = span_static.enter();
            *cell.borrow_mut() = Some(guard);
        });

        tracing::info!("Tracing initialized at level = {} (component={})", level, component);
    });
}

pub fn parse_level(s: &str) -> Level {
    match s.to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}
