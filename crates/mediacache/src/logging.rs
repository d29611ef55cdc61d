use std::env;

use mediacache_service::config::{Config, LogFormat};
use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::{EnvFilter, Layer};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Default filter directives for a configured level, used when `RUST_LOG` is unset.
fn default_directives(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO,hyper=WARN,reqwest=WARN",
        LevelFilter::DEBUG => "INFO,hyper=WARN,mediacache=DEBUG,mediacache_service=DEBUG",
        LevelFilter::TRACE => "INFO,hyper=WARN,mediacache=TRACE,mediacache_service=TRACE",
    }
}

/// Picks the output format for `format`, resolving `auto` by whether stderr is a terminal.
fn format_layer(format: LogFormat) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    match format {
        LogFormat::Auto if console::user_attended_stderr() => layer.pretty().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Auto | LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
        LogFormat::Json => json_layer(),
    }
}

/// JSON lines including the current span and its parents.
fn json_layer() -> BoxedLayer {
    tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(UtcTime::rfc_3339())
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .boxed()
}

/// Installs the global subscriber: formatted logs on stderr plus the sentry integration.
///
/// The filter comes from `RUST_LOG`, falling back to the configured level. Backtraces are
/// switched on through `RUST_BACKTRACE` when the config asks for them.
///
/// # Safety
/// This function uses [`std::env::set_var`], which is only safe to call while no other threads
/// are running.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let directives = env::var("RUST_LOG")
        .unwrap_or_else(|_| default_directives(config.logging.level).to_owned());

    // Errors become sentry events, warnings and infos end up as breadcrumbs on them.
    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(format_layer(config.logging.format).with_filter(EnvFilter::new(directives)))
        .with(sentry_layer)
        .init();
}

/// Reports a fatal error through the logger, or on stderr if logging is not set up yet.
pub fn ensure_log_error(error: &anyhow::Error) {
    let enabled = tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current();

    if enabled {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
