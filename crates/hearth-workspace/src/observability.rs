//! Process-wide tracing setup.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

/// Install the process-wide tracing subscriber. Safe to call repeatedly;
/// only the first call does anything.
///
/// Environment variables:
/// - `HEARTH_OBSERVABILITY_ENABLED`: optional enable/disable flag (default
///   enabled).
/// - `HEARTH_LOG_LEVEL`: level or filter expression (`info`, `debug`,
///   `hearth_workspace=trace`, ...).
/// - `HEARTH_JSON_LOG_PATH`: optional log file path. If set, records are
///   appended as JSONL to that file; if unset, logs go to stdout in a
///   human-readable console format.
/// - `RUST_LOG`: standard filter override, consulted after
///   `HEARTH_LOG_LEVEL`.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let enabled = std::env::var("HEARTH_OBSERVABILITY_ENABLED")
            .ok()
            .map(|raw| parse_flag(&raw).unwrap_or(true))
            .unwrap_or(true);
        if !enabled {
            return;
        }
        match std::env::var("HEARTH_JSON_LOG_PATH") {
            Ok(path) => init_json(level_filter(), &path),
            Err(_) => init_console(level_filter()),
        }
    });
}

fn level_filter() -> EnvFilter {
    if let Ok(expr) = std::env::var("HEARTH_LOG_LEVEL")
        && let Ok(filter) = EnvFilter::try_new(expr)
    {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_console(filter: EnvFilter) {
    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stdout);
    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}

fn init_json(filter: EnvFilter, path: &str) {
    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let _ = std::fs::create_dir_all(parent);
    }
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let file = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("hearth.logs.jsonl");
    let writer = tracing_appender::rolling::never(dir, file);
    let layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(false)
        .with_writer(writer);
    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}

/// Lenient boolean for environment flags.
fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}
