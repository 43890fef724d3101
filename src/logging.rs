use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static LOG_ONCE: Once = Once::new();
static LOG_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn env_level() -> LevelFilter {
    std::env::var("ELECTROMETER_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Parse a textual level ("debug", "warn", ...), ignoring unknown values.
pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize stderr logging based on `ELECTROMETER_LOG`/`RUST_LOG`.
pub fn init_logging() -> LevelFilter {
    init_logging_with(None)
}

/// Initialize stderr logging, preferring an explicit level over the environment.
///
/// Only the first call installs the logger; later calls return the level in effect.
pub fn init_logging_with(level: Option<LevelFilter>) -> LevelFilter {
    let level = level.unwrap_or_else(env_level);
    LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        // A logger installed by the host application wins; keep its level choice opaque.
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        let _ = LOG_LEVEL.set(level);
    });
    LOG_LEVEL.get().copied().unwrap_or(level)
}
