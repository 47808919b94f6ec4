//! Installs the global `tracing` subscriber of a process embedding the engine.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const DEBUG_ENV: &str = "LOGSTREAM_DEBUG";

/// Routes panics (runner tasks included) to `tracing` so they end up on one line with the
/// rest of the logs.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    let backtrace = Backtrace::capture();
    let captured = backtrace.status() == BacktraceStatus::Captured;
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(String::as_str)
        });

    match (panic_info.location(), payload, captured) {
        (Some(location), Some(payload), false) => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => tracing::error!("{}\n{}", panic_info, backtrace),
    }
}

fn debug_mode() -> bool {
    std::env::var(DEBUG_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("true"))
}

/// `RUST_LOG` drives the filter, `info` by default. With `LOGSTREAM_DEBUG=true` the default level
/// is `debug` and events are printed as text instead of flattened JSON.
///
/// Calling it again is a no-op: the first subscriber stays installed.
pub fn register() {
    let debug_mode = debug_mode();
    let default_level = if debug_mode { Level::DEBUG } else { Level::INFO };

    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let layer = if debug_mode {
        fmt::layer().boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    if tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok()
    {
        std::panic::set_hook(Box::new(report_panic));
    }
}
