//! Tracing setup for the `arbiter` binary

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Console logging plus a daily-rotating file under `ARBITER_LOG_DIR` when
/// that directory is set and writable. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,arbiter={}", config.level)));

    let file_layer = std::env::var("ARBITER_LOG_DIR")
        .ok()
        .and_then(|dir| file_writer(&dir))
        .map(|writer| {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false) // No color codes in file
                .with_target(true)
        });

    let console_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let file_logging_enabled = file_layer.is_some();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if file_logging_enabled {
        tracing::info!("file logging enabled");
    }
}

/// Minimal logging for CLI commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

/// Non-blocking daily appender for `dir`, or None if it cannot be written.
///
/// `tracing_appender::rolling::daily` panics when it cannot create the first
/// file, so writability is checked up front.
fn file_writer(dir: &str) -> Option<tracing_appender::non_blocking::NonBlocking> {
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!(
            "Warning: Could not create log directory {} ({}), file logging disabled",
            dir, e
        );
        return None;
    }

    let probe = std::path::Path::new(dir).join(".arbiter_write_test");
    if let Err(e) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)
    {
        eprintln!(
            "Warning: Could not write to log directory {} ({}), file logging disabled",
            dir, e
        );
        return None;
    }
    let _ = std::fs::remove_file(&probe);

    let appender = tracing_appender::rolling::daily(dir, "arbiter.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    // Flushes on drop; the process logs until exit
    Box::leak(Box::new(guard));
    Some(writer)
}
