//! Daemon logging: console output plus an optional usage log.
//!
//! Usage events are emitted with `target: "telemetry"`. When a usage log file
//! is configured they go to a daily rotated file and nowhere else; without
//! one they reach the console like every other event.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use utils::logging::{console_layer, default_env_filter};

/// Target of usage events.
pub const TELEMETRY_TARGET: &str = "telemetry";

fn is_telemetry(metadata: &tracing::Metadata<'_>) -> bool {
    metadata.target() == TELEMETRY_TARGET
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// whole run so buffered usage events are flushed.
pub fn init<P: AsRef<Path>>(usage_log_file: Option<P>) -> Option<WorkerGuard> {
    let Some((appender, usage_log_file)) = usage_log_file.and_then(|path| {
        let path = path.as_ref().to_path_buf();
        usage_appender(&path).map(|appender| (appender, path))
    }) else {
        utils::logging::init();
        return None;
    };

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let console = console_layer().with_filter(
        default_env_filter().and(filter::filter_fn(|metadata| !is_telemetry(metadata))),
    );
    let usage = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(is_telemetry));

    registry().with(console).with(usage).init();
    tracing::debug!(path = %usage_log_file.display(), "Usage log enabled");
    Some(file_guard)
}

fn usage_appender(path: &Path) -> Option<RollingFileAppender> {
    let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let prefix = path.file_name()?.to_str()?;

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(directory)
    {
        Ok(appender) => Some(appender),
        Err(e) => {
            eprintln!("Failed to open usage log {}: {e}", path.display());
            None
        }
    }
}
