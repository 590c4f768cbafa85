use crate::constants::LOG_DIR;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().to_rfc3339())
    }
}

fn log_dir() -> Result<PathBuf, String> {
    let dir = PathBuf::from(LOG_DIR);
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| format!("failed to create log directory: {}", e))?;
    }
    Ok(dir)
}

/// Console plus one append-only file per process start, named after the
/// startup timestamp.
pub fn init_logger(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_level(true)
        .with_timer(LocalTimer);

    let dir = match log_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{}", e);
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(console_layer)
                .try_init();
            return;
        }
    };

    let file_name = format!("{}.log", chrono::Local::now().format("%Y%m%d-%H%M%S"));
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::Layer::new()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_timer(LocalTimer);

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();
    // The writer guard must outlive the process or buffered lines are lost.
    std::mem::forget(guard);

    tracing::info!("Log system initialized (console + file persistence)");
}
