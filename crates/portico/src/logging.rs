use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::cli::PorticoConfig;

pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init(config: &PorticoConfig) -> Result<LoggingGuard, anyhow::Error> {
    let filter_str = if let Some(filter) = config.log.as_deref() {
        filter.to_string()
    } else if let Ok(filter) = std::env::var("RUST_LOG") {
        filter
    } else {
        // Conservative defaults: INFO for our code, but avoid noisy HTTP access logs by default.
        "info,tower_http=warn".to_string()
    };
    let filter = tracing_subscriber::EnvFilter::try_new(filter_str)?;

    use std::io::IsTerminal as _;
    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(std::io::stdout().is_terminal())
        .with_writer(std::io::stdout);

    let mut file_guard = None;
    let mut file_layer = None;
    if config.log_file {
        let log_dir = config.config.data_dir.join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::daily(&log_dir, "portico.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        file_layer = Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
