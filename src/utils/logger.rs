use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber: stdout plus a daily rolling file under
/// `log_dir`. Keep the returned guard alive for the whole process or the
/// file writer stops flushing.
pub fn init(log_dir: String) -> Result<WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(&log_dir, "chapter.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stdout))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(file_writer),
        )
        .try_init()?;

    Ok(guard)
}
