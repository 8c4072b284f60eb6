pub mod unmount;
pub mod utils;

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use unmount::{unmount_with_retry, SessionEnd, ShutdownSource, UnmountRetry};
pub use utils::{register_panic_logger, report_build_info, ShutdownSignal};

/// Initialize logging and the panic handler.
/// Returns guards that must be kept alive for the duration of the program.
///
/// Logs go to stderr (stdout carries command output) and, with `log_file`,
/// to that file as well. `RUST_LOG` overrides `level`.
pub fn init_logging(
    level: tracing::Level,
    log_file: Option<&Path>,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    let (stderr_writer, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    guards.push(stderr_guard);

    let stderr_env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stderr_writer)
        .with_filter(stderr_env_filter);

    let file_appender = log_file.and_then(|path| {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let name = path.file_name()?;
        if let Some(dir) = dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Warning: Failed to create log directory {:?}: {}", dir, e);
            }
        }
        Some(tracing_appender::rolling::never(
            dir.unwrap_or_else(|| Path::new(".")),
            name,
        ))
    });

    if let Some(file_appender) = file_appender {
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stderr_layer).init();
    }

    register_panic_logger();

    guards
}
