use tokio::signal::unix::{signal, Signal, SignalKind};

use common::version::BuildInfo;

/// SIGINT/SIGTERM listeners. Signals that arrive after [`install`] are
/// kept until [`recv`] is polled, so install before announcing a session.
///
/// [`install`]: ShutdownSignal::install
/// [`recv`]: ShutdownSignal::recv
pub struct ShutdownSignal {
    sigint: Signal,
    sigterm: Signal,
}

impl ShutdownSignal {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Resolves on the first SIGINT or SIGTERM and names the signal.
    pub async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        };
        tracing::debug!(signal = name, "shutdown requested");
        name
    }
}

/// Registers a panic hook that logs panics using the `tracing` crate
pub fn register_panic_logger() {
    std::panic::set_hook(Box::new(|panic| match panic.location() {
        Some(loc) => {
            tracing::error!(
                message = %panic,
                panic.file = loc.file(),
                panic.line = loc.line(),
                panic.column = loc.column(),
            );
        }
        None => tracing::error!(message = %panic),
    }));
}

pub fn report_build_info(build: &BuildInfo) {
    tracing::debug!(
        build_profile = build.build_profile,
        features = build.build_features,
        version = build.version,
        repo_version = build.repo_version,
        "cloudfs starting up"
    );
}
