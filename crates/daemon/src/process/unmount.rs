//! Ending a mount session.

use std::time::Duration;

use common::volume::{Volume, VolumeError};

use super::ShutdownSignal;

/// Where shutdown requests come from.
#[async_trait::async_trait]
pub trait ShutdownSource: Send {
    async fn recv(&mut self) -> &'static str;
}

#[async_trait::async_trait]
impl ShutdownSource for ShutdownSignal {
    async fn recv(&mut self) -> &'static str {
        ShutdownSignal::recv(self).await
    }
}

/// Backoff between unmount attempts.
#[derive(Debug, Clone, Copy)]
pub struct UnmountRetry {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for UnmountRetry {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Committed and released at this generation
    Unmounted(u64),
    /// Released on request without committing
    Abandoned,
}

/// A failure no amount of retrying fixes.
fn is_permanent(err: &VolumeError) -> bool {
    match err {
        VolumeError::UnmountFailed { source, .. } => is_permanent(source),
        VolumeError::AlreadyMounted { .. } | VolumeError::Inconsistent(_) => true,
        _ => false,
    }
}

/// Unmount `volume`, retrying with exponential backoff while it fails.
///
/// The volume stays mounted, and its dirty blocks stay cached, between
/// attempts. Another shutdown request while waiting forces one last attempt
/// and abandons the session if that fails too. Failures that retrying
/// cannot fix (another session took the volume over, or the session saw
/// tampered data) abandon right away and return the error.
pub async fn unmount_with_retry(
    volume: &Volume,
    shutdown: &mut dyn ShutdownSource,
    retry: UnmountRetry,
) -> Result<SessionEnd, VolumeError> {
    let name = volume.name().to_string();
    let mut delay = retry.initial;
    let mut attempt: u32 = 1;
    loop {
        let err = match volume.unmount().await {
            Ok(generation) => return Ok(SessionEnd::Unmounted(generation)),
            Err(e) => e,
        };
        if is_permanent(&err) {
            tracing::error!(volume = %name, error = %err, "unmount cannot succeed, abandoning session");
            volume.abandon().await?;
            return Err(err);
        }
        tracing::error!(
            volume = %name,
            attempt,
            retry_in = ?delay,
            error = %err,
            "unmount failed, volume stays mounted; signal again to give up"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            signal = shutdown.recv() => {
                tracing::warn!(volume = %name, signal, "shutdown repeated, last unmount attempt");
                return match volume.unmount().await {
                    Ok(generation) => Ok(SessionEnd::Unmounted(generation)),
                    Err(e) => {
                        tracing::error!(volume = %name, error = %e, "giving up, uncommitted writes are lost");
                        volume.abandon().await?;
                        Ok(SessionEnd::Abandoned)
                    }
                };
            }
        }
        delay = (delay * 2).min(retry.max);
        attempt += 1;
    }
}
