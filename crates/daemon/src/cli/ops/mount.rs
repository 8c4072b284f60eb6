use std::path::PathBuf;

use chrono::Utc;
use common::volume::{MountOptions, Volume};

use cloudfs::process::{unmount_with_retry, SessionEnd, ShutdownSignal, UnmountRetry};
use cloudfs::{SessionFile, SessionInfo};

use crate::cli::op::{CliError, Op, OpContext};

/// Mount a volume and hold it until SIGINT or SIGTERM, flushing dirty
/// blocks in the background. The session is recorded under the state
/// directory so `--unmount PATH` can find it. A failing unmount is retried
/// until it succeeds or a second signal gives up on the session.
#[derive(Debug, Clone)]
pub struct Mount {
    pub path: PathBuf,
}

#[async_trait::async_trait]
impl Op for Mount {
    type Error = CliError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let settings = &ctx.settings;
        let name = settings.volume()?;
        let mount_path = std::fs::canonicalize(&self.path).map_err(|e| {
            CliError::Failed(format!("mount point {}: {}", self.path.display(), e))
        })?;
        if !mount_path.is_dir() {
            return Err(CliError::Failed(format!(
                "mount point {} is not a directory",
                mount_path.display()
            )));
        }
        let password = ctx.password()?;
        let mut shutdown = ShutdownSignal::install().map_err(|e| {
            CliError::Failed(format!("failed to install signal handlers: {e}"))
        })?;
        let store = ctx.open_store().await?;

        let options = MountOptions {
            readonly: settings.readonly,
            force: settings.force,
        };
        let (volume, report) = Volume::mount(
            store,
            name,
            &password,
            options,
            &settings.engine,
            ctx.pool(),
        )
        .await?;
        for warning in &report.warnings {
            eprintln!("Warning: {warning}");
        }

        let session = match SessionFile::create(
            &settings.sessions_dir(),
            SessionInfo {
                pid: std::process::id(),
                volume: name.to_string(),
                bucket: settings.bucket.clone(),
                mount_path: mount_path.clone(),
                started: Utc::now(),
            },
        ) {
            Ok(session) => session,
            Err(e) => {
                volume.abandon().await?;
                return Err(e.into());
            }
        };

        volume.start_writeback();
        tracing::info!(
            volume = name,
            path = %mount_path.display(),
            generation = report.generation,
            readonly = settings.readonly,
            nofork = settings.nofork,
            "volume mounted, waiting for SIGINT or SIGTERM"
        );

        let signal = shutdown.recv().await;
        tracing::info!(volume = name, signal, "unmounting");

        let end = unmount_with_retry(&volume, &mut shutdown, UnmountRetry::default()).await;
        drop(session);
        match end? {
            SessionEnd::Unmounted(generation) => Ok(format!(
                "unmounted '{}' from {} at generation {}",
                name,
                mount_path.display(),
                generation
            )),
            SessionEnd::Abandoned => Err(CliError::Failed(format!(
                "gave up on '{}' after failed unmounts; uncommitted writes were lost, last committed generation is {}",
                name,
                volume.generation()
            ))),
        }
    }
}
