use std::path::PathBuf;
use std::time::Duration;

use cloudfs::session;

use crate::cli::op::{CliError, Op, OpContext};

/// How long a session may take to flush and commit after SIGTERM.
const UNMOUNT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Unmount {
    pub path: PathBuf,
}

#[async_trait::async_trait]
impl Op for Unmount {
    type Error = CliError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let path = std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        let info = session::terminate(&ctx.settings.sessions_dir(), &path, UNMOUNT_TIMEOUT).await?;
        if let Some(volume) = &ctx.settings.volume {
            if *volume != info.volume {
                tracing::warn!(
                    requested = volume,
                    mounted = info.volume,
                    "the session at this path held a different volume"
                );
            }
        }
        Ok(format!(
            "unmounted '{}' from {}",
            info.volume,
            info.mount_path.display()
        ))
    }
}
