use common::volume::delete;

use crate::cli::op::{CliError, Op, OpContext};

#[derive(Debug, Clone)]
pub struct Delete;

#[async_trait::async_trait]
impl Op for Delete {
    type Error = CliError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let name = ctx.settings.volume()?;
        let store = ctx.open_store().await?;
        let report = delete(&store, name, &ctx.pool(), ctx.settings.force).await?;

        let resumed = if report.had_superblock {
            ""
        } else {
            ", finished an earlier delete"
        };
        Ok(format!(
            "deleted volume '{}' ({} objects{})",
            report.volume, report.deleted, resumed
        ))
    }
}
