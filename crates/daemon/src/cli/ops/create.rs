use common::config::format_size;
use common::volume::{CreateOptions, Volume};

use crate::cli::op::{CliError, Op, OpContext};

/// Create a volume of `--size` bytes in `--format`. With `--force` an
/// existing, unmounted volume of the same name is replaced.
#[derive(Debug, Clone)]
pub struct Create;

#[async_trait::async_trait]
impl Op for Create {
    type Error = CliError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let settings = &ctx.settings;
        let name = settings.volume()?;
        let size = settings
            .size
            .ok_or_else(|| CliError::Failed("--create needs --size".to_string()))?;
        let password = ctx.password()?;
        let store = ctx.open_store().await?;

        let options = CreateOptions::new(settings.format, size).overwrite(settings.force);
        let info = Volume::create(
            store,
            name,
            &password,
            &options,
            &settings.engine,
            &ctx.pool(),
        )
        .await?;

        Ok(format!(
            "created {} volume '{}' ({}, {} byte blocks)",
            info.format,
            info.name,
            format_size(info.size),
            info.block_size
        ))
    }
}
