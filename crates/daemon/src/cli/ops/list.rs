use common::config::format_size;
use common::volume::{list_volumes, VolumeInfo};

use crate::cli::op::{CliError, Op, OpContext};

#[derive(Debug, Clone)]
pub struct List;

fn describe(info: &VolumeInfo) -> String {
    let status = match &info.mounted {
        Some(marker) => format!("mounted by pid {} on {}", marker.pid, marker.host),
        None => "unmounted".to_string(),
    };
    format!(
        "{}\t{}\t{}\t{}",
        info.name,
        info.format,
        format_size(info.size),
        status
    )
}

#[async_trait::async_trait]
impl Op for List {
    type Error = CliError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let store = ctx.open_store().await?;
        let volumes = list_volumes(&store).await?;
        if volumes.is_empty() {
            return Ok(format!("No volumes in bucket '{}'", ctx.settings.bucket));
        }
        Ok(volumes.iter().map(describe).collect::<Vec<_>>().join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::volume::{MountMarker, VolumeFormat};

    #[test]
    fn test_describe() {
        let mut info = VolumeInfo {
            name: "vol".to_string(),
            format: VolumeFormat::Tree,
            size: 10 << 30,
            block_size: 1 << 20,
            mounted: None,
        };
        assert_eq!(describe(&info), "vol\tvfs\t10G\tunmounted");

        let marker = MountMarker::new(Default::default());
        info.mounted = Some(marker.clone());
        assert_eq!(
            describe(&info),
            format!("vol\tvfs\t10G\tmounted by pid {} on {}", marker.pid, marker.host)
        );
    }
}
