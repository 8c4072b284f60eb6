use common::volume::{fsck, FsckOptions, FsckReport};

use crate::cli::op::{CliError, Op, OpContext};

#[derive(Debug, Clone)]
pub struct Fsck {
    pub repair: bool,
}

fn summarize(report: &FsckReport) -> String {
    let mut lines = vec![format!(
        "volume '{}' generation {}: checked {} blocks",
        report.volume, report.generation, report.checked_blocks
    )];
    let mut push = |label: &str, items: Vec<String>| {
        if !items.is_empty() {
            lines.push(format!("{label} ({}): {}", items.len(), items.join(", ")));
        }
    };
    let blocks = |list: &[u64]| list.iter().map(u64::to_string).collect::<Vec<_>>();
    push("missing blocks", blocks(&report.missing));
    push("corrupt blocks", blocks(&report.corrupt));
    push("leaked blocks", blocks(&report.leaked));
    push("orphaned objects", report.orphans.clone());
    push("damaged metadata", report.damaged_metadata.clone());
    push(
        "tree problems",
        report
            .tree_problems
            .iter()
            .map(|problem| format!("{problem:?}"))
            .collect(),
    );

    if report.is_clean() {
        lines.push("clean".to_string());
    } else if report.repaired {
        lines.push(format!(
            "repaired {} problem(s), now at generation {}",
            report.problem_count(),
            report.generation
        ));
    }
    lines.join("\n")
}

#[async_trait::async_trait]
impl Op for Fsck {
    type Error = CliError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let name = ctx.settings.volume()?;
        let password = ctx.password()?;
        let store = ctx.open_store().await?;
        let options = FsckOptions {
            repair: self.repair,
            force: ctx.settings.force,
        };
        let report = fsck(
            store,
            name,
            &password,
            options,
            &ctx.settings.engine,
            &ctx.pool(),
        )
        .await?;

        let summary = summarize(&report);
        if !report.is_clean() && !report.repaired {
            return Err(CliError::Failed(format!(
                "{summary}\n{} problem(s) found, rerun with --repair",
                report.problem_count()
            )));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> FsckReport {
        FsckReport {
            volume: "vol".to_string(),
            generation: 4,
            checked_blocks: 10,
            missing: Vec::new(),
            corrupt: Vec::new(),
            orphans: Vec::new(),
            leaked: Vec::new(),
            tree_problems: Vec::new(),
            damaged_metadata: Vec::new(),
            repaired: false,
        }
    }

    #[test]
    fn test_summary_lists_problems() {
        let clean = summarize(&report());
        assert!(clean.ends_with("clean"));

        let mut damaged = report();
        damaged.corrupt = vec![3, 7];
        damaged.orphans = vec!["vol/stray".to_string()];
        let text = summarize(&damaged);
        assert!(text.contains("corrupt blocks (2): 3, 7"));
        assert!(text.contains("orphaned objects (1): vol/stray"));
        assert!(!text.contains("clean"));

        let mut lost = report();
        lost.damaged_metadata = vec!["allocation map: authentication failed".to_string()];
        assert!(summarize(&lost).contains("damaged metadata (1): allocation map"));
    }
}
