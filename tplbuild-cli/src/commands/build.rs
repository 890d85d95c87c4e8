//! `tplbuild build` - build stage images for one platform.

use tracing::debug;

use tplbuild_core::project::PrepareOptions;
use tplbuild_core::{Result, TplError};

use super::CommandContext;

pub async fn run(
    ctx: &CommandContext,
    profile: Option<&str>,
    platform: Option<String>,
    update_sources: bool,
    stages: &[String],
) -> Result<i32> {
    let profile = ctx.project.profile(profile)?;
    let platform = match platform {
        Some(platform) => ctx
            .project
            .platforms(&[platform])?
            .remove(0),
        None => ctx
            .project
            .config
            .platforms
            .first()
            .cloned()
            .ok_or_else(|| TplError::config("no platforms configured"))?,
    };

    let prepared = ctx
        .project
        .prepare(
            &profile,
            &platform,
            ctx.registry.as_ref(),
            &PrepareOptions {
                update_sources,
                persist: true,
            },
        )
        .await?;

    let targets = ctx.project.select_targets(&prepared, stages, false)?;
    let plan = ctx.project.plan(&prepared, targets, false, false)?;
    debug!(
        entries = plan.entries.len(),
        builds = plan.build_entries().count(),
        "planned build"
    );

    let executor = ctx.executor();
    ctx.project.execute(&executor, &plan, &prepared).await?;

    for entry in &plan.entries {
        if let Some(stage) = &entry.stage_name {
            println!("built {stage} -> {}", entry.output_tag);
        }
    }
    Ok(0)
}
