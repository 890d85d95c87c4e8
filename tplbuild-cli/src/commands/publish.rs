//! `tplbuild publish` - build, push, and index stage images across
//! platforms.

use std::sync::Arc;

use tplbuild_core::{BuilderClient, Executor, Result};

use super::CommandContext;

pub async fn run(
    ctx: &CommandContext,
    profile: Option<&str>,
    platforms: &[String],
    stages: &[String],
) -> Result<i32> {
    let profile = ctx.project.profile(profile)?;
    let platforms = ctx.project.platforms(platforms)?;

    let cancel = ctx.cancel.clone();
    let keep_tags = ctx.keep_tags;
    let parallelism = ctx.project.user.effective_parallelism();
    ctx.project
        .publish(
            ctx.registry.as_ref(),
            ctx.client.clone(),
            move |client: Arc<dyn BuilderClient>| {
                Executor::new(client, parallelism)
                    .with_cancel(cancel.clone())
                    .keep_transient_tags(keep_tags)
            },
            &profile,
            &platforms,
            stages,
        )
        .await?;
    Ok(0)
}
