//! `tplbuild base-build` and `tplbuild base-lookup` - manage the shared
//! base images cached in the base image repo.

use tplbuild_core::plan::base_image_name;
use tplbuild_core::project::PrepareOptions;
use tplbuild_core::{ImageNode, Result};

use super::CommandContext;

pub async fn build(
    ctx: &CommandContext,
    profile: Option<&str>,
    platforms: &[String],
    check: bool,
    update_salt: bool,
    update_sources: bool,
    stages: &[String],
) -> Result<i32> {
    let profile = ctx.project.profile(profile)?;
    let platforms = ctx.project.platforms(platforms)?;

    if update_salt && !check {
        let salt = ctx.project.state.rotate_salt();
        ctx.project.state.save()?;
        println!("rotated hash salt to {salt}");
    }

    let mut out_of_date = 0usize;
    for platform in &platforms {
        let prepared = ctx
            .project
            .prepare(
                &profile,
                platform,
                ctx.registry.as_ref(),
                &PrepareOptions {
                    update_sources: update_sources && !check,
                    persist: !check,
                },
            )
            .await?;
        let targets = ctx.project.select_targets(&prepared, stages, true)?;
        let plan = ctx.project.plan(&prepared, targets, false, true)?;

        let pending: Vec<String> = plan
            .pending_bases()
            .filter_map(|entry| entry.base.as_ref())
            .map(|base| format!("{} ({platform})", base.stage_name))
            .collect();

        if check {
            for name in &pending {
                println!("out of date: {name}");
            }
            out_of_date += pending.len();
            continue;
        }

        if pending.is_empty() {
            println!("all base images up to date for {platform}");
            continue;
        }

        let executor = ctx.executor().record_bases(
            ctx.registry.clone(),
            ctx.project.state.clone(),
            prepared
                .base_repo
                .clone()
                .expect("base plan implies base repo"),
        );
        ctx.project.execute(&executor, &plan, &prepared).await?;
        for name in &pending {
            println!("built base image {name}");
        }
    }

    Ok(if check && out_of_date > 0 { 1 } else { 0 })
}

pub async fn lookup(
    ctx: &CommandContext,
    profile: Option<&str>,
    platforms: &[String],
    stages: &[String],
) -> Result<i32> {
    let profile = ctx.project.profile(profile)?;
    let platforms = ctx.project.platforms(platforms)?;

    for platform in &platforms {
        let prepared = ctx
            .project
            .prepare(
                &profile,
                platform,
                ctx.registry.as_ref(),
                &PrepareOptions {
                    update_sources: false,
                    persist: false,
                },
            )
            .await?;
        let targets = ctx
            .project
            .select_targets(&prepared, stages, true)?
            .unwrap_or_default();
        for id in targets {
            let ImageNode::Base {
                stage_name,
                content_hash,
                resolved_digest,
                ..
            } = prepared.graph.node(id)
            else {
                continue;
            };
            let content_hash = content_hash.as_deref().unwrap_or("<unhashed>");
            let name = prepared
                .base_repo
                .as_deref()
                .map(|repo| base_image_name(repo, content_hash, platform))
                .unwrap_or_else(|| content_hash.to_string());
            match resolved_digest {
                Some(digest) => println!("{stage_name} {platform} {name} {digest}"),
                None => println!("{stage_name} {platform} {name} <missing>"),
            }
        }
    }
    Ok(0)
}
