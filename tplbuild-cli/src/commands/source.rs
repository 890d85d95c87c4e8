//! `tplbuild source-update` and `tplbuild source-lookup` - manage the
//! locked source image digests.

use std::collections::BTreeSet;

use tplbuild_core::graph::ImageRef;
use tplbuild_core::registry::Registry;
use tplbuild_core::{Result, TplError};

use super::CommandContext;

/// Collect every distinct `(repo, tag, platform)` source reference
/// across the requested profiles and platforms.
fn referenced_sources(
    ctx: &CommandContext,
    profile: &str,
    platforms: &[String],
) -> Result<BTreeSet<(String, String, String)>> {
    let mut sources = BTreeSet::new();
    for platform in platforms {
        let graph = ctx.project.build_graph(profile, platform, None)?;
        for (_, repo, tag, source_platform) in graph.source_images() {
            sources.insert((repo, tag, source_platform));
        }
    }
    Ok(sources)
}

pub async fn update(
    ctx: &CommandContext,
    profile: Option<&str>,
    platforms: &[String],
    check: bool,
    clear: bool,
    filter: &[String],
) -> Result<i32> {
    let profile = ctx.project.profile(profile)?;
    let platforms = ctx.project.platforms(platforms)?;

    if clear && !check {
        ctx.project.state.clear_sources();
    }

    let all_sources = referenced_sources(ctx, &profile, &platforms)?;
    let sources: Vec<&(String, String, String)> = if filter.is_empty() {
        all_sources.iter().collect()
    } else {
        let mut selected = Vec::new();
        for name in filter {
            let image = ImageRef::parse(name);
            let matched: Vec<_> = all_sources
                .iter()
                .filter(|(repo, tag, _)| *repo == image.repo && *tag == image.tag)
                .collect();
            if matched.is_empty() {
                return Err(TplError::config(format!(
                    "no source image {name:?} referenced by the project"
                )));
            }
            selected.extend(matched);
        }
        selected
    };

    let mut updates_found = false;
    for (repo, tag, platform) in sources {
        let previous = ctx.project.state.get_source(repo, tag, platform);
        let digest = ctx
            .registry
            .resolve_digest(repo, tag, platform)
            .await?;
        let previous_text = previous.as_deref().unwrap_or("<missing>");
        if previous.as_deref() == Some(digest.as_str()) {
            println!("no update for {repo}:{tag} on {platform}");
            continue;
        }
        updates_found = true;
        if check {
            println!("found update for {repo}:{tag} on {platform}");
            println!("  {previous_text} -> {digest}");
        } else {
            ctx.project.state.set_source(repo, tag, platform, &digest);
            println!("updated {repo}:{tag} on {platform}");
            println!("  {previous_text} -> {digest}");
        }
    }

    if check {
        return Ok(if updates_found { 1 } else { 0 });
    }
    ctx.project.state.save()?;
    Ok(0)
}

pub fn lookup(ctx: &CommandContext, filter: &[String]) -> Result<i32> {
    let locks = ctx.project.state.sources();
    let filters: Vec<ImageRef> = filter.iter().map(|name| ImageRef::parse(name)).collect();
    for (key, digest) in locks {
        if !filters.is_empty() {
            let keep = filters
                .iter()
                .any(|image| key.starts_with(&format!("{}:{}@", image.repo, image.tag)));
            if !keep {
                continue;
            }
        }
        println!("{key} {digest}");
    }
    Ok(0)
}
