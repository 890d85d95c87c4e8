//! Base image caching scenarios: registry cache hits skip builds, and
//! salt rotation invalidates every base image.

mod common;

use common::{BuilderOp, FakeRegistry, RecordingBuilder};
use tplbuild_core::graph::ImageNode;
use tplbuild_core::plan::base_image_tag;
use tplbuild_core::project::PrepareOptions;
use tplbuild_core::{Executor, Project, UserConfig};

const BASE_REPO: &str = "registry.example.com/team/bases";

fn write_project(dir: &std::path::Path) {
    std::fs::write(
        dir.join("tplbuild.yml"),
        format!(
            "version: \"1.0\"\n\
             base_image_repo: {BASE_REPO}\n\
             platforms: [linux/amd64]\n"
        ),
    )
    .unwrap();
    std::fs::write(
        dir.join("Dockerfile"),
        "FROM python:3.10 AS base-my-app\n\
         RUN pip install -r requirements.txt\n\
         FROM base-my-app AS my-app\n\
         CMD [\"python\", \"app.py\"]\n",
    )
    .unwrap();
}

fn registry_with_sources() -> std::sync::Arc<FakeRegistry> {
    let registry = FakeRegistry::new();
    registry.insert("python", "3.10", "linux/amd64", "sha256:python310");
    registry
}

/// Content hash of the single base stage in the prepared graph.
fn base_hash(prepared: &tplbuild_core::PreparedBuild) -> String {
    prepared
        .graph
        .iter()
        .find_map(|(_, node)| match node {
            ImageNode::Base { content_hash, .. } => content_hash.clone(),
            _ => None,
        })
        .unwrap()
}

#[tokio::test]
async fn test_base_cache_hit_builds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    let registry = registry_with_sources();

    // First pass discovers the content hash; the registry has no base
    // image yet.
    let project = Project::load(dir.path(), UserConfig::default()).unwrap();
    let prepared = project
        .prepare(
            "default",
            "linux/amd64",
            registry.as_ref(),
            &PrepareOptions {
                update_sources: false,
                persist: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(prepared.pending_bases, 1);
    let hash = base_hash(&prepared);

    // Pre-populate the registry as a prior base-build would have.
    registry.insert(
        BASE_REPO,
        &base_image_tag(&hash, "linux/amd64"),
        "linux/amd64",
        "sha256:cachedbase",
    );

    let prepared = project
        .prepare(
            "default",
            "linux/amd64",
            registry.as_ref(),
            &PrepareOptions {
                update_sources: false,
                persist: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(prepared.pending_bases, 0);

    let plan = project.plan(&prepared, None, false, false).unwrap();
    let builder = RecordingBuilder::new();
    let executor = Executor::new(builder.clone(), 2);
    project.execute(&executor, &plan, &prepared).await.unwrap();

    // Zero base builds; the app stage FROMs the cached base image.
    let builds = builder.build_ops();
    assert_eq!(builds.len(), 1);
    let BuilderOp::Build { dockerfile, .. } = &builds[0] else {
        unreachable!()
    };
    assert!(dockerfile.starts_with(&format!(
        "FROM {BASE_REPO}:{}",
        base_image_tag(&hash, "linux/amd64")
    )));
    assert!(!dockerfile.contains("pip install"));
}

#[tokio::test]
async fn test_base_build_pushes_and_records() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    let registry = registry_with_sources();

    let project = Project::load(dir.path(), UserConfig::default()).unwrap();
    let prepared = project
        .prepare(
            "default",
            "linux/amd64",
            registry.as_ref(),
            &PrepareOptions {
                update_sources: false,
                persist: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(prepared.pending_bases, 1);
    let hash = base_hash(&prepared);

    let targets = project.select_targets(&prepared, &[], true).unwrap();
    let plan = project.plan(&prepared, targets, false, true).unwrap();

    let builder = RecordingBuilder::new();
    builder.wire_registry(registry.clone());
    builder.set_push_platforms(&["linux/amd64"]);
    let executor = Executor::new(builder.clone(), 2).record_bases(
        registry.clone(),
        project.state.clone(),
        BASE_REPO.to_string(),
    );
    project.execute(&executor, &plan, &prepared).await.unwrap();

    // The base image was built under its content-hash tag and pushed.
    let tag = base_image_tag(&hash, "linux/amd64");
    let name = format!("{BASE_REPO}:{tag}");
    assert!(builder
        .ops()
        .iter()
        .any(|op| matches!(op, BuilderOp::Push(image) if *image == name)));
    // Its digest landed in the lock store.
    assert!(project.state.get_base(&hash, "linux/amd64").is_some());

    // A rerun finds the base satisfied.
    let prepared = project
        .prepare(
            "default",
            "linux/amd64",
            registry.as_ref(),
            &PrepareOptions {
                update_sources: false,
                persist: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(prepared.pending_bases, 0);
}

#[tokio::test]
async fn test_salt_rotation_invalidates_bases() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    let registry = registry_with_sources();

    let project = Project::load(dir.path(), UserConfig::default()).unwrap();
    let prepared = project
        .prepare(
            "default",
            "linux/amd64",
            registry.as_ref(),
            &PrepareOptions {
                update_sources: false,
                persist: true,
            },
        )
        .await
        .unwrap();
    let old_hash = base_hash(&prepared);
    registry.insert(
        BASE_REPO,
        &base_image_tag(&old_hash, "linux/amd64"),
        "linux/amd64",
        "sha256:cachedbase",
    );

    let prepared = project
        .prepare(
            "default",
            "linux/amd64",
            registry.as_ref(),
            &PrepareOptions {
                update_sources: false,
                persist: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(prepared.pending_bases, 0);

    // Rotating the salt changes every base content hash, so the cached
    // image no longer satisfies the build.
    project.state.rotate_salt();
    let prepared = project
        .prepare(
            "default",
            "linux/amd64",
            registry.as_ref(),
            &PrepareOptions {
                update_sources: false,
                persist: false,
            },
        )
        .await
        .unwrap();
    assert_ne!(base_hash(&prepared), old_hash);
    assert_eq!(prepared.pending_bases, 1);
}
