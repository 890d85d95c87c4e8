//! In-memory fakes shared by the integration tests: a registry backed by
//! a map and a builder client that records every operation.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tplbuild_core::context::BuildContext;
use tplbuild_core::registry::Registry;
use tplbuild_core::{BuilderClient, Result, TplError};

fn digest_of(text: &str) -> String {
    format!("sha256:{}", tplbuild_core::hashing::bytes_hash(text.as_bytes()))
}

/// Registry fake: `(repo, tag, platform) -> digest` plus a record of
/// pushed indexes.
#[derive(Default)]
pub struct FakeRegistry {
    tags: Mutex<BTreeMap<(String, String, String), String>>,
    pub indexes: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, repo: &str, tag: &str, platform: &str, digest: &str) {
        self.tags.lock().unwrap().insert(
            (repo.to_string(), tag.to_string(), platform.to_string()),
            digest.to_string(),
        );
    }

    pub fn remove(&self, repo: &str, tag: &str, platform: &str) {
        self.tags.lock().unwrap().remove(&(
            repo.to_string(),
            tag.to_string(),
            platform.to_string(),
        ));
    }

    fn lookup(&self, repo: &str, tag: &str, platform: &str) -> Option<String> {
        self.tags
            .lock()
            .unwrap()
            .get(&(repo.to_string(), tag.to_string(), platform.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn resolve_digest(&self, repo: &str, tag: &str, platform: &str) -> Result<String> {
        self.lookup(repo, tag, platform).ok_or(TplError::Registry {
            reason: format!("manifest unknown: {repo}:{tag} ({platform})"),
            status: Some(404),
            transient: false,
        })
    }

    async fn probe(&self, repo: &str, tag: &str, platform: &str) -> Result<Option<String>> {
        Ok(self.lookup(repo, tag, platform))
    }

    async fn push_multiarch(
        &self,
        repo: &str,
        tag: &str,
        platform_digests: &BTreeMap<String, String>,
    ) -> Result<String> {
        let digest = digest_of(&format!("index:{repo}:{tag}:{platform_digests:?}"));
        self.indexes
            .lock()
            .unwrap()
            .insert((repo.to_string(), tag.to_string()), platform_digests.clone());
        for platform in platform_digests.keys() {
            self.insert(repo, tag, platform, &digest);
        }
        Ok(digest)
    }
}

/// One recorded builder operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuilderOp {
    Build {
        tag: String,
        platform: String,
        dockerfile: String,
        context: Option<String>,
    },
    Tag {
        source: String,
        target: String,
    },
    Push(String),
    Pull(String),
    Untag(String),
}

/// Builder client fake: records operations, tracks local tags, and can
/// inject per-tag delays and failures.
#[derive(Default)]
pub struct RecordingBuilder {
    ops: Mutex<Vec<BuilderOp>>,
    local_tags: Mutex<BTreeSet<String>>,
    fail_substrings: Mutex<Vec<String>>,
    delays: Mutex<BTreeMap<String, Duration>>,
    /// When set, pushes register a digest here so publication flows can
    /// resolve what they pushed.
    registry: Mutex<Option<Arc<FakeRegistry>>>,
    platforms: Mutex<Vec<String>>,
}

impl RecordingBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Builds whose dockerfile or tag contains `needle` fail.
    pub fn fail_when(&self, needle: &str) {
        self.fail_substrings.lock().unwrap().push(needle.to_string());
    }

    /// Delay builds whose dockerfile or tag contains `needle`.
    pub fn delay_when(&self, needle: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(needle.to_string(), delay);
    }

    pub fn wire_registry(&self, registry: Arc<FakeRegistry>) {
        *self.registry.lock().unwrap() = Some(registry);
    }

    pub fn ops(&self) -> Vec<BuilderOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn build_ops(&self) -> Vec<BuilderOp> {
        self.ops()
            .into_iter()
            .filter(|op| matches!(op, BuilderOp::Build { .. }))
            .collect()
    }

    pub fn local_tags(&self) -> BTreeSet<String> {
        self.local_tags.lock().unwrap().clone()
    }

    fn record(&self, op: BuilderOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl BuilderClient for RecordingBuilder {
    async fn build(
        &self,
        dockerfile: &str,
        context: Option<&BuildContext>,
        tag: &str,
        platform: &str,
    ) -> Result<()> {
        self.record(BuilderOp::Build {
            tag: tag.to_string(),
            platform: platform.to_string(),
            dockerfile: dockerfile.to_string(),
            context: context.map(|c| c.name.clone()),
        });

        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| dockerfile.contains(*needle) || tag.contains(*needle))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .fail_substrings
            .lock()
            .unwrap()
            .iter()
            .any(|needle| dockerfile.contains(needle) || tag.contains(needle));
        if failed {
            return Err(TplError::Build {
                reason: format!("injected failure building {tag}"),
                stderr_tail: vec!["boom".to_string()],
            });
        }

        self.local_tags.lock().unwrap().insert(tag.to_string());
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.record(BuilderOp::Tag {
            source: source.to_string(),
            target: target.to_string(),
        });
        self.local_tags.lock().unwrap().insert(target.to_string());
        Ok(())
    }

    async fn push(&self, image: &str) -> Result<()> {
        self.record(BuilderOp::Push(image.to_string()));
        if let Some(registry) = self.registry.lock().unwrap().clone() {
            let image_ref = tplbuild_core::graph::ImageRef::parse(image);
            for platform in self.platforms.lock().unwrap().iter() {
                registry.insert(
                    &image_ref.repo,
                    &image_ref.tag,
                    platform,
                    &digest_of(image),
                );
            }
        }
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.record(BuilderOp::Pull(image.to_string()));
        self.local_tags.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn untag(&self, image: &str) -> Result<()> {
        self.record(BuilderOp::Untag(image.to_string()));
        self.local_tags.lock().unwrap().remove(image);
        Ok(())
    }

    async fn platform(&self) -> Result<String> {
        Ok("linux/amd64".to_string())
    }
}

impl RecordingBuilder {
    /// Platforms pushes should register digests for in the wired
    /// registry.
    pub fn set_push_platforms(&self, platforms: &[&str]) {
        *self.platforms.lock().unwrap() = platforms.iter().map(|p| p.to_string()).collect();
    }
}
