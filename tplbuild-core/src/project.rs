//! Top-level build orchestration.
//!
//! `Project` ties the pipeline together: load configuration and state,
//! render the entrypoint template for a (profile, platform) pair, parse
//! and lower it into the graph, lock sources, hash, probe base images,
//! plan, and execute. The CLI commands are thin drivers over this type.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::arch::platform_slug;
use crate::config::{StageConfig, TplConfig, UserConfig};
use crate::context::BuildContext;
use crate::dockerfile::{self, Dockerfile};
use crate::error::{Result, TplError};
use crate::executor::{resolve_bases, resolve_sources, BuilderClient, Executor};
use crate::graph::{BuildGraph, GraphOptions, ImageNode, NodeId, StageOverride};
use crate::hash::hash_graph;
use crate::plan::{plan, BuildPlan, PlanOptions};
use crate::registry::Registry;
use crate::render::{RenderVars, TemplateEngine, VarsEngine};
use crate::state::StateStore;

/// Options controlling the prepare phase.
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    /// Re-resolve source digests even when a lock exists.
    pub update_sources: bool,
    /// Persist lock/probe results to the state file. Off for `--check`
    /// flows, which must not mutate anything.
    pub persist: bool,
}

/// A fully prepared single-platform build: rendered, parsed, lowered,
/// locked, and hashed.
pub struct PreparedBuild {
    pub profile: String,
    pub platform: String,
    pub graph: BuildGraph,
    pub hashes: Vec<String>,
    pub contexts: BTreeMap<String, BuildContext>,
    pub base_repo: Option<String>,
    /// Base images that a build would have to materialise.
    pub pending_bases: usize,
}

/// Container for all top-level build operations of one project.
pub struct Project {
    pub base_dir: PathBuf,
    pub config: TplConfig,
    pub user: UserConfig,
    pub state: Arc<StateStore>,
    engine: Box<dyn TemplateEngine>,
}

impl Project {
    /// Load a project from its base directory, along with the user
    /// configuration and persisted state.
    pub fn load(base_dir: &Path, user: UserConfig) -> Result<Self> {
        let config = TplConfig::load(base_dir)?;
        let state = Arc::new(StateStore::load(base_dir)?);
        let search_paths = config
            .template_paths
            .iter()
            .map(|p| base_dir.join(p))
            .collect();
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            config,
            user,
            state,
            engine: Box::new(VarsEngine::new(search_paths)),
        })
    }

    /// Substitute the template engine behind the rendering seam.
    pub fn with_engine(mut self, engine: Box<dyn TemplateEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Resolve the profile to operate on.
    pub fn profile(&self, requested: Option<&str>) -> Result<String> {
        match requested {
            Some(profile) => {
                self.config.profile_vars(profile)?;
                Ok(profile.to_string())
            }
            None => Ok(self.config.default_profile_name().to_string()),
        }
    }

    /// Resolve the platforms to operate on.
    pub fn platforms(&self, requested: &[String]) -> Result<Vec<String>> {
        if requested.is_empty() {
            return Ok(self.config.platforms.clone());
        }
        for platform in requested {
            if !self.config.platforms.contains(platform) {
                return Err(TplError::config(format!(
                    "platform {platform:?} is not listed in the project platforms"
                )));
            }
        }
        Ok(requested.to_vec())
    }

    fn render_vars(&self, profile: &str, platform: &str) -> Result<RenderVars> {
        let vars = self.config.profile_vars(profile)?.clone();
        // Templates can inspect user settings as user_config.<key>.
        let mut user_config = std::collections::BTreeMap::new();
        if let Ok(serde_yaml::Value::Mapping(mapping)) = serde_yaml::to_value(&self.user) {
            for (key, value) in mapping {
                if let serde_yaml::Value::String(key) = key {
                    user_config.insert(key, value);
                }
            }
        }
        Ok(RenderVars::new(profile, platform)
            .with_vars(vars)
            .with_user_config(user_config))
    }

    /// Render the entrypoint template for one (profile, platform).
    pub fn render(&self, profile: &str, platform: &str) -> Result<String> {
        let vars = self.render_vars(profile, platform)?;
        self.engine
            .render_file(&self.config.template_entrypoint, &vars)
    }

    /// Render and parse the entrypoint.
    pub fn parse(&self, profile: &str, platform: &str) -> Result<Dockerfile> {
        let text = self.render(profile, platform)?;
        Ok(dockerfile::parse(&text)?)
    }

    /// Build the named contexts for one (profile, platform) rendering.
    pub fn contexts(
        &self,
        profile: &str,
        platform: &str,
    ) -> Result<BTreeMap<String, BuildContext>> {
        let vars = self.render_vars(profile, platform)?;
        let mut contexts = BTreeMap::new();
        for (name, config) in &self.config.contexts {
            let patterns = match (&config.ignore, &config.ignore_file) {
                (Some(patterns), _) => patterns.clone(),
                (None, ignore_file) => {
                    let file = ignore_file.as_deref().unwrap_or(".dockerignore");
                    let path = self.base_dir.join(file);
                    match std::fs::read_to_string(&path) {
                        Ok(text) => {
                            // Ignore files are templates too.
                            let rendered = self.engine.render_str(&text, &vars)?;
                            rendered.lines().map(String::from).collect()
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                            if ignore_file.is_some() {
                                return Err(TplError::context(format!(
                                    "context {name:?}: missing ignore file {file:?}"
                                )));
                            }
                            Vec::new()
                        }
                        Err(err) => return Err(TplError::io(path, err)),
                    }
                }
            };
            contexts.insert(
                name.clone(),
                BuildContext::new(
                    name.clone(),
                    Some(self.base_dir.join(&config.base_dir)),
                    config.umask_bits()?,
                    &patterns,
                )?,
            );
        }
        Ok(contexts)
    }

    /// The rendered base image repository, when configured.
    pub fn base_repo(&self, profile: &str, platform: &str) -> Result<Option<String>> {
        let Some(template) = &self.config.base_image_repo else {
            return Ok(None);
        };
        let vars = self.render_vars(profile, platform)?;
        Ok(Some(self.engine.render_str(template, &vars)?))
    }

    /// Render stage name templates into graph overrides and lower the
    /// parsed stages. `push_suffix` appends a platform slug to push names
    /// for multi-platform publishes.
    pub fn build_graph(
        &self,
        profile: &str,
        platform: &str,
        push_suffix: Option<&str>,
    ) -> Result<BuildGraph> {
        let parsed = self.parse(profile, platform)?;

        let mut options = GraphOptions::new(platform, profile);
        options.context_names = self.config.contexts.keys().cloned().collect();
        if !self.config.contexts.contains_key("default") {
            if let Some(first) = self.config.contexts.keys().next() {
                options.default_context = first.clone();
            }
        }

        let default_stage_config = StageConfig::default();
        for stage in &parsed.stages {
            let config = self
                .config
                .stages
                .get(&stage.name)
                .unwrap_or(&default_stage_config);
            let base = config.base.unwrap_or(stage.base);
            let anon = !base && stage.anon;

            let mut overrides = StageOverride {
                base: config.base,
                ..Default::default()
            };
            if !base && !anon {
                let vars = self
                    .render_vars(profile, platform)?
                    .with_value("stage_name", &stage.name);
                let image_templates = config
                    .image_names
                    .clone()
                    .unwrap_or_else(|| vec![self.config.stage_image_name.clone()]);
                for template in image_templates {
                    overrides
                        .publish_tags
                        .push(self.engine.render_str(&template, &vars)?);
                }
                let push_templates = config
                    .push_names
                    .clone()
                    .unwrap_or_else(|| vec![self.config.stage_push_name.clone()]);
                for template in push_templates {
                    let mut name = self.engine.render_str(&template, &vars)?;
                    if let Some(suffix) = push_suffix {
                        name = format!("{name}-{suffix}");
                    }
                    overrides.push_tags.push(name);
                }
            }
            options.stage_overrides.insert(stage.name.clone(), overrides);
        }

        Ok(BuildGraph::from_dockerfile(&parsed, &options)?)
    }

    /// Run the full prepare phase: lower, lock sources, hash, and probe
    /// base images.
    pub async fn prepare(
        &self,
        profile: &str,
        platform: &str,
        registry: &dyn Registry,
        options: &PrepareOptions,
    ) -> Result<PreparedBuild> {
        self.prepare_with_suffix(profile, platform, None, registry, options)
            .await
    }

    async fn prepare_with_suffix(
        &self,
        profile: &str,
        platform: &str,
        push_suffix: Option<&str>,
        registry: &dyn Registry,
        options: &PrepareOptions,
    ) -> Result<PreparedBuild> {
        debug!(profile, platform, "preparing build");
        let mut graph = self.build_graph(profile, platform, push_suffix)?;
        let contexts = self.contexts(profile, platform)?;

        resolve_sources(
            &mut graph,
            registry,
            &self.state,
            options.update_sources,
            options.persist,
        )
        .await?;

        let hashes = hash_graph(&mut graph, &contexts, &self.state.salt())?;

        let base_repo = self.base_repo(profile, platform)?;
        let has_bases = graph
            .iter()
            .any(|(_, node)| matches!(node, ImageNode::Base { .. }));
        let pending_bases = if has_bases {
            let repo = base_repo.as_deref().ok_or_else(|| {
                TplError::config("base_image_repo must be configured when base stages exist")
            })?;
            resolve_bases(&mut graph, registry, &self.state, repo, options.persist).await?
        } else {
            0
        };

        Ok(PreparedBuild {
            profile: profile.to_string(),
            platform: platform.to_string(),
            graph,
            hashes,
            contexts,
            base_repo,
            pending_bases,
        })
    }

    /// Restrict plan targets to the named stages. Base stages select
    /// their base wrappers; everything else selects stage wrappers.
    pub fn select_targets(
        &self,
        prepared: &PreparedBuild,
        stage_filter: &[String],
        bases_only: bool,
    ) -> Result<Option<Vec<NodeId>>> {
        let filter: BTreeSet<&str> = stage_filter.iter().map(String::as_str).collect();
        let mut matched: BTreeSet<&str> = BTreeSet::new();
        let mut targets = Vec::new();
        for &id in prepared.graph.targets() {
            let (name, is_base) = match prepared.graph.node(id) {
                ImageNode::Base { stage_name, .. } => (stage_name.as_str(), true),
                ImageNode::Stage { stage_name, .. } => (stage_name.as_str(), false),
                _ => continue,
            };
            if bases_only && !is_base {
                continue;
            }
            if !filter.is_empty() && !filter.contains(name) {
                continue;
            }
            matched.insert(name);
            targets.push(id);
        }
        for name in &filter {
            if !matched.contains(name) {
                return Err(TplError::config(format!(
                    "no {}stage named {name:?}",
                    if bases_only { "base " } else { "" }
                )));
            }
        }
        if filter.is_empty() && !bases_only {
            return Ok(None);
        }
        Ok(Some(targets))
    }

    /// Plan a prepared build.
    pub fn plan(
        &self,
        prepared: &PreparedBuild,
        targets: Option<Vec<NodeId>>,
        push_stages: bool,
        push_bases: bool,
    ) -> Result<BuildPlan> {
        let options = PlanOptions {
            base_repo: prepared.base_repo.clone(),
            push_stages,
            push_bases,
            targets,
            dockerfile_syntax: (!self.config.dockerfile_syntax.is_empty())
                .then(|| self.config.dockerfile_syntax.clone()),
        };
        plan(&prepared.graph, &prepared.hashes, &options)
    }

    /// Execute a plan and flush state afterwards, even on failure, so
    /// partial progress is never lost.
    pub async fn execute(
        &self,
        executor: &Executor,
        plan: &BuildPlan,
        prepared: &PreparedBuild,
    ) -> Result<()> {
        let result = executor.execute(plan, &prepared.contexts).await;
        self.state.save()?;
        result
    }

    /// Publish stages across the configured platforms: per-platform
    /// builds and pushes, then one OCI index per push name referencing
    /// the per-platform manifests.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish(
        &self,
        registry: &dyn Registry,
        client: Arc<dyn BuilderClient>,
        executor_for: impl Fn(Arc<dyn BuilderClient>) -> Executor,
        profile: &str,
        platforms: &[String],
        stage_filter: &[String],
    ) -> Result<()> {
        let multi = platforms.len() > 1;
        // push name -> platform -> digest of the pushed manifest
        let mut index_entries: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

        for platform in platforms {
            let suffix = multi.then(|| platform_slug(platform));
            let prepared = self
                .prepare_with_suffix(
                    profile,
                    platform,
                    suffix.as_deref(),
                    registry,
                    &PrepareOptions {
                        update_sources: false,
                        persist: true,
                    },
                )
                .await?;
            let targets = self.select_targets(&prepared, stage_filter, false)?;
            let plan = self.plan(&prepared, targets, true, true)?;

            let executor = executor_for(Arc::clone(&client));
            self.execute(&executor, &plan, &prepared).await?;

            if multi {
                for entry in &plan.entries {
                    if entry.base.is_some() {
                        continue;
                    }
                    for pushed in &entry.push_tags {
                        let Some(index_name) = pushed.strip_suffix(
                            &format!("-{}", platform_slug(platform)),
                        ) else {
                            continue;
                        };
                        let image = crate::graph::ImageRef::parse(pushed);
                        let digest = registry
                            .resolve_digest(&image.repo, &image.tag, platform)
                            .await?;
                        index_entries
                            .entry(index_name.to_string())
                            .or_default()
                            .insert(platform.clone(), digest);
                    }
                }
            }
        }

        for (name, digests) in index_entries {
            let image = crate::graph::ImageRef::parse(&name);
            let digest = registry
                .push_multiarch(&image.repo, &image.tag, &digests)
                .await?;
            info!(%name, %digest, "published image index");
        }
        Ok(())
    }
}
