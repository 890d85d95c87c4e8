//! Build planning.
//!
//! Partitions the hashed DAG into a minimal, ordered list of plan entries.
//! Maximal fan-out-1 runs of steps linked by primary parent edges collapse
//! into a single builder invocation; secondary (`COPY --from`) edges never
//! extend a chain, they only order entries. Cut points and other unnamed
//! outputs receive synthetic `tplbuild-<uuid>` tags that the executor
//! removes on exit.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use uuid::Uuid;

use crate::arch::platform_slug;
use crate::dockerfile::Verb;
use crate::error::{Result, TplError};
use crate::graph::{BuildGraph, GraphError, ImageNode, NodeId};

/// The kind of work a plan entry represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanEntryKind {
    /// One builder invocation over an inline sub-Dockerfile.
    Build,
    /// Retag of an already-known image.
    Tag { source: String },
    /// No-op marker: a base image already satisfied by the registry.
    Satisfied { digest: String },
}

/// One unit of work emitted by the planner.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    /// Position in the plan; entries only depend on lower ids.
    pub id: usize,
    /// Graph node this entry produces (the wrapper node when one exists).
    pub node: NodeId,
    pub kind: PlanEntryKind,
    pub platform: String,
    /// Inline sub-Dockerfile handed to the builder (`Build` only).
    pub dockerfile: Option<String>,
    /// Name of the build context streamed with the invocation.
    pub context: Option<String>,
    /// Tag the entry's output is created under.
    pub output_tag: String,
    /// Additional tags applied after the build.
    pub tags: Vec<String>,
    /// Tags pushed to their registry after tagging.
    pub push_tags: Vec<String>,
    /// Ids of plan entries that must complete first.
    pub deps: Vec<usize>,
    /// True when `output_tag` is synthetic and must be cleaned up.
    pub transient: bool,
    /// Set when this entry materialises a base image.
    pub base: Option<BaseOutput>,
    /// Stage name for publishable stage entries.
    pub stage_name: Option<String>,
}

/// Identity of a base image produced by a plan entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseOutput {
    pub stage_name: String,
    pub content_hash: String,
    pub platform: String,
}

/// An ordered build plan; every entry's dependencies precede it.
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    pub entries: Vec<PlanEntry>,
}

impl BuildPlan {
    /// Entries that invoke the builder.
    pub fn build_entries(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, PlanEntryKind::Build))
    }

    /// Base images that are not yet satisfied by the registry.
    pub fn pending_bases(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries
            .iter()
            .filter(|e| e.base.is_some() && !matches!(e.kind, PlanEntryKind::Satisfied { .. }))
    }
}

/// Planner inputs beyond the graph itself.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Repository where base images are cached; required when the plan
    /// must build or reference base images.
    pub base_repo: Option<String>,
    /// Push stage `push_tags` after building.
    pub push_stages: bool,
    /// Push freshly built base images to the base repo.
    pub push_bases: bool,
    /// Restrict planning to these wrapper nodes (default: all targets).
    pub targets: Option<Vec<NodeId>>,
    /// `# syntax=` directive prepended to synthesized Dockerfiles.
    pub dockerfile_syntax: Option<String>,
}

/// Registry tag under which a base image build is cached.
pub fn base_image_tag(content_hash: &str, platform: &str) -> String {
    format!("{content_hash}-{}", platform_slug(platform))
}

/// Full image name of a cached base image.
pub fn base_image_name(repo: &str, content_hash: &str, platform: &str) -> String {
    format!("{repo}:{}", base_image_tag(content_hash, platform))
}

fn transient_tag() -> String {
    format!("tplbuild-{}", Uuid::new_v4())
}

/// Compute the build plan for `graph`.
pub fn plan(graph: &BuildGraph, hashes: &[String], options: &PlanOptions) -> Result<BuildPlan> {
    let planner = Planner::new(graph, hashes, options);
    planner.plan()
}

/// Draft entry keyed by the graph node that produces it.
struct Draft {
    node: NodeId,
    kind: PlanEntryKind,
    dockerfile: Option<String>,
    context: Option<String>,
    output_tag: String,
    tags: Vec<String>,
    push_tags: Vec<String>,
    dep_nodes: BTreeSet<NodeId>,
    transient: bool,
    base: Option<BaseOutput>,
    stage_name: Option<String>,
}

struct Planner<'a> {
    graph: &'a BuildGraph,
    hashes: &'a [String],
    options: &'a PlanOptions,
    targets: Vec<NodeId>,
    needed: Vec<bool>,
    /// (dependent, via-primary-edge) pairs per node, needed nodes only.
    dependents: Vec<Vec<(NodeId, bool)>>,
    /// Step -> the chain end it belongs to.
    chain_of_step: HashMap<NodeId, NodeId>,
    /// Chain end -> steps head..end.
    chains: BTreeMap<NodeId, Vec<NodeId>>,
    /// Wrapper node -> draft key producing its image.
    wrapper_keys: HashMap<NodeId, NodeId>,
    /// Chain ends already claimed by a wrapper.
    claimed: BTreeSet<NodeId>,
    drafts: BTreeMap<NodeId, Draft>,
}

impl<'a> Planner<'a> {
    fn new(graph: &'a BuildGraph, hashes: &'a [String], options: &'a PlanOptions) -> Self {
        Self {
            graph,
            hashes,
            options,
            targets: Vec::new(),
            needed: vec![false; graph.len()],
            dependents: vec![Vec::new(); graph.len()],
            chain_of_step: HashMap::new(),
            chains: BTreeMap::new(),
            wrapper_keys: HashMap::new(),
            claimed: BTreeSet::new(),
            drafts: BTreeMap::new(),
        }
    }

    fn plan(mut self) -> Result<BuildPlan> {
        self.targets = match &self.options.targets {
            Some(targets) => targets.clone(),
            None => self.graph.targets().to_vec(),
        };

        self.mark_needed();
        self.collect_dependents();
        self.form_chains();
        self.attach_wrappers()?;
        self.render_dockerfiles()?;
        self.order_entries()
    }

    fn satisfied_digest(&self, id: NodeId) -> Option<&str> {
        match self.graph.node(id) {
            ImageNode::Base {
                resolved_digest, ..
            } => resolved_digest.as_deref(),
            _ => None,
        }
    }

    /// True for nodes the planner never descends past: leaves and base
    /// images already present in the registry.
    fn stops_descent(&self, id: NodeId) -> bool {
        self.satisfied_digest(id).is_some()
            || matches!(
                self.graph.node(id),
                ImageNode::Source { .. } | ImageNode::Context { .. }
            )
    }

    fn mark_needed(&mut self) {
        let mut stack = self.targets.clone();
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut self.needed[id], true) {
                continue;
            }
            if self.stops_descent(id) {
                continue;
            }
            stack.extend(self.graph.deps(id));
        }
    }

    fn collect_dependents(&mut self) {
        for (id, node) in self.graph.iter() {
            if !self.needed[id] || self.stops_descent(id) {
                continue;
            }
            if let Some(parent) = node.parent() {
                self.dependents[parent].push((id, true));
            }
            if let ImageNode::Step {
                context: Some(ctx), ..
            } = node
            {
                self.dependents[*ctx].push((id, false));
            }
        }
    }

    /// The step a chain may extend into from `id`: its sole needed
    /// dependent, when that dependent is a step hanging off the primary
    /// parent edge.
    fn chain_continuation(&self, id: NodeId) -> Option<NodeId> {
        match self.dependents[id].as_slice() {
            [(dep, true)] if matches!(self.graph.node(*dep), ImageNode::Step { .. }) => Some(*dep),
            _ => None,
        }
    }

    fn form_chains(&mut self) {
        for (id, node) in self.graph.iter() {
            if !self.needed[id] || !matches!(node, ImageNode::Step { .. }) {
                continue;
            }
            if self.chain_continuation(id).is_some() {
                continue;
            }

            // `id` ends a maximal chain; walk back to its head.
            let mut chain = vec![id];
            let mut cursor = id;
            loop {
                let parent = self.graph.node(cursor).parent().expect("steps have parents");
                if self.stops_descent(parent)
                    || !matches!(self.graph.node(parent), ImageNode::Step { .. })
                    || self.chain_continuation(parent) != Some(cursor)
                {
                    break;
                }
                cursor = parent;
                chain.push(parent);
            }
            chain.reverse();

            for step in &chain {
                self.chain_of_step.insert(*step, id);
            }
            self.chains.insert(id, chain);
            self.drafts.insert(
                id,
                Draft {
                    node: id,
                    kind: PlanEntryKind::Build,
                    dockerfile: None,
                    context: None,
                    output_tag: transient_tag(),
                    tags: Vec::new(),
                    push_tags: Vec::new(),
                    dep_nodes: BTreeSet::new(),
                    transient: true,
                    base: None,
                    stage_name: None,
                },
            );
        }
    }

    fn base_repo(&self) -> Result<&str> {
        self.options.base_repo.as_deref().ok_or_else(|| {
            TplError::config("base_image_repo must be configured when base stages exist")
        })
    }

    /// Attach wrapper nodes to the chains that produce them, giving the
    /// chain the wrapper's tags, or emitting Tag/Satisfied entries when
    /// there is no chain to claim.
    fn attach_wrappers(&mut self) -> Result<()> {
        for (id, node) in self.graph.iter() {
            if !self.needed[id] {
                continue;
            }
            match node {
                ImageNode::Base {
                    parent,
                    stage_name,
                    platform,
                    content_hash,
                    resolved_digest,
                    profile: _,
                } => {
                    let content_hash = content_hash.clone().ok_or_else(|| {
                        TplError::config(format!("base stage {stage_name:?} was never hashed"))
                    })?;
                    let name =
                        base_image_name(self.base_repo()?, &content_hash, platform);

                    if let Some(digest) = resolved_digest {
                        if self.targets.contains(&id) {
                            self.drafts.insert(
                                id,
                                Draft {
                                    node: id,
                                    kind: PlanEntryKind::Satisfied {
                                        digest: digest.clone(),
                                    },
                                    dockerfile: None,
                                    context: None,
                                    output_tag: name,
                                    tags: Vec::new(),
                                    push_tags: Vec::new(),
                                    dep_nodes: BTreeSet::new(),
                                    transient: false,
                                    base: Some(BaseOutput {
                                        stage_name: stage_name.clone(),
                                        content_hash,
                                        platform: platform.clone(),
                                    }),
                                    stage_name: None,
                                },
                            );
                            self.wrapper_keys.insert(id, id);
                        }
                        continue;
                    }

                    let base = BaseOutput {
                        stage_name: stage_name.clone(),
                        content_hash,
                        platform: platform.clone(),
                    };
                    let push_tags = if self.options.push_bases {
                        vec![name.clone()]
                    } else {
                        Vec::new()
                    };
                    self.claim_or_tag(
                        id,
                        *parent,
                        name,
                        false,
                        Vec::new(),
                        push_tags,
                        Some(base),
                        None,
                    )?;
                }
                ImageNode::Stage {
                    parent,
                    stage_name,
                    publish_tags,
                    push_tags,
                    ..
                } => {
                    if !self.targets.contains(&id) {
                        continue;
                    }
                    let push_tags = if self.options.push_stages {
                        push_tags.clone()
                    } else {
                        Vec::new()
                    };
                    let (output, transient) =
                        match publish_tags.first().or_else(|| push_tags.first()) {
                            Some(tag) => (tag.clone(), false),
                            None => (transient_tag(), true),
                        };
                    let mut tags: Vec<String> = publish_tags
                        .iter()
                        .chain(push_tags.iter())
                        .filter(|tag| **tag != output)
                        .cloned()
                        .collect();
                    tags.dedup();
                    self.claim_or_tag(
                        id,
                        *parent,
                        output,
                        transient,
                        tags,
                        push_tags,
                        None,
                        Some(stage_name.clone()),
                    )?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Give a wrapper's identity to the chain producing its parent, or
    /// emit a Tag entry when the parent is not an unclaimed chain end.
    #[allow(clippy::too_many_arguments)]
    fn claim_or_tag(
        &mut self,
        wrapper: NodeId,
        parent: NodeId,
        output_tag: String,
        transient: bool,
        tags: Vec<String>,
        push_tags: Vec<String>,
        base: Option<BaseOutput>,
        stage_name: Option<String>,
    ) -> Result<()> {
        if let Some(&chain_end) = self.chain_of_step.get(&parent) {
            let claimable = chain_end == parent && self.claimed.insert(chain_end);
            let draft = self.drafts.get_mut(&chain_end).expect("chain has draft");
            if claimable {
                // Unclaimed chain ending exactly at the wrapper's parent.
                draft.node = wrapper;
                draft.output_tag = output_tag;
                draft.tags = tags;
                draft.push_tags = push_tags;
                draft.transient = transient;
                draft.base = base;
                draft.stage_name = stage_name;
                self.wrapper_keys.insert(wrapper, chain_end);
                return Ok(());
            }
            // Chain already claimed (or the parent is mid-chain, which
            // cannot happen for wrapper parents): retag its output.
            let source = draft.output_tag.clone();
            self.drafts.insert(
                wrapper,
                Draft {
                    node: wrapper,
                    kind: PlanEntryKind::Tag { source },
                    dockerfile: None,
                    context: None,
                    output_tag,
                    tags,
                    push_tags,
                    dep_nodes: BTreeSet::from([chain_end]),
                    transient,
                    base,
                    stage_name,
                },
            );
            self.wrapper_keys.insert(wrapper, wrapper);
            return Ok(());
        }

        // No chain: the wrapper aliases a leaf (source or satisfied base).
        let source = self.leaf_name(parent)?;
        self.drafts.insert(
            wrapper,
            Draft {
                node: wrapper,
                kind: PlanEntryKind::Tag { source },
                dockerfile: None,
                context: None,
                output_tag,
                tags,
                push_tags,
                dep_nodes: BTreeSet::new(),
                transient,
                base,
                stage_name,
            },
        );
        self.wrapper_keys.insert(wrapper, wrapper);
        Ok(())
    }

    /// Registry-resolvable name of a leaf node.
    fn leaf_name(&self, id: NodeId) -> Result<String> {
        match self.graph.node(id) {
            ImageNode::Source {
                repo, tag, digest, ..
            } => {
                if repo == "scratch" {
                    return Ok("scratch".to_string());
                }
                let digest = digest.as_deref().ok_or_else(|| {
                    TplError::Graph(GraphError::UnresolvedSource {
                        repo: repo.clone(),
                        tag: tag.clone(),
                    })
                })?;
                Ok(format!("{repo}@{digest}"))
            }
            ImageNode::Base {
                content_hash,
                platform,
                resolved_digest,
                stage_name,
                ..
            } => {
                debug_assert!(resolved_digest.is_some(), "leaf base must be satisfied");
                let content_hash = content_hash.as_deref().ok_or_else(|| {
                    TplError::config(format!("base stage {stage_name:?} was never hashed"))
                })?;
                Ok(base_image_name(self.base_repo()?, content_hash, platform))
            }
            _ => Err(TplError::config(
                "internal planner error: unexpected leaf node",
            )),
        }
    }

    /// Name another entry's output is referenced by, adding the entry
    /// dependency to `deps`.
    fn reference_name(&self, id: NodeId, deps: &mut BTreeSet<NodeId>) -> Result<String> {
        if self.stops_descent(id) && !matches!(self.graph.node(id), ImageNode::Context { .. }) {
            return self.leaf_name(id);
        }
        let key = match self.graph.node(id) {
            ImageNode::Step { .. } => *self.chain_of_step.get(&id).ok_or_else(|| {
                TplError::config("internal planner error: step without chain")
            })?,
            ImageNode::Context { .. } => id,
            ImageNode::Base { .. } | ImageNode::Stage { .. } => {
                *self.wrapper_keys.get(&id).ok_or_else(|| {
                    TplError::config("internal planner error: wrapper without entry")
                })?
            }
            ImageNode::Source { .. } => unreachable!("handled by stops_descent"),
        };
        deps.insert(key);
        Ok(self
            .drafts
            .get(&key)
            .expect("referenced draft exists")
            .output_tag
            .clone())
    }

    /// Ensure a context is materialised as an image for `COPY --from`.
    fn ensure_context_draft(&mut self, id: NodeId, name: &str) {
        if self.drafts.contains_key(&id) {
            return;
        }
        self.drafts.insert(
            id,
            Draft {
                node: id,
                kind: PlanEntryKind::Build,
                dockerfile: Some("FROM scratch\nCOPY . /\n".to_string()),
                context: Some(name.to_string()),
                output_tag: transient_tag(),
                tags: Vec::new(),
                push_tags: Vec::new(),
                dep_nodes: BTreeSet::new(),
                transient: true,
                base: None,
                stage_name: None,
            },
        );
    }

    /// Render each chain's inline sub-Dockerfile, now that every entry's
    /// output name is final.
    fn render_dockerfiles(&mut self) -> Result<()> {
        let chain_ends: Vec<NodeId> = self.chains.keys().copied().collect();
        for end in chain_ends {
            let chain = self.chains[&end].clone();
            let mut deps = BTreeSet::new();
            let mut inline_context: Option<String> = None;
            let mut lines = Vec::new();

            let head = chain[0];
            let parent = self
                .graph
                .node(head)
                .parent()
                .expect("chain heads are steps");
            let baseline = self.reference_name_or_leaf(parent, &mut deps)?;
            lines.push(format!("FROM {baseline}"));

            for &step in &chain {
                let ImageNode::Step {
                    instruction,
                    context,
                    ..
                } = self.graph.node(step)
                else {
                    unreachable!("chains contain steps only");
                };
                let line = match (instruction.verb.clone(), context) {
                    (Verb::Copy | Verb::Add, Some(ctx)) => {
                        match self.graph.node(*ctx) {
                            ImageNode::Context { name } => {
                                let name = name.clone();
                                match &inline_context {
                                    None => {
                                        inline_context = Some(name);
                                        instruction.canonical()
                                    }
                                    Some(inline) if *inline == name => instruction.canonical(),
                                    Some(_) => {
                                        // A second distinct context rides
                                        // along as a separate image.
                                        self.ensure_context_draft(*ctx, &name);
                                        let tag = self.reference_name(*ctx, &mut deps)?;
                                        instruction.with_flag("from", &tag).canonical()
                                    }
                                }
                            }
                            _ => {
                                let tag = self.reference_name_or_leaf(*ctx, &mut deps)?;
                                instruction.with_flag("from", &tag).canonical()
                            }
                        }
                    }
                    _ => instruction.canonical(),
                };
                lines.push(line);
            }

            let mut dockerfile = String::new();
            if let Some(syntax) = self
                .options
                .dockerfile_syntax
                .as_deref()
                .filter(|s| !s.is_empty())
            {
                dockerfile.push_str(&format!("# syntax={syntax}\n"));
            }
            for line in lines {
                dockerfile.push_str(&line);
                dockerfile.push('\n');
            }

            let draft = self.drafts.get_mut(&end).expect("chain has draft");
            draft.dockerfile = Some(dockerfile);
            draft.context = inline_context;
            draft.dep_nodes.extend(deps);
        }
        Ok(())
    }

    fn reference_name_or_leaf(
        &mut self,
        id: NodeId,
        deps: &mut BTreeSet<NodeId>,
    ) -> Result<String> {
        if let ImageNode::Context { name } = self.graph.node(id) {
            let name = name.clone();
            self.ensure_context_draft(id, &name);
        }
        self.reference_name(id, deps)
    }

    /// Emit entries dependencies-first; among simultaneously-ready
    /// entries the deterministic node hash breaks ties.
    fn order_entries(self) -> Result<BuildPlan> {
        let mut remaining: BTreeMap<NodeId, Draft> = self.drafts;
        let mut emitted: HashMap<NodeId, usize> = HashMap::new();
        let mut entries = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut ready: Vec<NodeId> = remaining
                .iter()
                .filter(|(_, draft)| {
                    draft
                        .dep_nodes
                        .iter()
                        .all(|dep| emitted.contains_key(dep))
                })
                .map(|(&key, _)| key)
                .collect();
            if ready.is_empty() {
                return Err(TplError::config(
                    "internal planner error: dependency cycle among plan entries",
                ));
            }
            ready.sort_by(|a, b| {
                let draft_a = &remaining[a];
                let draft_b = &remaining[b];
                self.hashes[draft_a.node].cmp(&self.hashes[draft_b.node])
            });

            for key in ready {
                let draft = remaining.remove(&key).expect("ready key present");
                let id = entries.len();
                emitted.insert(key, id);
                let deps: Vec<usize> = draft
                    .dep_nodes
                    .iter()
                    .map(|dep| emitted[dep])
                    .collect();
                entries.push(PlanEntry {
                    id,
                    node: draft.node,
                    kind: draft.kind,
                    platform: self.graph.platform.clone(),
                    dockerfile: draft.dockerfile,
                    context: draft.context,
                    output_tag: draft.output_tag,
                    tags: draft.tags,
                    push_tags: draft.push_tags,
                    deps,
                    transient: draft.transient,
                    base: draft.base,
                    stage_name: draft.stage_name,
                });
            }
        }

        Ok(BuildPlan { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BuildContext;
    use crate::dockerfile::parse;
    use crate::graph::{GraphOptions, StageOverride};
    use crate::hash::hash_graph;

    fn plan_for(text: &str, options: &PlanOptions) -> (BuildGraph, BuildPlan) {
        plan_with_graph_options(text, options, GraphOptions::new("linux/amd64", "default"))
    }

    fn plan_with_graph_options(
        text: &str,
        options: &PlanOptions,
        graph_options: GraphOptions,
    ) -> (BuildGraph, BuildPlan) {
        let parsed = parse(text).unwrap();
        let mut graph = BuildGraph::from_dockerfile(&parsed, &graph_options).unwrap();
        for id in 0..graph.len() {
            if let ImageNode::Source { digest, .. } = graph.node_mut(id) {
                *digest = Some("sha256:feedface".to_string());
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let mut contexts = std::collections::BTreeMap::new();
        contexts.insert(
            "default".to_string(),
            BuildContext::new("default", Some(dir.path().to_path_buf()), Some(0o022), &[])
                .unwrap(),
        );
        contexts.insert(
            "assets".to_string(),
            BuildContext::new("assets", Some(dir.path().to_path_buf()), Some(0o022), &[])
                .unwrap(),
        );
        let hashes = hash_graph(&mut graph, &contexts, "salt").unwrap();
        let plan = plan(&graph, &hashes, options).unwrap();
        (graph, plan)
    }

    fn assert_deps_precede(plan: &BuildPlan) {
        for entry in &plan.entries {
            for &dep in &entry.deps {
                assert!(dep < entry.id, "entry {} depends on later entry {dep}", entry.id);
            }
        }
    }

    #[test]
    fn test_linear_stages_collapse_into_one_invocation() {
        // Stages chained by FROM with fan-out 1 along primary edges form
        // one maximal chain, hence one builder invocation.
        let (_, plan) = plan_for(
            "FROM alpine:3.19 AS anon-a\n\
             RUN echo a\n\
             FROM anon-a AS app\n\
             RUN echo b\n\
             CMD [\"app\"]\n",
            &PlanOptions::default(),
        );
        assert_eq!(plan.build_entries().count(), 1);
        assert_deps_precede(&plan);

        let entry = plan.build_entries().next().unwrap();
        let dockerfile = entry.dockerfile.as_deref().unwrap();
        assert_eq!(
            dockerfile,
            "FROM alpine@sha256:feedface\nRUN echo a\nRUN echo b\nCMD [\"app\"]\n"
        );
    }

    #[test]
    fn test_copy_linked_stages_get_one_invocation_each() {
        // Dependencies through COPY --from are secondary edges: each stage
        // stays its own chain even with fan-out 1.
        let text = "FROM alpine:3.19 AS anon-fib-0\n\
                    RUN echo 0 > /fib\n\
                    FROM alpine:3.19 AS anon-fib-1\n\
                    COPY --from=anon-fib-0 /fib /prev\n\
                    RUN echo 1 > /fib\n\
                    FROM alpine:3.19 AS anon-fib-2\n\
                    COPY --from=anon-fib-1 /fib /prev\n\
                    RUN cat /prev > /fib\n\
                    FROM anon-fib-2 AS app\n\
                    CMD [\"cat\", \"/fib\"]\n";
        let (_, plan) = plan_for(text, &PlanOptions::default());
        // anon-fib-0, anon-fib-1, anon-fib-2 + app (merged into fib-2's
        // chain via the primary edge) = 3 invocations.
        assert_eq!(plan.build_entries().count(), 3);
        assert_deps_precede(&plan);
    }

    #[test]
    fn test_fan_out_creates_cut_point() {
        let text = "FROM alpine:3.19 AS anon-common\n\
                    RUN echo shared > /shared\n\
                    FROM anon-common AS left\n\
                    RUN echo left\n\
                    FROM anon-common AS right\n\
                    RUN echo right\n";
        let (_, plan) = plan_for(text, &PlanOptions::default());
        // The shared prefix becomes its own invocation with a transient
        // tag; both consumers reference it.
        assert_eq!(plan.build_entries().count(), 3);
        assert_deps_precede(&plan);

        let cut = plan
            .entries
            .iter()
            .find(|e| {
                plan.entries
                    .iter()
                    .filter(|other| other.deps.contains(&e.id))
                    .count()
                    == 2
            })
            .expect("cut point entry");
        assert!(cut.transient);
        assert!(cut.output_tag.starts_with("tplbuild-"));

        let consumers: Vec<&PlanEntry> = plan
            .entries
            .iter()
            .filter(|e| e.deps.contains(&cut.id))
            .collect();
        assert_eq!(consumers.len(), 2);
        for consumer in consumers {
            let dockerfile = consumer.dockerfile.as_deref().unwrap();
            assert!(dockerfile.starts_with(&format!("FROM {}", cut.output_tag)));
        }
    }

    #[test]
    fn test_satisfied_base_is_skipped() {
        let text = "FROM python:3.10 AS base-deps\n\
                    RUN pip install flask\n\
                    FROM base-deps AS app\n\
                    CMD [\"python\"]\n";
        let parsed = parse(text).unwrap();
        let mut graph =
            BuildGraph::from_dockerfile(&parsed, &GraphOptions::new("linux/amd64", "default"))
                .unwrap();
        for id in 0..graph.len() {
            if let ImageNode::Source { digest, .. } = graph.node_mut(id) {
                *digest = Some("sha256:feedface".to_string());
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let mut contexts = std::collections::BTreeMap::new();
        contexts.insert(
            "default".to_string(),
            BuildContext::new("default", Some(dir.path().to_path_buf()), Some(0o022), &[])
                .unwrap(),
        );
        let hashes = hash_graph(&mut graph, &contexts, "salt").unwrap();

        // Mark the base image satisfied, as a registry probe would.
        let mut base_name = None;
        for id in 0..graph.len() {
            if let ImageNode::Base {
                resolved_digest,
                content_hash,
                platform,
                ..
            } = graph.node_mut(id)
            {
                *resolved_digest = Some("sha256:cafe".to_string());
                base_name = Some(base_image_name(
                    "registry.example.com/bases",
                    content_hash.as_deref().unwrap(),
                    platform,
                ));
            }
        }

        let options = PlanOptions {
            base_repo: Some("registry.example.com/bases".to_string()),
            ..Default::default()
        };
        let plan = plan(&graph, &hashes, &options).unwrap();

        // No invocation rebuilds the base; the app chain FROMs the cached
        // base image name directly.
        assert_eq!(plan.build_entries().count(), 1);
        let entry = plan.build_entries().next().unwrap();
        assert!(entry
            .dockerfile
            .as_deref()
            .unwrap()
            .starts_with(&format!("FROM {}", base_name.unwrap())));
    }

    #[test]
    fn test_pending_base_gets_content_hash_tag() {
        let text = "FROM python:3.10 AS base-deps\n\
                    RUN pip install flask\n";
        let options = PlanOptions {
            base_repo: Some("registry.example.com/bases".to_string()),
            push_bases: true,
            ..Default::default()
        };
        let (graph, plan) = plan_for(text, &options);
        assert_eq!(plan.pending_bases().count(), 1);

        let entry = plan.pending_bases().next().unwrap();
        let base = entry.base.as_ref().unwrap();
        let expected = base_image_name(
            "registry.example.com/bases",
            &base.content_hash,
            &graph.platform,
        );
        assert_eq!(entry.output_tag, expected);
        assert_eq!(entry.push_tags, vec![expected]);
        assert!(!entry.transient);
    }

    #[test]
    fn test_base_without_repo_fails() {
        let parsed = parse("FROM python:3.10 AS base-deps\nRUN true\n").unwrap();
        let mut graph =
            BuildGraph::from_dockerfile(&parsed, &GraphOptions::new("linux/amd64", "default"))
                .unwrap();
        for id in 0..graph.len() {
            if let ImageNode::Source { digest, .. } = graph.node_mut(id) {
                *digest = Some("sha256:feedface".to_string());
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let mut contexts = std::collections::BTreeMap::new();
        contexts.insert(
            "default".to_string(),
            BuildContext::new("default", Some(dir.path().to_path_buf()), Some(0o022), &[])
                .unwrap(),
        );
        let hashes = hash_graph(&mut graph, &contexts, "salt").unwrap();
        let err = plan(&graph, &hashes, &PlanOptions::default()).unwrap_err();
        assert!(matches!(err, TplError::Config { .. }));
    }

    #[test]
    fn test_stage_tags_and_push() {
        let text = "FROM alpine:3.19 AS app\nRUN echo hi\n";
        let mut graph_options = GraphOptions::new("linux/amd64", "default");
        graph_options.stage_overrides.insert(
            "app".to_string(),
            StageOverride {
                base: None,
                publish_tags: vec!["app:latest".to_string(), "app:dev".to_string()],
                push_tags: vec!["registry.example.com/app:v1".to_string()],
            },
        );
        let options = PlanOptions {
            push_stages: true,
            ..Default::default()
        };
        let (_, plan) = plan_with_graph_options(text, &options, graph_options);

        let entry = plan.build_entries().next().unwrap();
        assert_eq!(entry.output_tag, "app:latest");
        assert_eq!(
            entry.tags,
            vec!["app:dev".to_string(), "registry.example.com/app:v1".to_string()]
        );
        assert_eq!(entry.push_tags, vec!["registry.example.com/app:v1".to_string()]);
        assert!(!entry.transient);
        assert_eq!(entry.stage_name.as_deref(), Some("app"));
    }

    #[test]
    fn test_copy_from_second_context_materialised() {
        let text = "FROM alpine:3.19 AS app\n\
                    COPY config.yml /etc/app.yml\n\
                    COPY --from=assets logo.png /srv/logo.png\n";
        let mut graph_options = GraphOptions::new("linux/amd64", "default");
        graph_options.context_names.insert("assets".to_string());
        let (_, plan) = plan_with_graph_options(text, &PlanOptions::default(), graph_options);

        // The default context is inlined; the assets context becomes its
        // own FROM scratch entry.
        let context_entry = plan
            .entries
            .iter()
            .find(|e| e.context.as_deref() == Some("assets"))
            .expect("assets context entry");
        assert_eq!(
            context_entry.dockerfile.as_deref(),
            Some("FROM scratch\nCOPY . /\n")
        );

        let app_entry = plan
            .entries
            .iter()
            .find(|e| e.context.as_deref() == Some("default"))
            .expect("app entry");
        assert!(app_entry.deps.contains(&context_entry.id));
        assert!(app_entry
            .dockerfile
            .as_deref()
            .unwrap()
            .contains(&format!("COPY --from={}", context_entry.output_tag)));
    }

    #[test]
    fn test_plan_order_deterministic() {
        let text = "FROM alpine:3.19 AS anon-a\n\
                    RUN echo a\n\
                    FROM alpine:3.19 AS anon-b\n\
                    RUN echo b\n\
                    FROM alpine:3.19 AS app\n\
                    COPY --from=anon-a /a /a\n\
                    COPY --from=anon-b /b /b\n";
        let (_, first) = plan_for(text, &PlanOptions::default());
        let (_, second) = plan_for(text, &PlanOptions::default());
        let order_of = |plan: &BuildPlan| -> Vec<NodeId> {
            plan.entries.iter().map(|e| e.node).collect()
        };
        assert_eq!(order_of(&first), order_of(&second));
        assert_deps_precede(&first);
    }

    #[test]
    fn test_dockerfile_syntax_prepended() {
        let options = PlanOptions {
            dockerfile_syntax: Some("docker/dockerfile:1.4".to_string()),
            ..Default::default()
        };
        let (_, plan) = plan_for("FROM alpine:3.19 AS app\nRUN echo hi\n", &options);
        let entry = plan.build_entries().next().unwrap();
        assert!(entry
            .dockerfile
            .as_deref()
            .unwrap()
            .starts_with("# syntax=docker/dockerfile:1.4\n"));
    }
}
