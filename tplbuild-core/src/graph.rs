//! Build graph construction.
//!
//! Lowers parsed Dockerfile stages into a DAG of typed image nodes. Nodes
//! live in an arena indexed by `NodeId`; every non-source node has exactly
//! one primary parent and may carry a secondary dependency introduced by
//! `COPY --from` or by consuming a build context. Stage references resolve
//! to earlier stages only, so the arena is topologically ordered by
//! construction; validation re-checks that invariant anyway.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::dockerfile::{name_is_anon, name_is_base, Dockerfile, Instruction, Verb};

/// Index of a node within its [`BuildGraph`] arena.
pub type NodeId = usize;

/// The DAG vertex. Common fields (`platform`, `profile`, hashes) sit on
/// the variants that need them; variant-specific fields are matched at
/// plan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageNode {
    /// Externally produced image, locked by digest before hashing.
    Source {
        repo: String,
        tag: String,
        platform: String,
        digest: Option<String>,
    },
    /// Virtual image standing for a build context's file tree.
    Context { name: String },
    /// One Dockerfile instruction applied to its parent. `context` is the
    /// secondary dependency for instructions that consume files or copy
    /// from another stage or image.
    Step {
        parent: NodeId,
        instruction: Instruction,
        context: Option<NodeId>,
    },
    /// A materialisable cached image stored in the base-image repo.
    Base {
        parent: NodeId,
        stage_name: String,
        platform: String,
        profile: String,
        content_hash: Option<String>,
        resolved_digest: Option<String>,
    },
    /// A top-level publishable image.
    Stage {
        parent: NodeId,
        stage_name: String,
        platform: String,
        profile: String,
        publish_tags: Vec<String>,
        push_tags: Vec<String>,
    },
}

impl ImageNode {
    /// The primary build parent, if any.
    pub fn parent(&self) -> Option<NodeId> {
        match self {
            ImageNode::Source { .. } | ImageNode::Context { .. } => None,
            ImageNode::Step { parent, .. }
            | ImageNode::Base { parent, .. }
            | ImageNode::Stage { parent, .. } => Some(*parent),
        }
    }
}

/// Error raised while constructing or validating the build graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error(
        "stage {stage:?}: reference to undefined stage {name:?} \
         (stages may only reference earlier stages)"
    )]
    UndefinedStage { stage: String, name: String },
    #[error("stage {stage:?}: PUSHCONTEXT references unknown context {name:?}")]
    UndefinedContext { stage: String, name: String },
    #[error("stage {stage:?}: POPCONTEXT with no pushed context")]
    ContextStackEmpty { stage: String },
    #[error("base stage {stage:?} depends on anon stage {anon_stage:?}")]
    AnonDependency { stage: String, anon_stage: String },
    #[error("cycle detected in build graph at node {node}")]
    Cycle { node: NodeId },
    #[error("source image {repo}:{tag} has no resolved digest")]
    UnresolvedSource { repo: String, tag: String },
}

/// Per-stage configuration overrides applied during lowering. The
/// explicit `base` flag is authoritative over name-prefix classification.
#[derive(Debug, Clone, Default)]
pub struct StageOverride {
    pub base: Option<bool>,
    pub publish_tags: Vec<String>,
    pub push_tags: Vec<String>,
}

/// Inputs controlling how stages lower into the graph.
#[derive(Debug, Clone)]
pub struct GraphOptions {
    pub platform: String,
    pub profile: String,
    /// Names of configured build contexts.
    pub context_names: BTreeSet<String>,
    /// Context assigned to stages that never issue `PUSHCONTEXT`.
    pub default_context: String,
    pub stage_overrides: BTreeMap<String, StageOverride>,
}

impl GraphOptions {
    pub fn new(platform: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            profile: profile.into(),
            context_names: [String::from("default")].into(),
            default_context: "default".to_string(),
            stage_overrides: BTreeMap::new(),
        }
    }
}

/// An external image reference split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repo: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse `repo[:tag][@digest]`, defaulting the tag to `latest`.
    pub fn parse(reference: &str) -> ImageRef {
        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (reference, None),
        };
        // A ':' after the last '/' separates the tag; earlier colons
        // belong to a registry port.
        let split_at = name_tag
            .rfind(':')
            .filter(|idx| !name_tag[idx + 1..].contains('/'));
        let (repo, tag) = match split_at {
            Some(idx) => (&name_tag[..idx], name_tag[idx + 1..].to_string()),
            None => (name_tag, "latest".to_string()),
        };
        ImageRef {
            repo: repo.to_string(),
            tag,
            digest,
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{}@{}", self.repo, digest),
            None => write!(f, "{}:{}", self.repo, self.tag),
        }
    }
}

/// The lowered build graph for one (profile, platform) rendering.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    pub platform: String,
    pub profile: String,
    nodes: Vec<ImageNode>,
    targets: Vec<NodeId>,
    /// Terminal node -> stage name for anon stages, used by validation.
    anon_terminals: HashMap<NodeId, String>,
}

impl BuildGraph {
    /// Lower parsed stages into a graph and validate it.
    pub fn from_dockerfile(
        parsed: &Dockerfile,
        options: &GraphOptions,
    ) -> Result<BuildGraph, GraphError> {
        let mut lowering = Lowering {
            options,
            nodes: Vec::new(),
            targets: Vec::new(),
            stage_names: parsed.stages.iter().map(|s| s.name.clone()).collect(),
            stage_refs: HashMap::new(),
            source_nodes: HashMap::new(),
            context_nodes: HashMap::new(),
            anon_terminals: HashMap::new(),
        };
        for stage in &parsed.stages {
            lowering.lower_stage(stage)?;
        }

        let graph = BuildGraph {
            platform: options.platform.clone(),
            profile: options.profile.clone(),
            nodes: lowering.nodes,
            targets: lowering.targets,
            anon_terminals: lowering.anon_terminals,
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn node(&self, id: NodeId) -> &ImageNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ImageNode {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &ImageNode)> {
        self.nodes.iter().enumerate()
    }

    /// Base and Stage wrapper nodes, in stage order.
    pub fn targets(&self) -> &[NodeId] {
        &self.targets
    }

    /// Dependencies of a node: primary parent first, then the secondary
    /// context/copy-source edge.
    pub fn deps(&self, id: NodeId) -> Vec<NodeId> {
        match &self.nodes[id] {
            ImageNode::Source { .. } | ImageNode::Context { .. } => Vec::new(),
            ImageNode::Step {
                parent, context, ..
            } => {
                let mut deps = vec![*parent];
                deps.extend(context.iter().copied());
                deps
            }
            ImageNode::Base { parent, .. } | ImageNode::Stage { parent, .. } => vec![*parent],
        }
    }

    /// Nodes reachable from `roots`, as a bitmap indexed by `NodeId`.
    pub fn reachable(&self, roots: &[NodeId]) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id], true) {
                continue;
            }
            stack.extend(self.deps(id));
        }
        seen
    }

    /// Distinct source images referenced by the graph, excluding scratch.
    pub fn source_images(&self) -> Vec<(NodeId, String, String, String)> {
        self.iter()
            .filter_map(|(id, node)| match node {
                ImageNode::Source {
                    repo,
                    tag,
                    platform,
                    ..
                } if repo != "scratch" => {
                    Some((id, repo.clone(), tag.clone(), platform.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Cycle check plus the anon-dependency invariant: a base stage's
    /// subtree may not reach an anon stage's terminal.
    fn validate(&self) -> Result<(), GraphError> {
        // References only point at earlier arena slots; a forward edge
        // would imply a cycle.
        for (id, _) in self.iter() {
            for dep in self.deps(id) {
                if dep >= id {
                    return Err(GraphError::Cycle { node: id });
                }
            }
        }

        for &target in &self.targets {
            let ImageNode::Base { stage_name, .. } = self.node(target) else {
                continue;
            };
            let seen = self.reachable(&[target]);
            for (terminal, anon_stage) in &self.anon_terminals {
                if seen[*terminal] {
                    return Err(GraphError::AnonDependency {
                        stage: stage_name.clone(),
                        anon_stage: anon_stage.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

struct Lowering<'a> {
    options: &'a GraphOptions,
    nodes: Vec<ImageNode>,
    targets: Vec<NodeId>,
    /// Every stage name in the file, defined or not yet reached.
    stage_names: std::collections::HashSet<String>,
    /// Stage name -> node a later stage should reference: the Base
    /// wrapper for base stages, the terminal step otherwise.
    stage_refs: HashMap<String, NodeId>,
    source_nodes: HashMap<(String, String), NodeId>,
    context_nodes: HashMap<String, NodeId>,
    anon_terminals: HashMap<NodeId, String>,
}

impl Lowering<'_> {
    fn push(&mut self, node: ImageNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn source_node(&mut self, reference: &str) -> NodeId {
        let image = ImageRef::parse(reference);
        let key = (image.repo.clone(), image.tag.clone());
        if let Some(&id) = self.source_nodes.get(&key) {
            return id;
        }
        let id = self.push(ImageNode::Source {
            repo: image.repo,
            tag: image.tag,
            platform: self.options.platform.clone(),
            digest: image.digest,
        });
        self.source_nodes.insert(key, id);
        id
    }

    fn context_node(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.context_nodes.get(name) {
            return id;
        }
        let id = self.push(ImageNode::Context {
            name: name.to_string(),
        });
        self.context_nodes.insert(name.to_string(), id);
        id
    }

    /// Resolve a `FROM` or `COPY --from` operand that is not a declared
    /// context: an earlier stage's image, or an external source image.
    /// Names belonging to a later stage in the file, or carrying a stage
    /// prefix without naming any stage, are rejected instead of being
    /// fabricated into registry lookups that can only 404.
    fn resolve_image_ref(&mut self, name: &str, stage: &str) -> Result<NodeId, GraphError> {
        if let Some(&id) = self.stage_refs.get(name) {
            return Ok(id);
        }
        // A registry/tag/digest separator rules out a stage name; a bare
        // name with a stage prefix can only be a (broken) stage
        // reference.
        let could_be_stage = !name.contains(['/', ':', '@']);
        if self.stage_names.contains(name)
            || (could_be_stage && (name_is_base(name) || name_is_anon(name)))
        {
            return Err(GraphError::UndefinedStage {
                stage: stage.to_string(),
                name: name.to_string(),
            });
        }
        Ok(self.source_node(name))
    }

    fn lower_stage(&mut self, stage: &crate::dockerfile::Stage) -> Result<(), GraphError> {
        let overrides = self.options.stage_overrides.get(&stage.name);
        // The explicit config flag is authoritative; name prefixes are
        // only the default classification.
        let base = overrides
            .and_then(|o| o.base)
            .unwrap_or(stage.base);
        let anon = !base && stage.anon;

        let mut cursor = self.resolve_image_ref(&stage.base_ref, &stage.name)?;

        let mut context_stack = vec![self.options.default_context.clone()];
        for inst in &stage.instructions {
            match &inst.verb {
                Verb::PushContext => {
                    let name = inst.args.trim();
                    if !self.options.context_names.contains(name) {
                        return Err(GraphError::UndefinedContext {
                            stage: stage.name.clone(),
                            name: name.to_string(),
                        });
                    }
                    context_stack.push(name.to_string());
                }
                Verb::PopContext => {
                    if context_stack.len() <= 1 {
                        return Err(GraphError::ContextStackEmpty {
                            stage: stage.name.clone(),
                        });
                    }
                    context_stack.pop();
                }
                Verb::Copy => {
                    let (context, instruction) = match inst.flag("from") {
                        Some(from) => {
                            let dep = if let Some(&id) = self.stage_refs.get(from) {
                                id
                            } else if self.options.context_names.contains(from) {
                                self.context_node(from)
                            } else {
                                self.resolve_image_ref(from, &stage.name)?
                            };
                            (dep, inst.without_flag("from"))
                        }
                        None => {
                            let name = context_stack.last().expect("stack is never empty");
                            (self.context_node(&name.clone()), inst.clone())
                        }
                    };
                    cursor = self.push(ImageNode::Step {
                        parent: cursor,
                        instruction,
                        context: Some(context),
                    });
                }
                Verb::Add => {
                    let name = context_stack.last().expect("stack is never empty");
                    let context = self.context_node(&name.clone());
                    cursor = self.push(ImageNode::Step {
                        parent: cursor,
                        instruction: inst.clone(),
                        context: Some(context),
                    });
                }
                _ => {
                    cursor = self.push(ImageNode::Step {
                        parent: cursor,
                        instruction: inst.clone(),
                        context: None,
                    });
                }
            }
        }

        if base {
            let id = self.push(ImageNode::Base {
                parent: cursor,
                stage_name: stage.name.clone(),
                platform: self.options.platform.clone(),
                profile: self.options.profile.clone(),
                content_hash: None,
                resolved_digest: None,
            });
            self.stage_refs.insert(stage.name.clone(), id);
            self.targets.push(id);
        } else if anon {
            self.stage_refs.insert(stage.name.clone(), cursor);
            self.anon_terminals.insert(cursor, stage.name.clone());
        } else {
            let id = self.push(ImageNode::Stage {
                parent: cursor,
                stage_name: stage.name.clone(),
                platform: self.options.platform.clone(),
                profile: self.options.profile.clone(),
                publish_tags: overrides.map(|o| o.publish_tags.clone()).unwrap_or_default(),
                push_tags: overrides.map(|o| o.push_tags.clone()).unwrap_or_default(),
            });
            self.stage_refs.insert(stage.name.clone(), cursor);
            self.targets.push(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::parse;

    fn lower(text: &str) -> BuildGraph {
        try_lower(text).unwrap()
    }

    fn try_lower(text: &str) -> Result<BuildGraph, GraphError> {
        let parsed = parse(text).unwrap();
        BuildGraph::from_dockerfile(&parsed, &GraphOptions::new("linux/amd64", "default"))
    }

    #[test]
    fn test_image_ref_parse() {
        assert_eq!(
            ImageRef::parse("python:3.10"),
            ImageRef {
                repo: "python".into(),
                tag: "3.10".into(),
                digest: None
            }
        );
        assert_eq!(ImageRef::parse("alpine").tag, "latest");
        assert_eq!(
            ImageRef::parse("registry.example:5000/team/app"),
            ImageRef {
                repo: "registry.example:5000/team/app".into(),
                tag: "latest".into(),
                digest: None
            }
        );
        let pinned = ImageRef::parse("python@sha256:abcd");
        assert_eq!(pinned.digest.as_deref(), Some("sha256:abcd"));
    }

    #[test]
    fn test_linear_stage() {
        let graph = lower(
            "FROM alpine:3.19 AS app\n\
             RUN apk add nginx\n\
             CMD [\"nginx\"]\n",
        );
        // Source, two steps, one Stage wrapper.
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.targets().len(), 1);

        let target = graph.targets()[0];
        let ImageNode::Stage {
            parent, stage_name, ..
        } = graph.node(target)
        else {
            panic!("expected stage wrapper");
        };
        assert_eq!(stage_name, "app");

        // Parent chain walks back to the source.
        let ImageNode::Step { parent, .. } = graph.node(*parent) else {
            panic!("expected step");
        };
        let ImageNode::Step { parent, .. } = graph.node(*parent) else {
            panic!("expected step");
        };
        assert!(matches!(graph.node(*parent), ImageNode::Source { repo, .. } if repo == "alpine"));
    }

    #[test]
    fn test_stage_reference_and_copy_from() {
        let graph = lower(
            "FROM golang:1.21 AS builder\n\
             RUN go build -o app ./cmd\n\
             FROM alpine:3.19 AS app\n\
             COPY --from=builder /app /usr/bin/app\n",
        );
        let copy = graph
            .iter()
            .find_map(|(_, node)| match node {
                ImageNode::Step {
                    instruction,
                    context,
                    ..
                } if instruction.verb == Verb::Copy => Some((instruction.clone(), context.unwrap())),
                _ => None,
            })
            .unwrap();
        // The --from flag is lifted into a graph edge.
        assert_eq!(copy.0.flag("from"), None);
        assert!(matches!(graph.node(copy.1), ImageNode::Step { .. }));
    }

    #[test]
    fn test_copy_from_external_image() {
        let graph = lower(
            "FROM alpine AS app\n\
             COPY --from=busybox:stable /bin/busybox /bin/\n",
        );
        assert!(graph
            .iter()
            .any(|(_, n)| matches!(n, ImageNode::Source { repo, .. } if repo == "busybox")));
    }

    #[test]
    fn test_base_stage_wrapped_and_referenced() {
        let graph = lower(
            "FROM python:3.10 AS base-deps\n\
             RUN pip install -r requirements.txt\n\
             FROM base-deps AS app\n\
             CMD [\"python\", \"app.py\"]\n",
        );
        let base_id = graph
            .iter()
            .find_map(|(id, n)| matches!(n, ImageNode::Base { .. }).then_some(id))
            .unwrap();
        // The dependent stage's chain starts at the Base wrapper, so a
        // satisfied base can substitute its registry reference.
        let cmd_step = graph
            .iter()
            .find_map(|(_, n)| match n {
                ImageNode::Step {
                    parent,
                    instruction,
                    ..
                } if instruction.verb == Verb::Cmd => Some(*parent),
                _ => None,
            })
            .unwrap();
        assert_eq!(cmd_step, base_id);
    }

    #[test]
    fn test_anon_stage_not_published() {
        let graph = lower(
            "FROM alpine AS anon-tmp\n\
             RUN touch /scratch\n\
             FROM alpine AS app\n\
             COPY --from=anon-tmp /scratch /scratch\n",
        );
        // Only the publishable stage is a target.
        assert_eq!(graph.targets().len(), 1);
        // The anon terminal is still reachable through the COPY edge.
        let reachable = graph.reachable(graph.targets());
        let anon_terminal = graph
            .iter()
            .find_map(|(id, n)| match n {
                ImageNode::Step { instruction, .. } if instruction.verb == Verb::Run => Some(id),
                _ => None,
            })
            .unwrap();
        assert!(reachable[anon_terminal]);
    }

    #[test]
    fn test_unreachable_anon_stage_pruned() {
        let graph = lower(
            "FROM alpine AS anon-dead\n\
             RUN touch /unused\n\
             FROM alpine AS app\n\
             CMD [\"true\"]\n",
        );
        let reachable = graph.reachable(graph.targets());
        let dead = graph
            .iter()
            .find_map(|(id, n)| match n {
                ImageNode::Step { instruction, .. } if instruction.verb == Verb::Run => Some(id),
                _ => None,
            })
            .unwrap();
        assert!(!reachable[dead]);
    }

    #[test]
    fn test_base_depending_on_anon_fails() {
        let err = try_lower(
            "FROM alpine AS anon-tmp\n\
             RUN touch /scratch\n\
             FROM anon-tmp AS base-bad\n\
             RUN true\n",
        )
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::AnonDependency {
                stage: "base-bad".into(),
                anon_stage: "anon-tmp".into()
            }
        );
    }

    #[test]
    fn test_pushcontext_rebinds_later_copies_only() {
        let parsed = parse(
            "FROM alpine AS app\n\
             COPY a /a\n\
             PUSHCONTEXT assets\n\
             COPY b /b\n\
             POPCONTEXT\n\
             COPY c /c\n",
        )
        .unwrap();
        let mut options = GraphOptions::new("linux/amd64", "default");
        options.context_names.insert("assets".to_string());
        let graph = BuildGraph::from_dockerfile(&parsed, &options).unwrap();

        let contexts: Vec<String> = graph
            .iter()
            .filter_map(|(_, n)| match n {
                ImageNode::Step {
                    context: Some(ctx), ..
                } => match graph.node(*ctx) {
                    ImageNode::Context { name } => Some(name.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(contexts, vec!["default", "assets", "default"]);
    }

    #[test]
    fn test_forward_stage_reference_fails() {
        // Stages may only reference earlier stages; a FROM that names a
        // later stage is a graph error, not a registry lookup.
        let err = try_lower(
            "FROM builder AS app\n\
             CMD [\"app\"]\n\
             FROM golang:1.21 AS builder\n\
             RUN go build -o app ./cmd\n",
        )
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::UndefinedStage {
                stage: "app".into(),
                name: "builder".into()
            }
        );
    }

    #[test]
    fn test_copy_from_forward_stage_fails() {
        let err = try_lower(
            "FROM alpine:3.19 AS app\n\
             COPY --from=builder /app /usr/bin/app\n\
             FROM golang:1.21 AS builder\n\
             RUN go build -o app ./cmd\n",
        )
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::UndefinedStage {
                stage: "app".into(),
                name: "builder".into()
            }
        );
    }

    #[test]
    fn test_stage_prefixed_typo_fails() {
        // "anon-" / "base-" names can only be stages, never images, so
        // a typo'd reference fails here instead of 404ing later.
        let err = try_lower(
            "FROM alpine:3.19 AS anon-tmp\n\
             RUN touch /scratch\n\
             FROM alpine:3.19 AS app\n\
             COPY --from=anon-tpm /scratch /scratch\n",
        )
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::UndefinedStage {
                stage: "app".into(),
                name: "anon-tpm".into()
            }
        );

        let err = try_lower("FROM base-deps AS app\nRUN true\n").unwrap_err();
        assert_eq!(
            err,
            GraphError::UndefinedStage {
                stage: "app".into(),
                name: "base-deps".into()
            }
        );

        // A registry, tag, or digest separator marks a real image
        // reference even under a stage-like prefix.
        let graph = lower("FROM base-images/tool:1.0 AS app\nRUN true\n");
        assert!(graph
            .iter()
            .any(|(_, n)| matches!(n, ImageNode::Source { repo, .. } if repo == "base-images/tool")));
    }

    #[test]
    fn test_pushcontext_unknown_context_fails() {
        let err = try_lower("FROM alpine AS app\nPUSHCONTEXT nope\n").unwrap_err();
        assert_eq!(
            err,
            GraphError::UndefinedContext {
                stage: "app".into(),
                name: "nope".into()
            }
        );
    }

    #[test]
    fn test_explicit_base_flag_overrides_prefix() {
        let parsed = parse("FROM alpine AS deps\nRUN true\n").unwrap();
        let mut options = GraphOptions::new("linux/amd64", "default");
        options.stage_overrides.insert(
            "deps".into(),
            StageOverride {
                base: Some(true),
                ..Default::default()
            },
        );
        let graph = BuildGraph::from_dockerfile(&parsed, &options).unwrap();
        assert!(matches!(
            graph.node(graph.targets()[0]),
            ImageNode::Base { .. }
        ));

        // And the reverse: a base- prefix cleared by config.
        let parsed = parse("FROM alpine AS base-deps\nRUN true\n").unwrap();
        let mut options = GraphOptions::new("linux/amd64", "default");
        options.stage_overrides.insert(
            "base-deps".into(),
            StageOverride {
                base: Some(false),
                ..Default::default()
            },
        );
        let graph = BuildGraph::from_dockerfile(&parsed, &options).unwrap();
        assert!(matches!(
            graph.node(graph.targets()[0]),
            ImageNode::Stage { .. }
        ));
    }

    #[test]
    fn test_source_images_deduplicated() {
        let graph = lower(
            "FROM python:3.10 AS a\n\
             RUN true\n\
             FROM python:3.10 AS b\n\
             RUN false\n",
        );
        assert_eq!(graph.source_images().len(), 1);
    }
}
