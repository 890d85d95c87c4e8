//! Symbolic content hashing of the build graph.
//!
//! Every node gets a stable SHA-256 hash derived only from its build
//! inputs: the parent's hash, the canonicalised instruction text, the
//! context files hash for instructions that consume files, the project
//! salt, and the platform string. Equal inputs hash identically across
//! hosts; rotating the salt invalidates every base-image hash.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::context::BuildContext;
use crate::error::{Result, TplError};
use crate::graph::{BuildGraph, GraphError, ImageNode};
use crate::hashing::json_hash;

/// Hash every node of `graph`, storing each base image's content hash on
/// its node. Returns the per-node hashes indexed by `NodeId`.
///
/// Source images must carry a resolved digest (scratch excepted); context
/// file trees are read and hashed once per context.
pub fn hash_graph(
    graph: &mut BuildGraph,
    contexts: &BTreeMap<String, BuildContext>,
    salt: &str,
) -> Result<Vec<String>> {
    let mut hashes: Vec<String> = Vec::with_capacity(graph.len());
    let mut files_hashes: HashMap<String, String> = HashMap::new();

    for id in 0..graph.len() {
        let hash = match graph.node(id) {
            ImageNode::Source {
                repo,
                tag,
                platform,
                digest,
            } => {
                if repo == "scratch" {
                    json_hash(&("source", "scratch"))
                } else {
                    let digest = digest.as_deref().ok_or_else(|| {
                        TplError::Graph(GraphError::UnresolvedSource {
                            repo: repo.clone(),
                            tag: tag.clone(),
                        })
                    })?;
                    json_hash(&("source", repo, tag, platform, digest))
                }
            }
            ImageNode::Context { name } => {
                let files_hash = match files_hashes.get(name) {
                    Some(hash) => hash.clone(),
                    None => {
                        let context = contexts.get(name).ok_or_else(|| {
                            TplError::context(format!("no configured context named {name:?}"))
                        })?;
                        let hash = context.files_hash()?;
                        files_hashes.insert(name.clone(), hash.clone());
                        hash
                    }
                };
                json_hash(&("ctx", name, files_hash))
            }
            ImageNode::Step {
                parent,
                instruction,
                context,
            } => {
                let extra: Vec<&str> = context.iter().map(|dep| hashes[*dep].as_str()).collect();
                json_hash(&(
                    "step",
                    hashes[*parent].as_str(),
                    instruction.canonical(),
                    extra,
                    graph.platform.as_str(),
                    salt,
                ))
            }
            ImageNode::Base {
                parent,
                profile,
                platform,
                ..
            } => json_hash(&("base", hashes[*parent].as_str(), profile, platform, salt)),
            // Stage images are published, not cached; the hash only keeps
            // plan ordering deterministic.
            ImageNode::Stage {
                parent, stage_name, ..
            } => json_hash(&("stage", hashes[*parent].as_str(), stage_name)),
        };
        hashes.push(hash);
    }

    for id in 0..graph.len() {
        if let ImageNode::Base { content_hash, .. } = graph.node_mut(id) {
            *content_hash = Some(hashes[id].clone());
        }
    }

    Ok(hashes)
}
