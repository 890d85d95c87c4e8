//! CLI subcommand implementations.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tplbuild_core::registry::RegistryClient;
use tplbuild_core::{CommandClient, Executor, Project};

pub mod base;
pub mod build;
pub mod publish;
pub mod source;

/// Everything a subcommand needs to do its work.
pub struct CommandContext {
    pub project: Project,
    pub registry: Arc<RegistryClient>,
    pub client: Arc<CommandClient>,
    pub cancel: CancellationToken,
    pub keep_tags: bool,
}

impl CommandContext {
    /// A fresh executor wired to this invocation's cancel token and
    /// debug flags.
    pub fn executor(&self) -> Executor {
        Executor::new(self.client.clone(), self.project.user.effective_parallelism())
            .with_cancel(self.cancel.clone())
            .keep_transient_tags(self.keep_tags)
    }
}
