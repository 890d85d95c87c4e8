//! Plan execution.
//!
//! Runs plan entries against a pluggable builder client with bounded
//! parallelism. Readiness is pure dataflow: an entry starts once every
//! entry producing a tag it depends on has completed; there is no FIFO
//! guarantee among ready entries. On the first failure the executor
//! drains: nothing new is dispatched, in-flight work runs to completion,
//! intermediate `tplbuild-*` tags are removed, and the first error (by
//! plan order) is surfaced.
//!
//! Source-image locking and base-image probing also live here: both run
//! before execution and persist partial progress so re-runs make forward
//! progress.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientCommand, ClientCommands};
use crate::context::BuildContext;
use crate::error::{Result, TplError};
use crate::graph::{BuildGraph, ImageNode};
use crate::plan::{base_image_tag, BuildPlan, PlanEntry, PlanEntryKind};
use crate::registry::Registry;
use crate::state::StateStore;

/// Bound on concurrent tag operations.
const TAG_JOBS: usize = 8;
/// Bound on concurrent push operations.
const PUSH_JOBS: usize = 4;
/// Grace period between SIGTERM and SIGKILL on cancellation.
const KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(10);
/// Builder stderr lines kept for failure reports.
const STDERR_TAIL: usize = 50;

/// The pluggable boundary to the underlying image builder. Every
/// operation maps onto one opaque subprocess invocation for the command
/// client; tests substitute an in-memory recorder.
#[async_trait]
pub trait BuilderClient: Send + Sync {
    /// Build `dockerfile` with `context` streamed on stdin, tagging the
    /// result `tag`.
    async fn build(
        &self,
        dockerfile: &str,
        context: Option<&BuildContext>,
        tag: &str,
        platform: &str,
    ) -> Result<()>;

    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    async fn push(&self, image: &str) -> Result<()>;

    async fn pull(&self, image: &str) -> Result<()>;

    async fn untag(&self, image: &str) -> Result<()>;

    /// The builder's default `os/arch` platform.
    async fn platform(&self) -> Result<String>;
}

/// Builder client that shells out to the configured command templates.
pub struct CommandClient {
    commands: ClientCommands,
    cancel: CancellationToken,
}

impl CommandClient {
    pub fn new(commands: ClientCommands, cancel: CancellationToken) -> Self {
        Self { commands, cancel }
    }

    /// Run one client command: expand the argv template, stream output
    /// line-by-line (prefixed with the image tag being produced), and
    /// keep a stderr tail for failure reports.
    async fn run(
        &self,
        command: &ClientCommand,
        params: &BTreeMap<&str, &str>,
        stdin_data: Option<Vec<u8>>,
        capture_stdout: bool,
    ) -> Result<String> {
        let prefix = params.get("image").map(|image| format!("{image} | "));
        let argv = command.expand(params);
        if argv.is_empty() {
            return Err(TplError::config("client command expanded to an empty argv"));
        }
        debug!(command = ?argv, "running client command");

        let mut proc = tokio::process::Command::new(&argv[0]);
        proc.args(&argv[1..])
            .envs(&command.env)
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = proc.spawn().map_err(|err| TplError::Build {
            reason: format!("failed to spawn {:?}: {err}", argv[0]),
            stderr_tail: Vec::new(),
        })?;

        let mut stdin_task = None;
        if let Some(data) = stdin_data {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin_task = Some(tokio::spawn(async move {
                // The client may exit before consuming the whole context;
                // a broken pipe here is reported via the exit status.
                if let Err(err) = stdin.write_all(&data).await {
                    warn!("client closed stdin early: {err}");
                }
                drop(stdin);
            }));
        }

        let stdout = child.stdout.take().expect("stdout was piped");
        let stdout_prefix = prefix.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut captured = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if capture_stdout {
                    captured.push_str(&line);
                    captured.push('\n');
                } else {
                    eprintln!("{}{line}", stdout_prefix.as_deref().unwrap_or(""));
                }
            }
            captured
        });

        let stderr = child.stderr.take().expect("stderr was piped");
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                eprintln!("{}{line}", prefix.as_deref().unwrap_or(""));
                if tail.len() == STDERR_TAIL {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail
        });

        let waited = {
            let wait = child.wait();
            tokio::pin!(wait);
            tokio::select! {
                status = &mut wait => Some(status),
                _ = self.cancel.cancelled() => None,
            }
        };
        let status = match waited {
            Some(status) => status.map_err(|err| TplError::Build {
                reason: format!("waiting for {:?}: {err}", argv[0]),
                stderr_tail: Vec::new(),
            })?,
            None => {
                terminate(&mut child).await;
                return Err(TplError::Cancelled);
            }
        };

        if let Some(task) = stdin_task {
            let _ = task.await;
        }
        let captured = stdout_task.await.unwrap_or_default();
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(TplError::Build {
                reason: format!("{:?} exited with {status}", argv[0]),
                stderr_tail,
            });
        }
        Ok(captured)
    }
}

/// SIGTERM the child, then SIGKILL after the grace period.
async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("builder ignored SIGTERM, killing");
    }
    let _ = child.kill().await;
}

#[async_trait]
impl BuilderClient for CommandClient {
    async fn build(
        &self,
        dockerfile: &str,
        context: Option<&BuildContext>,
        tag: &str,
        platform: &str,
    ) -> Result<()> {
        let context = match context {
            Some(context) => context.clone(),
            None => BuildContext::empty("default"),
        };
        let dockerfile = dockerfile.as_bytes().to_vec();
        // Walking and hashing the context tree is blocking filesystem
        // work; keep it off the async workers.
        let tar = tokio::task::spawn_blocking(move || {
            let mut extra = BTreeMap::new();
            extra.insert("Dockerfile".to_string(), (0o444u32, dockerfile));
            context.tar_bytes(&extra)
        })
        .await
        .map_err(|err| TplError::Build {
            reason: format!("context writer panicked: {err}"),
            stderr_tail: Vec::new(),
        })??;

        let mut params = BTreeMap::new();
        params.insert("image", tag);
        params.insert("platform", platform);
        self.run(&self.commands.build, &params, Some(tar), false)
            .await?;
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("source_image", source);
        params.insert("target_image", target);
        self.run(&self.commands.tag, &params, None, false).await?;
        Ok(())
    }

    async fn push(&self, image: &str) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("image", image);
        self.run(&self.commands.push, &params, None, false).await?;
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        let pull = self.commands.pull.as_ref().ok_or_else(|| {
            TplError::config("client has no pull command configured")
        })?;
        let mut params = BTreeMap::new();
        params.insert("image", image);
        self.run(pull, &params, None, false).await?;
        Ok(())
    }

    async fn untag(&self, image: &str) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("image", image);
        self.run(&self.commands.untag, &params, None, false).await?;
        Ok(())
    }

    async fn platform(&self) -> Result<String> {
        let Some(platform) = &self.commands.platform else {
            return Ok(crate::arch::client_platform());
        };
        let output = self.run(platform, &BTreeMap::new(), None, true).await?;
        Ok(crate::arch::normalize_platform(output.trim()))
    }
}

/// Fill every source image's digest from the lock store, resolving
/// through the registry (and locking the result) when no lock exists or
/// `force_refresh` is set. With `persist` off nothing is written, which
/// backs the `--check` flows.
pub async fn resolve_sources(
    graph: &mut BuildGraph,
    registry: &dyn Registry,
    state: &StateStore,
    force_refresh: bool,
    persist: bool,
) -> Result<()> {
    let mut updated = false;
    for (id, repo, tag, platform) in graph.source_images() {
        if let ImageNode::Source {
            digest: Some(_), ..
        } = graph.node(id)
        {
            // Digest pinned in the Dockerfile itself.
            continue;
        }
        let locked = state.get_source(&repo, &tag, &platform);
        let digest = match (locked, force_refresh) {
            (Some(digest), false) => digest,
            (_, _) => {
                let digest = registry.resolve_digest(&repo, &tag, &platform).await?;
                info!(%repo, %tag, %platform, %digest, "locked source image");
                state.set_source(&repo, &tag, &platform, &digest);
                updated = true;
                digest
            }
        };
        if let ImageNode::Source { digest: slot, .. } = graph.node_mut(id) {
            *slot = Some(digest);
        }
    }
    if updated && persist {
        state.save()?;
    }
    Ok(())
}

/// Probe the base image repo for every base image in the graph, marking
/// found images satisfied. Returns the number of base images that still
/// need a build.
pub async fn resolve_bases(
    graph: &mut BuildGraph,
    registry: &dyn Registry,
    state: &StateStore,
    base_repo: &str,
    persist: bool,
) -> Result<usize> {
    let mut pending = 0;
    let mut updated = false;
    for id in 0..graph.len() {
        let ImageNode::Base {
            content_hash,
            platform,
            stage_name,
            ..
        } = graph.node(id)
        else {
            continue;
        };
        let content_hash = content_hash.clone().ok_or_else(|| {
            TplError::config(format!("base stage {stage_name:?} was never hashed"))
        })?;
        let platform = platform.clone();

        let digest = match state.get_base(&content_hash, &platform) {
            Some(digest) => Some(digest),
            None => {
                let tag = base_image_tag(&content_hash, &platform);
                let probed = registry.probe(base_repo, &tag, &platform).await?;
                if let Some(digest) = &probed {
                    state.set_base(&content_hash, &platform, digest);
                    updated = true;
                }
                probed
            }
        };

        match digest {
            Some(digest) => {
                debug!(stage = %stage_name_of(graph, id), %digest, "base image satisfied");
                if let ImageNode::Base {
                    resolved_digest, ..
                } = graph.node_mut(id)
                {
                    *resolved_digest = Some(digest);
                }
            }
            None => pending += 1,
        }
    }
    if updated && persist {
        state.save()?;
    }
    Ok(pending)
}

fn stage_name_of(graph: &BuildGraph, id: usize) -> String {
    match graph.node(id) {
        ImageNode::Base { stage_name, .. } | ImageNode::Stage { stage_name, .. } => {
            stage_name.clone()
        }
        _ => String::new(),
    }
}

/// Executes a build plan with bounded parallelism.
pub struct Executor {
    client: Arc<dyn BuilderClient>,
    build_jobs: Arc<Semaphore>,
    tag_jobs: Arc<Semaphore>,
    push_jobs: Arc<Semaphore>,
    cancel: CancellationToken,
    /// Debug switch: keep `tplbuild-*` tags after the run.
    keep_transient: bool,
    /// When set, freshly pushed base images get their digest recorded
    /// (and flushed) here.
    base_recording: Option<(Arc<dyn Registry>, Arc<StateStore>, String)>,
}

impl Executor {
    pub fn new(client: Arc<dyn BuilderClient>, parallelism: usize) -> Self {
        Self {
            client,
            build_jobs: Arc::new(Semaphore::new(parallelism.max(1))),
            tag_jobs: Arc::new(Semaphore::new(TAG_JOBS)),
            push_jobs: Arc::new(Semaphore::new(PUSH_JOBS)),
            cancel: CancellationToken::new(),
            keep_transient: false,
            base_recording: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Keep intermediate tags after the run (debugging aid).
    pub fn keep_transient_tags(mut self, keep: bool) -> Self {
        self.keep_transient = keep;
        self
    }

    pub fn record_bases(
        mut self,
        registry: Arc<dyn Registry>,
        state: Arc<StateStore>,
        base_repo: String,
    ) -> Self {
        self.base_recording = Some((registry, state, base_repo));
        self
    }

    /// Run the plan to completion, draining on failure and cleaning up
    /// intermediate tags on every exit path.
    pub async fn execute(
        &self,
        plan: &BuildPlan,
        contexts: &BTreeMap<String, BuildContext>,
    ) -> Result<()> {
        let contexts = Arc::new(contexts.clone());
        let draining = CancellationToken::new();
        let transient_tags: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let failures: Arc<Mutex<Vec<(usize, TplError)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut channels = Vec::with_capacity(plan.entries.len());
        for _ in &plan.entries {
            channels.push(watch::channel(false));
        }
        let receivers: Vec<watch::Receiver<bool>> =
            channels.iter().map(|(_, rx)| rx.clone()).collect();

        let mut handles = Vec::with_capacity(plan.entries.len());
        for (entry, (tx, _)) in plan.entries.iter().zip(channels.into_iter()) {
            let entry = entry.clone();
            let dep_rxs: Vec<watch::Receiver<bool>> =
                entry.deps.iter().map(|&dep| receivers[dep].clone()).collect();
            let worker = Worker {
                client: Arc::clone(&self.client),
                build_jobs: Arc::clone(&self.build_jobs),
                tag_jobs: Arc::clone(&self.tag_jobs),
                push_jobs: Arc::clone(&self.push_jobs),
                cancel: self.cancel.clone(),
                draining: draining.clone(),
                contexts: Arc::clone(&contexts),
                transient_tags: Arc::clone(&transient_tags),
                failures: Arc::clone(&failures),
                base_recording: self.base_recording.clone(),
            };
            handles.push(tokio::spawn(async move {
                worker.run_entry(entry, dep_rxs, tx).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        // Cleanup happens on every exit path unless explicitly kept.
        let tags = std::mem::take(&mut *transient_tags.lock().expect("lock poisoned"));
        let mut cleanup_error = None;
        if !self.keep_transient {
            for tag in tags {
                if let Err(err) = self.client.untag(&tag).await {
                    warn!(%tag, "failed to remove intermediate tag: {err}");
                    cleanup_error.get_or_insert(err);
                }
            }
        }

        let mut failures = std::mem::take(&mut *failures.lock().expect("lock poisoned"));
        failures.sort_by_key(|(id, _)| *id);
        if let Some((_, first)) = failures.into_iter().next() {
            return Err(first);
        }
        if self.cancel.is_cancelled() {
            return Err(TplError::Cancelled);
        }
        // Surface cleanup failures only when the build itself succeeded.
        match cleanup_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Worker {
    client: Arc<dyn BuilderClient>,
    build_jobs: Arc<Semaphore>,
    tag_jobs: Arc<Semaphore>,
    push_jobs: Arc<Semaphore>,
    cancel: CancellationToken,
    draining: CancellationToken,
    contexts: Arc<BTreeMap<String, BuildContext>>,
    transient_tags: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<Vec<(usize, TplError)>>>,
    base_recording: Option<(Arc<dyn Registry>, Arc<StateStore>, String)>,
}

impl Worker {
    async fn run_entry(
        &self,
        entry: PlanEntry,
        mut dep_rxs: Vec<watch::Receiver<bool>>,
        tx: watch::Sender<bool>,
    ) {
        // Wait for every dependency; a dropped sender means the
        // dependency failed and this entry silently joins the drain.
        for rx in &mut dep_rxs {
            loop {
                if *rx.borrow() {
                    break;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }

        // Dispatch gate: nothing new starts while draining or cancelled.
        if self.draining.is_cancelled() {
            return;
        }
        if self.cancel.is_cancelled() {
            self.draining.cancel();
            return;
        }

        match self.perform(&entry).await {
            Ok(()) => {
                if entry.transient {
                    self.transient_tags
                        .lock()
                        .expect("lock poisoned")
                        .push(entry.output_tag.clone());
                }
                let _ = tx.send(true);
            }
            Err(err) => {
                warn!(entry = entry.id, tag = %entry.output_tag, "plan entry failed: {err}");
                self.failures
                    .lock()
                    .expect("lock poisoned")
                    .push((entry.id, err));
                self.draining.cancel();
                // Dropping tx wakes dependents into the drain path.
            }
        }
    }

    async fn perform(&self, entry: &PlanEntry) -> Result<()> {
        match &entry.kind {
            PlanEntryKind::Satisfied { digest } => {
                debug!(tag = %entry.output_tag, %digest, "already cached");
                Ok(())
            }
            PlanEntryKind::Tag { source } => {
                let _permit = self.tag_jobs.acquire().await.expect("semaphore closed");
                if entry.deps.is_empty() {
                    // The source is an external reference, not a local
                    // image produced by an earlier entry.
                    self.client.pull(source).await?;
                }
                self.client.tag(source, &entry.output_tag).await?;
                self.finish_tags(entry).await
            }
            PlanEntryKind::Build => {
                let dockerfile = entry
                    .dockerfile
                    .as_deref()
                    .ok_or_else(|| TplError::config("build entry without dockerfile"))?;
                let context = match &entry.context {
                    Some(name) => Some(self.contexts.get(name).ok_or_else(|| {
                        TplError::context(format!("no configured context named {name:?}"))
                    })?),
                    None => None,
                };
                {
                    let _permit = self.build_jobs.acquire().await.expect("semaphore closed");
                    info!(tag = %entry.output_tag, platform = %entry.platform, "building");
                    self.client
                        .build(dockerfile, context, &entry.output_tag, &entry.platform)
                        .await?;
                }
                self.finish_tags(entry).await
            }
        }
    }

    /// Apply secondary tags, push what should be pushed, and record base
    /// image digests after their push lands.
    async fn finish_tags(&self, entry: &PlanEntry) -> Result<()> {
        for tag in &entry.tags {
            let _permit = self.tag_jobs.acquire().await.expect("semaphore closed");
            self.client.tag(&entry.output_tag, tag).await?;
        }
        for tag in &entry.push_tags {
            let _permit = self.push_jobs.acquire().await.expect("semaphore closed");
            self.client.push(tag).await?;
        }
        if let (Some(base), Some((registry, state, base_repo))) =
            (&entry.base, &self.base_recording)
        {
            if !entry.push_tags.is_empty() {
                let tag = base_image_tag(&base.content_hash, &base.platform);
                let digest = registry.resolve_digest(base_repo, &tag, &base.platform).await?;
                state.set_base(&base.content_hash, &base.platform, &digest);
                state.save()?;
                info!(stage = %base.stage_name, %digest, "base image published");
            }
        }
        Ok(())
    }
}
