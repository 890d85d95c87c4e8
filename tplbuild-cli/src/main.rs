use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tplbuild_core::registry::{CredentialStore, RegistryClient};
use tplbuild_core::{CommandClient, Project, TplError, UserConfig};

mod commands;

#[derive(Parser)]
#[command(name = "tplbuild")]
#[command(about = "Templated, reproducible container image build tool", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Project base directory
    #[arg(short = 'C', long, default_value = ".", global = true)]
    base_dir: PathBuf,

    /// Keep intermediate tplbuild-* tags after the run
    #[arg(long, global = true)]
    keep_tags: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build stage images for one platform
    Build {
        /// Profile to render with
        #[arg(long)]
        profile: Option<String>,

        /// Platform to build for (defaults to the first project platform)
        #[arg(long)]
        platform: Option<String>,

        /// Re-resolve source image digests before building
        #[arg(long)]
        update_sources: bool,

        /// Stages to build (defaults to all)
        stages: Vec<String>,
    },

    /// Build and push stage images for every platform, then publish
    /// multi-arch indexes
    Publish {
        #[arg(long)]
        profile: Option<String>,

        /// Platforms to publish, may be given multiple times
        #[arg(long)]
        platform: Vec<String>,

        /// Stages to publish (defaults to all)
        stages: Vec<String>,
    },

    /// Build and push any base images missing from the base image repo
    BaseBuild {
        #[arg(long)]
        profile: Option<String>,

        #[arg(long)]
        platform: Vec<String>,

        /// Only report whether base images would need a build; mutates
        /// nothing and exits non-zero when out of date
        #[arg(long)]
        check: bool,

        /// Rotate the hash salt first, forcing every base image to
        /// rebuild
        #[arg(long)]
        update_salt: bool,

        /// Re-resolve source image digests first
        #[arg(long)]
        update_sources: bool,

        /// Base stages to build (defaults to all)
        stages: Vec<String>,
    },

    /// Show base image content hashes and their cached digests
    BaseLookup {
        #[arg(long)]
        profile: Option<String>,

        #[arg(long)]
        platform: Vec<String>,

        stages: Vec<String>,
    },

    /// Refresh locked source image digests from their registries
    SourceUpdate {
        #[arg(long)]
        profile: Option<String>,

        #[arg(long)]
        platform: Vec<String>,

        /// Only report pending updates; exits non-zero when stale
        #[arg(long)]
        check: bool,

        /// Drop all existing source locks first
        #[arg(long)]
        clear: bool,

        /// Source images to update in repo:tag form (defaults to all)
        sources: Vec<String>,
    },

    /// Show locked source image digests
    SourceLookup {
        /// Source images in repo:tag form (defaults to all)
        sources: Vec<String>,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "tplbuild_core=info,tplbuild_cli=info,warn",
        2 => "tplbuild_core=debug,tplbuild_cli=debug,info",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn report_error(err: &TplError) {
    eprintln!("{} error: {err}", err.kind());
    if let TplError::Build { stderr_tail, .. } = err {
        if !stderr_tail.is_empty() {
            eprintln!("--- builder stderr (last {} lines) ---", stderr_tail.len());
            for line in stderr_tail {
                eprintln!("{line}");
            }
        }
    }
}

async fn run(cli: Cli) -> Result<i32, TplError> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let user = UserConfig::load()?;
    let project = Project::load(&cli.base_dir, user)?;

    let credentials = match project.user.auth_file() {
        Some(path) => CredentialStore::load(&path)?,
        None => CredentialStore::default(),
    };
    let registry = Arc::new(RegistryClient::new(
        &project.user.registry.ssl_context,
        credentials,
        cancel.clone(),
    )?);
    let client = Arc::new(CommandClient::new(
        project.user.client_commands()?,
        cancel.clone(),
    ));

    let ctx = commands::CommandContext {
        project,
        registry,
        client,
        cancel,
        keep_tags: cli.keep_tags,
    };

    match cli.command {
        Commands::Build {
            profile,
            platform,
            update_sources,
            stages,
        } => commands::build::run(&ctx, profile.as_deref(), platform, update_sources, &stages).await,
        Commands::Publish {
            profile,
            platform,
            stages,
        } => commands::publish::run(&ctx, profile.as_deref(), &platform, &stages).await,
        Commands::BaseBuild {
            profile,
            platform,
            check,
            update_salt,
            update_sources,
            stages,
        } => {
            commands::base::build(
                &ctx,
                profile.as_deref(),
                &platform,
                check,
                update_salt,
                update_sources,
                &stages,
            )
            .await
        }
        Commands::BaseLookup {
            profile,
            platform,
            stages,
        } => commands::base::lookup(&ctx, profile.as_deref(), &platform, &stages).await,
        Commands::SourceUpdate {
            profile,
            platform,
            check,
            clear,
            sources,
        } => {
            commands::source::update(&ctx, profile.as_deref(), &platform, check, clear, &sources)
                .await
        }
        Commands::SourceLookup { sources } => commands::source::lookup(&ctx, &sources),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };
    std::process::exit(code);
}
