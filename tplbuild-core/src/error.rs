//! Error types for tplbuild.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. `TplError` is the single error type surfaced by the core library;
//! the CLI maps it onto process exit codes.

use std::path::PathBuf;
use thiserror::Error;

use crate::dockerfile::ParseError;
use crate::graph::GraphError;

/// Result type alias for tplbuild operations.
pub type Result<T> = std::result::Result<T, TplError>;

/// Main error type for tplbuild.
#[derive(Error, Debug)]
pub enum TplError {
    /// Malformed configuration, unknown profile, or missing settings
    /// required by the project (e.g. `base_image_repo` with base stages).
    #[error("config error: {reason}")]
    Config { reason: String },

    /// Dockerfile syntax error from the parser.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Unresolved FROM, undefined stage reference, or cycle.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Missing context directory, unreadable file, or malformed ignore
    /// pattern.
    #[error("context error: {reason}")]
    Context { reason: String },

    /// Registry operation failed. `transient` errors have already been
    /// retried inside the registry client before surfacing here.
    #[error("registry error: {reason}")]
    Registry {
        reason: String,
        status: Option<u16>,
        transient: bool,
    },

    /// The builder subprocess exited non-zero. Carries the tail of its
    /// stderr for the terminal report.
    #[error("build failed: {reason}")]
    Build {
        reason: String,
        stderr_tail: Vec<String>,
    },

    /// Corrupted or unreadable state file.
    #[error("state error: {reason}")]
    State { reason: String },

    /// The build was cancelled by an external signal.
    #[error("cancelled")]
    Cancelled,

    #[error("template error: {reason}")]
    Template { reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TplError {
    /// Shortcut for a config error with a formatted reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Shortcut for a context error with a formatted reason.
    pub fn context(reason: impl Into<String>) -> Self {
        Self::Context {
            reason: reason.into(),
        }
    }

    /// Shortcut for a non-transient registry error.
    pub fn registry(reason: impl Into<String>) -> Self {
        Self::Registry {
            reason: reason.into(),
            status: None,
            transient: false,
        }
    }

    /// Attach a path to an `std::io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// One-word error kind used in terminal reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Parse(_) => "parse",
            Self::Graph(_) => "graph",
            Self::Context { .. } => "context",
            Self::Registry { .. } => "registry",
            Self::Build { .. } => "build",
            Self::State { .. } => "state",
            Self::Cancelled => "cancelled",
            Self::Template { .. } => "template",
            Self::Io { .. } => "io",
        }
    }

    /// Process exit code for this error: 1 for user errors, 2 for build
    /// failures, 3 for registry errors, 130 for cancellation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Build { .. } => 2,
            Self::Registry { .. } => 3,
            Self::Cancelled => 130,
            _ => 1,
        }
    }
}
