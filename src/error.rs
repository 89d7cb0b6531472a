//! Error types shared by the composer, its retrieval sources and the CLI.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why a single fragment retrieval failed.
///
/// Kept `Clone` (I/O and transport errors are flattened to strings) because
/// one failure is delivered to every caller joined on the same load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadFailure {
    #[error("fragment name is empty")]
    EmptyName,

    #[error("location escapes the template root")]
    OutsideRoot,

    #[error("not found")]
    NotFound,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("body is not valid UTF-8")]
    InvalidUtf8,

    #[error("location is not supported by this source")]
    Unsupported,
}

/// A fragment could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to load fragment '{name}' from {location}: {failure}")]
pub struct LoadError {
    /// Fragment name as requested by the caller.
    pub name: String,
    /// Resolved retrieval location (relative path or URL).
    pub location: String,
    pub failure: LoadFailure,
}

/// Outcome of a failed `compose` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("target '{target}' not found in document")]
    TargetMissing { target: String },
}

impl ComposeError {
    pub fn is_target_missing(&self) -> bool {
        matches!(self, ComposeError::TargetMissing { .. })
    }
}

/// Errors raised while loading `fragkit.yml` or resolving the template source.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },

    #[error("invalid template source '{0}'")]
    InvalidTemplates(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Errors that abort a static site build.
#[derive(Debug, Error)]
pub enum SiteError {
    #[error("site root {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("output directory {0} contains the site root")]
    OutputContainsRoot(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SiteError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SiteError::Io {
            path: path.into(),
            source,
        }
    }
}
