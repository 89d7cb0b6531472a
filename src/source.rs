//! Retrieval boundary: where fragment bodies come from.
//!
//! A fragment name resolves to a location by a fixed convention
//! (`templates/<name>.html`) unless the name is already a location.  Sources
//! resolve that location against their own root: a directory on disk or an
//! HTTP base URL.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Url;

use crate::error::LoadFailure;
use crate::paths;

/// Directory fragments live under, relative to the source root.
pub const TEMPLATE_DIR: &str = "templates";

/// Resolve a fragment name to its retrieval location.
///
/// Bare names follow the `templates/<name>.html` convention.  Names that
/// contain a `/`, end in `.html`, or are absolute URLs are used as-is.
pub fn resolve_location(name: &str) -> String {
    if name.contains('/') || name.ends_with(".html") {
        name.to_owned()
    } else {
        format!("{TEMPLATE_DIR}/{name}.html")
    }
}

fn is_absolute_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// A place fragment bodies can be fetched from.
#[async_trait]
pub trait FragmentSource: Send + Sync {
    /// Fetch the body stored at `location` (as produced by
    /// [`resolve_location`]).
    async fn fetch(&self, location: &str) -> Result<String, LoadFailure>;

    /// Human-readable description of the source root, for logs.
    fn describe(&self) -> String;
}

/// Reads fragments from a local directory.
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_failure(err: io::Error) -> LoadFailure {
    match err.kind() {
        io::ErrorKind::NotFound => LoadFailure::NotFound,
        _ => LoadFailure::Io(err.to_string()),
    }
}

#[async_trait]
impl FragmentSource for DirSource {
    async fn fetch(&self, location: &str) -> Result<String, LoadFailure> {
        if is_absolute_url(location) {
            return Err(LoadFailure::Unsupported);
        }
        let relative = paths::normalize_path(location).ok_or(LoadFailure::OutsideRoot)?;
        let candidate = self.root.join(&relative);

        // Canonicalise both sides so symlinks cannot lead outside the root.
        let canonical_root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(io_failure)?;
        let canonical = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(io_failure)?;
        if !canonical.starts_with(&canonical_root) {
            debug!(
                "[source] location={location} denied reason=outside-root canonical={}",
                canonical.display()
            );
            return Err(LoadFailure::OutsideRoot);
        }

        let bytes = tokio::fs::read(&canonical).await.map_err(io_failure)?;
        String::from_utf8(bytes).map_err(|_| LoadFailure::InvalidUtf8)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Fetches fragments with HTTP GET relative to a base URL.
pub struct HttpSource {
    base: Url,
    client: reqwest::Client,
}

impl HttpSource {
    /// Build a source rooted at `base`.  A trailing `/` is added to the base
    /// path when missing so relative locations resolve beneath it.
    pub fn new(mut base: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base, client })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url_for(&self, location: &str) -> Result<Url, LoadFailure> {
        let parsed = if is_absolute_url(location) {
            Url::parse(location)
        } else {
            self.base.join(location.trim_start_matches('/'))
        };
        parsed.map_err(|e| LoadFailure::Transport(format!("invalid URL: {e}")))
    }
}

#[async_trait]
impl FragmentSource for HttpSource {
    async fn fetch(&self, location: &str) -> Result<String, LoadFailure> {
        let url = self.url_for(location)?;
        debug!("[source] GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LoadFailure::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoadFailure::Status(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| LoadFailure::Transport(e.to_string()))
    }

    fn describe(&self) -> String {
        self.base.to_string()
    }
}
