//! Static site build: compose every page under a root into an output tree.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::composer::FragmentComposer;
use crate::config::CONFIG_FILE_NAME;
use crate::document::HtmlDocument;
use crate::error::SiteError;
use crate::includes::PageIncludes;
use crate::paths;

/// Directory names never descended into.
const SKIP_DIRS: &[&str] = &[".git", ".jj", "node_modules"];

/// Totals for one build, printed as the final summary line.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub pages: usize,
    pub copied: usize,
    pub fragment_errors: usize,
    /// Root-relative paths of pages that had at least one fragment omitted.
    pub degraded_pages: Vec<String>,
}

/// Compose every `.html` page under `root` into `out`, copying all other
/// files verbatim.
///
/// One `composer` is shared by every page, so each fragment is retrieved at
/// most once per build.  Fragment failures degrade the affected page but do
/// not stop the build; file system errors do.
pub async fn build_site(
    root: &Path,
    out: &Path,
    clean: bool,
    composer: &FragmentComposer,
    includes: &PageIncludes,
) -> Result<BuildSummary, SiteError> {
    let canonical_root = tokio::fs::canonicalize(root)
        .await
        .map_err(|e| SiteError::io(root, e))?;
    if !canonical_root.is_dir() {
        return Err(SiteError::NotADirectory(root.to_path_buf()));
    }

    if clean && tokio::fs::try_exists(out).await.unwrap_or(false) {
        let canonical_out = tokio::fs::canonicalize(out)
            .await
            .map_err(|e| SiteError::io(out, e))?;
        if canonical_root.starts_with(&canonical_out) {
            return Err(SiteError::OutputContainsRoot(out.to_path_buf()));
        }
        info!("[build] cleaning {}", out.display());
        tokio::fs::remove_dir_all(out)
            .await
            .map_err(|e| SiteError::io(out, e))?;
    }
    tokio::fs::create_dir_all(out)
        .await
        .map_err(|e| SiteError::io(out, e))?;
    let canonical_out = tokio::fs::canonicalize(out)
        .await
        .map_err(|e| SiteError::io(out, e))?;
    if canonical_root.starts_with(&canonical_out) {
        return Err(SiteError::OutputContainsRoot(out.to_path_buf()));
    }

    let mut summary = BuildSummary::default();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(canonical_root.clone());

    while let Some(dir) = queue.pop_front() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| SiteError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SiteError::io(&dir, e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| SiteError::io(&path, e))?;

            if file_type.is_dir() {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if SKIP_DIRS.contains(&name) || path == canonical_out {
                    debug!("[build] skipping dir={}", path.display());
                    continue;
                }
                queue.push_back(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let Ok(rel) = path.strip_prefix(&canonical_root) else {
                continue;
            };
            if rel == Path::new(CONFIG_FILE_NAME) {
                continue;
            }
            let dest = canonical_out.join(rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SiteError::io(parent, e))?;
            }

            let is_page = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(paths::is_page_ext);
            if is_page && !rel.starts_with(crate::source::TEMPLATE_DIR) {
                let rel_display = rel.display().to_string();
                if let Some(errors) = build_page(&path, &dest, rel, composer, includes).await? {
                    summary.pages += 1;
                    if errors > 0 {
                        summary.fragment_errors += errors;
                        summary.degraded_pages.push(rel_display);
                    }
                    continue;
                }
            }

            tokio::fs::copy(&path, &dest)
                .await
                .map_err(|e| SiteError::io(&path, e))?;
            summary.copied += 1;
        }
    }

    summary.degraded_pages.sort();
    info!(
        "[build] pages={} copied={} fragment_errors={}",
        summary.pages, summary.copied, summary.fragment_errors
    );
    Ok(summary)
}

/// Compose one page.  Returns the number of omitted fragments, or `None`
/// when the page is not valid UTF-8 and should be copied as-is.
async fn build_page(
    src: &Path,
    dest: &Path,
    rel: &Path,
    composer: &FragmentComposer,
    includes: &PageIncludes,
) -> Result<Option<usize>, SiteError> {
    let page = rel.display();
    let bytes = tokio::fs::read(src)
        .await
        .map_err(|e| SiteError::io(src, e))?;
    let Ok(html) = String::from_utf8(bytes) else {
        warn!("[build] page={page} not UTF-8; copying verbatim");
        return Ok(None);
    };

    let mut doc = HtmlDocument::new(html);
    let report = includes.apply_at(composer, &mut doc, rel).await;
    debug!(
        "[build] page={page} composed={} skipped={} failed={}",
        report.composed.len(),
        report.skipped.len(),
        report.failed.len()
    );
    tokio::fs::write(dest, doc.into_string())
        .await
        .map_err(|e| SiteError::io(dest, e))?;
    Ok(Some(report.failed.len()))
}
