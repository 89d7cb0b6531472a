use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    response::Response,
    Router,
};
use log::{debug, info, warn};
use tokio::signal;
use tower_http::compression::CompressionLayer;

use crate::composer::FragmentComposer;
use crate::document::HtmlDocument;
use crate::includes::PageIncludes;
use crate::paths::{is_page_ext, mime_for_ext, normalize_path, percent_decode};
use crate::source::TEMPLATE_DIR;

/// Maximum number of consecutive ports to try before giving up.
const MAX_PORT_ATTEMPTS: u16 = 100;

/// Maximum file size that will be read and served (16 MiB).
pub const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Response header carrying the number of fragments omitted from a page.
pub const FRAGMENT_ERRORS_HEADER: &str = "X-Fragment-Errors";

/// Shared application state passed to all request handlers via `Arc<AppState>`.
pub struct AppState {
    /// Base directory from which pages and assets are served.
    pub serve_root: PathBuf,
    /// Canonicalized `serve_root` used for symlink-safe containment checks.
    pub canonical_root: PathBuf,
    /// Fragment cache shared by every request for the life of the server.
    pub composer: FragmentComposer,
    pub includes: PageIncludes,
    /// Compose each request with an empty cache so template edits show up
    /// without a restart.
    pub no_cache: bool,
}

/// Attempt to bind a TCP listener on `bind_addr` starting at `start_port`.
///
/// On `EADDRINUSE` the port is incremented by one and the attempt is retried up
/// to `MAX_PORT_ATTEMPTS` times.  Any other OS error causes an immediate failure
/// without further retries.
pub fn bind_with_retry(bind_addr: &str, start_port: u16) -> Result<(TcpListener, u16), String> {
    let mut port = start_port;
    debug!("[bind] trying port={}", port);
    for _ in 0..MAX_PORT_ATTEMPTS {
        let addr = format!("{}:{}", bind_addr, port);
        match TcpListener::bind(&addr) {
            Ok(listener) => {
                let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                debug!("[bind] success port={}", bound);
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                let next = port.wrapping_add(1);
                debug!("[bind] EADDRINUSE, trying {}", next);
                port = next;
            }
            Err(e) => {
                return Err(format!("bind {}:{} failed: {}", bind_addr, port, e));
            }
        }
    }
    Err(format!(
        "exhausted {} port candidates starting at {}; all ports in use",
        MAX_PORT_ATTEMPTS, start_port,
    ))
}

/// Resolve a candidate path to an existing file.
///
/// Resolution order:
/// 1. `candidate` itself (exact file).
/// 2. If `candidate` is a directory: `candidate/index.html`.
/// 3. If `candidate` has no extension: `candidate.html` (extensionless).
///
/// Returns `(resolved_path, branch_name)` on success, `None` if not found.
async fn resolve_candidate(candidate: &Path) -> Option<(PathBuf, &'static str)> {
    match tokio::fs::metadata(candidate).await {
        Ok(meta) if meta.is_file() => {
            return Some((candidate.to_path_buf(), "exact"));
        }
        Ok(meta) if meta.is_dir() => {
            let index = candidate.join("index.html");
            if is_file(&index).await {
                return Some((index, "index"));
            }
            return None;
        }
        _ => {}
    }

    if candidate.extension().is_none() {
        let with_html = candidate.with_extension("html");
        if is_file(&with_html).await {
            return Some((with_html, "extensionless"));
        }
    }

    None
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn not_found_response() -> Response {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Content-Type-Options", "nosniff")
        .body(Body::from("Not Found"))
        .expect("not_found_response builder is infallible")
}

fn too_large_response(norm_path: &str, size: u64) -> Response {
    let body = format!(
        "Content Too Large: {} ({} bytes exceeds {} byte limit)",
        norm_path, size, MAX_FILE_SIZE
    );
    Response::builder()
        .status(StatusCode::PAYLOAD_TOO_LARGE)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header("X-Content-Type-Options", "nosniff")
        .body(Body::from(body))
        .expect("too_large_response builder is infallible")
}

/// Return `true` when the query string contains the `raw=1` parameter.
fn is_raw_mode(query: &str) -> bool {
    query.split('&').any(|param| param == "raw=1")
}

fn last_modified(modified: Option<SystemTime>) -> Option<String> {
    modified.map(httpdate::fmt_http_date)
}

// ---------------------------------------------------------------------------
// Axum request handler
// ---------------------------------------------------------------------------

/// Main request handler.
///
/// 1. Percent-decode the raw request path.
/// 2. Normalise and reject traversal above the root.
/// 3. Fallback resolution: exact, then `index.html` for directories, then
///    `.html` for extensionless paths.
/// 4. Canonicalise and re-verify containment in `canonical_root`.
/// 5. Reject files over `MAX_FILE_SIZE`.
/// 6. Pages outside `templates/` are composed with the shared fragments
///    (unless `?raw=1` or the page is not UTF-8); everything else is served
///    as a static asset.
async fn serve_handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let raw_path = req.uri().path().to_owned();
    let query = req.uri().query().unwrap_or("").to_owned();

    let decoded = match percent_decode(&raw_path) {
        Ok(d) => d,
        Err(_) => {
            debug!("[resolve] path={raw_path} branch=denied reason=invalid-percent-encoding");
            return not_found_response();
        }
    };
    if decoded.contains('\0') {
        debug!("[resolve] path={raw_path} branch=denied reason=null-byte");
        return not_found_response();
    }

    let normalized = match normalize_path(&decoded) {
        Some(n) => n,
        None => {
            debug!("[resolve] path={raw_path} branch=denied reason=path-traversal");
            return not_found_response();
        }
    };
    let norm_display = normalized.display().to_string();
    let candidate = state.serve_root.join(&normalized);

    let (resolved, branch) = match resolve_candidate(&candidate).await {
        Some(r) => r,
        None => {
            debug!("[resolve] path={norm_display} branch=denied reason=not-found");
            return not_found_response();
        }
    };

    let canonical = match tokio::fs::canonicalize(&resolved).await {
        Ok(c) => c,
        Err(_) => return not_found_response(),
    };
    if !canonical.starts_with(&state.canonical_root) {
        debug!(
            "[resolve] path={norm_display} branch=denied reason=outside-root canonical={}",
            canonical.display()
        );
        return not_found_response();
    }

    let meta = match tokio::fs::metadata(&canonical).await {
        Ok(m) => m,
        Err(_) => return not_found_response(),
    };
    let size = meta.len();
    if size > MAX_FILE_SIZE {
        debug!("[resolve] path={norm_display} branch=denied reason=too-large size={size}");
        return too_large_response(&norm_display, size);
    }
    debug!("[resolve] path={norm_display} branch={branch} size={size}");

    let ext = canonical
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    let is_template = normalized.starts_with(TEMPLATE_DIR);

    let mut undecodable = false;
    if is_page_ext(ext) && !is_template && !is_raw_mode(&query) {
        match tokio::fs::read_to_string(&canonical).await {
            Ok(html) => {
                let page = canonical
                    .strip_prefix(&state.canonical_root)
                    .unwrap_or(normalized.as_path());
                let fresh;
                let composer = if state.no_cache {
                    fresh = state.composer.uncached();
                    &fresh
                } else {
                    &state.composer
                };
                let mut doc = HtmlDocument::new(html);
                let report = state.includes.apply_at(composer, &mut doc, page).await;
                info!(
                    "[request] path={norm_display} mode=composed composed={} failed={}",
                    report.composed.len(),
                    report.failed.len()
                );
                return Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                    .header("X-Content-Type-Options", "nosniff")
                    .header(FRAGMENT_ERRORS_HEADER, report.failed.len())
                    .body(Body::from(doc.into_string()))
                    .expect("composed page response builder is infallible");
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                debug!("[request] path={norm_display} not UTF-8; serving uncomposed");
                undecodable = true;
            }
            Err(_) => return not_found_response(),
        }
    }

    let bytes = match tokio::fs::read(&canonical).await {
        Ok(b) => b,
        Err(_) => return not_found_response(),
    };
    info!("[request] path={norm_display} mode=static");
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            if undecodable { "text/html" } else { mime_for_ext(ext) },
        )
        .header("X-Content-Type-Options", "nosniff");
    if let Some(stamp) = last_modified(meta.modified().ok()) {
        builder = builder.header(header::LAST_MODIFIED, stamp);
    }
    builder
        .body(Body::from(bytes))
        .expect("static asset response builder is infallible")
}

// ---------------------------------------------------------------------------
// Server entry point
// ---------------------------------------------------------------------------

/// Serve the site rooted at `root` until SIGINT.
///
/// Binds to `bind_addr` starting at `start_port`, retrying on `EADDRINUSE`.
/// The startup banner is written to stdout.
pub async fn run_serve(
    root: PathBuf,
    bind_addr: String,
    start_port: u16,
    composer: FragmentComposer,
    includes: PageIncludes,
    no_cache: bool,
) -> io::Result<()> {
    let canonical_root = std::fs::canonicalize(&root)?;
    let templates = composer.source().describe();

    let state = Arc::new(AppState {
        serve_root: root,
        canonical_root,
        composer,
        includes,
        no_cache,
    });

    let (std_listener, bound_port) = bind_with_retry(&bind_addr, start_port).map_err(|msg| {
        warn!("[bind] {msg}");
        io::Error::new(io::ErrorKind::AddrInUse, msg)
    })?;
    std_listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;

    let app = Router::new()
        .fallback(serve_handler)
        .layer(CompressionLayer::new())
        .with_state(Arc::clone(&state));

    println!("fragkit serve");
    println!("root:      {}", state.canonical_root.display());
    println!("templates: {templates}");
    if no_cache {
        println!("cache:     off");
    }
    println!("url:       http://{}:{}/", bind_addr, bound_port);
    info!("[serve] listening on {}:{}", bind_addr, bound_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("[shutdown] failed to install SIGINT handler: {e}");
                std::future::pending::<()>().await;
            }
            info!("[shutdown] complete");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_mode_detected_when_param_present() {
        assert!(is_raw_mode("raw=1"));
        assert!(is_raw_mode("foo=bar&raw=1"));
    }

    #[test]
    fn raw_mode_not_detected_when_absent() {
        assert!(!is_raw_mode(""));
        assert!(!is_raw_mode("raw=0"));
        assert!(!is_raw_mode("xraw=1"));
    }

    #[test]
    fn last_modified_formats_http_date() {
        let stamp = last_modified(Some(SystemTime::UNIX_EPOCH)).unwrap();
        assert_eq!(stamp, "Thu, 01 Jan 1970 00:00:00 GMT");
        assert!(last_modified(None).is_none());
    }

    #[test]
    fn bind_with_retry_skips_busy_port() {
        let busy = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let (_listener, port) = bind_with_retry("127.0.0.1", busy_port).unwrap();
        assert_ne!(port, busy_port);
    }

    #[tokio::test]
    async fn resolve_exact_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("about.html"), "<p>a</p>").unwrap();

        let candidate = dir.path().join("about.html");
        let (path, branch) = resolve_candidate(&candidate).await.unwrap();
        assert_eq!(branch, "exact");
        assert_eq!(path, candidate);
    }

    #[tokio::test]
    async fn resolve_extensionless_falls_back_to_html() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("aboutme.html"), "<p>me</p>").unwrap();

        let (path, branch) = resolve_candidate(&dir.path().join("aboutme")).await.unwrap();
        assert_eq!(branch, "extensionless");
        assert_eq!(path, dir.path().join("aboutme.html"));
    }

    #[tokio::test]
    async fn resolve_directory_index() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("blog");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("index.html"), "<h1>Blog</h1>").unwrap();

        let (path, branch) = resolve_candidate(&sub).await.unwrap();
        assert_eq!(branch, "index");
        assert_eq!(path, sub.join("index.html"));
    }

    #[tokio::test]
    async fn resolve_directory_without_index_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_candidate(dir.path()).await.is_none());
        assert!(resolve_candidate(&dir.path().join("missing")).await.is_none());
    }
}
