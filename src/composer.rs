//! Fetch-once, substitute, inject.
//!
//! [`FragmentComposer`] owns the fragment cache and the map of in-flight
//! loads for one session (a page, a static build, or a server process).
//! Concurrent requests for the same fragment name share a single retrieval;
//! successful bodies are cached for the lifetime of the composer, failures
//! are not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::document::{Document, InjectMode};
use crate::error::{ComposeError, LoadError, LoadFailure};
use crate::source::{resolve_location, FragmentSource};
use crate::template::{self, Variables};

/// Load state of a single fragment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// One `(fragment, target, variables)` composition, consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CompositionRequest {
    pub name: String,
    pub target: String,
    #[serde(default, alias = "vars")]
    pub variables: Variables,
    #[serde(default)]
    pub mode: InjectMode,
}

impl CompositionRequest {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            variables: Variables::new(),
            mode: InjectMode::Replace,
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_mode(mut self, mode: InjectMode) -> Self {
        self.mode = mode;
        self
    }
}

type LoadResult = Result<Arc<str>, LoadError>;
type PendingLoad = Shared<BoxFuture<'static, LoadResult>>;

struct InFlight {
    /// Distinguishes this load from a later retry of the same name.
    id: u64,
    pending: PendingLoad,
}

#[derive(Default)]
struct ComposerState {
    bodies: HashMap<String, Arc<str>>,
    status: HashMap<String, FragmentStatus>,
    in_flight: HashMap<String, InFlight>,
    next_load_id: u64,
}

/// Session-wide fragment cache and composition entry point.
///
/// The lock around the state is only taken for bookkeeping and is never held
/// across an `.await`.
pub struct FragmentComposer {
    source: Arc<dyn FragmentSource>,
    state: Mutex<ComposerState>,
}

impl FragmentComposer {
    pub fn new(source: Arc<dyn FragmentSource>) -> Self {
        Self {
            source,
            state: Mutex::new(ComposerState::default()),
        }
    }

    pub fn source(&self) -> &dyn FragmentSource {
        self.source.as_ref()
    }

    /// A new composer over the same source with an empty cache.
    pub fn uncached(&self) -> Self {
        Self::new(Arc::clone(&self.source))
    }

    fn lock(&self) -> MutexGuard<'_, ComposerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current load state of `name`.
    pub fn status(&self, name: &str) -> FragmentStatus {
        self.lock()
            .status
            .get(name)
            .copied()
            .unwrap_or(FragmentStatus::Unloaded)
    }

    /// Cached body of `name`, if it has loaded successfully.
    pub fn cached(&self, name: &str) -> Option<Arc<str>> {
        self.lock().bodies.get(name).cloned()
    }

    /// Number of fragment bodies held in the cache.
    pub fn cached_count(&self) -> usize {
        self.lock().bodies.len()
    }

    /// Load the body of fragment `name`.
    ///
    /// Returns the cached body when present, joins an in-flight load when one
    /// exists, and otherwise issues a single retrieval through the source.
    pub async fn load_fragment(&self, name: &str) -> Result<Arc<str>, LoadError> {
        let location = resolve_location(name);
        if name.is_empty() {
            return Err(LoadError {
                name: String::new(),
                location,
                failure: LoadFailure::EmptyName,
            });
        }

        let (id, pending) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some(body) = state.bodies.get(name) {
                debug!("[load] name={name} status=cached");
                return Ok(Arc::clone(body));
            }
            match state.in_flight.get(name) {
                Some(flight) => {
                    debug!("[load] name={name} status=joined");
                    (flight.id, flight.pending.clone())
                }
                None => {
                    let id = state.next_load_id;
                    state.next_load_id += 1;
                    let pending = self.start_load(name, location);
                    state.in_flight.insert(
                        name.to_owned(),
                        InFlight {
                            id,
                            pending: pending.clone(),
                        },
                    );
                    state
                        .status
                        .insert(name.to_owned(), FragmentStatus::Loading);
                    (id, pending)
                }
            }
        };

        let result = pending.await;
        self.settle(name, id, &result);
        result
    }

    fn start_load(&self, name: &str, location: String) -> PendingLoad {
        let source = Arc::clone(&self.source);
        let name = name.to_owned();
        async move {
            info!("[load] name={name} location={location} status=fetching");
            match source.fetch(&location).await {
                Ok(body) => Ok(Arc::from(body)),
                Err(failure) => Err(LoadError {
                    name,
                    location,
                    failure,
                }),
            }
        }
        .boxed()
        .shared()
    }

    /// Record the outcome of load `id`.  Only the first caller to observe a
    /// given load settles it; later joiners and stale loads are ignored.
    fn settle(&self, name: &str, id: u64, result: &LoadResult) {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.in_flight.get(name) {
            Some(flight) if flight.id == id => {}
            _ => return,
        }
        state.in_flight.remove(name);
        match result {
            Ok(body) => {
                info!("[load] name={name} status=loaded bytes={}", body.len());
                state.bodies.insert(name.to_owned(), Arc::clone(body));
                state.status.insert(name.to_owned(), FragmentStatus::Loaded);
            }
            Err(err) => {
                warn!("[load] name={name} status=failed error=\"{err}\"");
                state.status.insert(name.to_owned(), FragmentStatus::Failed);
            }
        }
    }

    /// Load fragment `name`, substitute `variables`, and replace the content
    /// of `target` in `doc` with the result.
    ///
    /// A missing target is reported as [`ComposeError::TargetMissing`] before
    /// any retrieval is attempted.  On any error `doc` is left untouched.
    pub async fn compose<D>(
        &self,
        doc: &mut D,
        name: &str,
        target: &str,
        variables: &Variables,
    ) -> Result<(), ComposeError>
    where
        D: Document + ?Sized,
    {
        self.compose_into(doc, name, target, variables, InjectMode::Replace)
            .await
    }

    /// [`compose`](Self::compose) driven by a [`CompositionRequest`], honouring
    /// its injection mode.
    pub async fn compose_request<D>(
        &self,
        doc: &mut D,
        request: &CompositionRequest,
    ) -> Result<(), ComposeError>
    where
        D: Document + ?Sized,
    {
        self.compose_into(
            doc,
            &request.name,
            &request.target,
            &request.variables,
            request.mode,
        )
        .await
    }

    async fn compose_into<D>(
        &self,
        doc: &mut D,
        name: &str,
        target: &str,
        variables: &Variables,
        mode: InjectMode,
    ) -> Result<(), ComposeError>
    where
        D: Document + ?Sized,
    {
        if !doc.has_target(target) {
            debug!("[compose] name={name} target={target} status=target-missing");
            return Err(ComposeError::TargetMissing {
                target: target.to_owned(),
            });
        }
        let body = self.load_fragment(name).await?;
        apply(doc, name, target, &body, variables, mode)
    }

    /// Apply several requests to one document.
    ///
    /// Fragments for every present target are loaded concurrently, so
    /// requests sharing a name cost one retrieval.  Results are applied in
    /// request order and returned in the same order.
    pub async fn compose_all<D>(
        &self,
        doc: &mut D,
        requests: &[CompositionRequest],
    ) -> Vec<Result<(), ComposeError>>
    where
        D: Document + ?Sized,
    {
        let loads = requests.iter().map(|request| {
            let present = doc.has_target(&request.target);
            async move {
                if present {
                    Some(self.load_fragment(&request.name).await)
                } else {
                    None
                }
            }
        });
        let bodies = join_all(loads).await;

        let mut results = Vec::with_capacity(requests.len());
        for (request, body) in requests.iter().zip(bodies) {
            let result = match body {
                None => {
                    debug!(
                        "[compose] name={} target={} status=target-missing",
                        request.name, request.target
                    );
                    Err(ComposeError::TargetMissing {
                        target: request.target.clone(),
                    })
                }
                Some(Err(err)) => Err(ComposeError::Load(err)),
                Some(Ok(body)) => apply(
                    doc,
                    &request.name,
                    &request.target,
                    &body,
                    &request.variables,
                    request.mode,
                ),
            };
            results.push(result);
        }
        results
    }
}

fn apply<D>(
    doc: &mut D,
    name: &str,
    target: &str,
    body: &str,
    variables: &Variables,
    mode: InjectMode,
) -> Result<(), ComposeError>
where
    D: Document + ?Sized,
{
    let unmapped = template::unmapped(body, variables);
    if !unmapped.is_empty() {
        debug!(
            "[compose] name={name} unmapped={}",
            unmapped.join(",")
        );
    }
    let rendered = template::substitute(body, variables);
    if !doc.write_target(target, &rendered, mode) {
        return Err(ComposeError::TargetMissing {
            target: target.to_owned(),
        });
    }
    debug!(
        "[compose] name={name} target={target} status=ok bytes={}",
        rendered.len()
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::document::HtmlDocument;

    /// In-memory source that counts retrievals and can be gated or failed.
    #[derive(Default)]
    pub(crate) struct MemorySource {
        bodies: Mutex<HashMap<String, String>>,
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
        gated: bool,
        pub gate: Notify,
    }

    impl MemorySource {
        pub(crate) fn with(fragments: &[(&str, &str)]) -> Self {
            let source = Self::default();
            for (name, body) in fragments {
                source.insert(name, body);
            }
            source
        }

        fn gated(fragments: &[(&str, &str)]) -> Self {
            Self {
                gated: true,
                ..Self::with(fragments)
            }
        }

        pub(crate) fn insert(&self, name: &str, body: &str) {
            self.bodies
                .lock()
                .unwrap()
                .insert(resolve_location(name), body.to_owned());
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FragmentSource for MemorySource {
        async fn fetch(&self, location: &str) -> Result<String, LoadFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.gated {
                self.gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(LoadFailure::Transport("simulated outage".to_owned()));
            }
            self.bodies
                .lock()
                .unwrap()
                .get(location)
                .cloned()
                .ok_or(LoadFailure::NotFound)
        }

        fn describe(&self) -> String {
            "memory".to_owned()
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_retrieval() {
        let source = Arc::new(MemorySource::gated(&[("header", "<h1>hi</h1>")]));
        let composer = FragmentComposer::new(source.clone());

        let loads = join_all((0..8).map(|_| composer.load_fragment("header")));
        let release = async {
            tokio::task::yield_now().await;
            assert_eq!(composer.status("header"), FragmentStatus::Loading);
            source.gate.notify_one();
        };
        let (results, ()) = tokio::join!(loads, release);

        assert_eq!(results.len(), 8);
        for result in results {
            assert_eq!(result.unwrap().as_ref(), "<h1>hi</h1>");
        }
        assert_eq!(source.calls(), 1);
        assert_eq!(composer.status("header"), FragmentStatus::Loaded);
    }

    #[tokio::test]
    async fn cached_body_skips_retrieval() {
        let source = Arc::new(MemorySource::with(&[("footer", "<footer/>")]));
        let composer = FragmentComposer::new(source.clone());

        assert_eq!(composer.status("footer"), FragmentStatus::Unloaded);
        for _ in 0..3 {
            composer.load_fragment("footer").await.unwrap();
        }
        assert_eq!(source.calls(), 1);
        assert_eq!(composer.cached("footer").as_deref(), Some("<footer/>"));
        assert_eq!(composer.cached_count(), 1);
    }

    #[tokio::test]
    async fn empty_name_is_rejected_without_retrieval() {
        let source = Arc::new(MemorySource::default());
        let composer = FragmentComposer::new(source.clone());

        let err = composer.load_fragment("").await.unwrap_err();
        assert_eq!(err.failure, LoadFailure::EmptyName);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn compose_substitutes_into_target() {
        let source = Arc::new(MemorySource::with(&[("bold", "<b>{{x}}</b>")]));
        let composer = FragmentComposer::new(source);
        let mut doc = HtmlDocument::new(r#"<div id="slot"></div>"#);

        composer
            .compose(&mut doc, "bold", "slot", &vars(&[("x", "A")]))
            .await
            .unwrap();
        assert_eq!(doc.target_content("slot"), Some("<b>A</b>"));
    }

    #[tokio::test]
    async fn compose_leaves_unmapped_placeholders() {
        let source = Arc::new(MemorySource::with(&[("bold", "<b>{{x}}</b>")]));
        let composer = FragmentComposer::new(source);
        let mut doc = HtmlDocument::new(r#"<div id="slot">prior</div>"#);

        composer
            .compose(&mut doc, "bold", "slot", &vars(&[("y", "B")]))
            .await
            .unwrap();
        assert_eq!(doc.target_content("slot"), Some("<b>{{x}}</b>"));
    }

    #[tokio::test]
    async fn compose_missing_target_is_a_noop() {
        let source = Arc::new(MemorySource::with(&[("bold", "<b>{{x}}</b>")]));
        let composer = FragmentComposer::new(source.clone());
        let original = r#"<div id="other">keep</div>"#;
        let mut doc = HtmlDocument::new(original);

        let err = composer
            .compose(&mut doc, "bold", "slot", &Variables::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ComposeError::TargetMissing {
                target: "slot".to_owned()
            }
        );
        assert_eq!(doc.as_str(), original);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn compose_overlapping_keys() {
        let source = Arc::new(MemorySource::with(&[(
            "card",
            "<p>{{name}}</p><p>{{name_extra}}</p>",
        )]));
        let composer = FragmentComposer::new(source);
        let mut doc = HtmlDocument::new(r#"<section id="card"></section>"#);

        composer
            .compose(
                &mut doc,
                "card",
                "card",
                &vars(&[("name", "X"), ("name_extra", "Y")]),
            )
            .await
            .unwrap();
        assert_eq!(doc.target_content("card"), Some("<p>X</p><p>Y</p>"));
    }

    #[tokio::test]
    async fn failed_load_is_not_cached_and_retry_succeeds() {
        let source = Arc::new(MemorySource::with(&[("header", "<nav>ok</nav>")]));
        source.fail.store(true, Ordering::SeqCst);
        let composer = FragmentComposer::new(source.clone());
        let original = r#"<header id="header-placeholder">fallback</header>"#;
        let mut doc = HtmlDocument::new(original);

        let err = composer
            .compose(&mut doc, "header", "header-placeholder", &Variables::new())
            .await
            .unwrap_err();
        match err {
            ComposeError::Load(load) => {
                assert_eq!(load.name, "header");
                assert_eq!(load.location, "templates/header.html");
                assert!(matches!(load.failure, LoadFailure::Transport(_)));
            }
            other => panic!("expected load error, got {other:?}"),
        }
        assert_eq!(doc.as_str(), original);
        assert_eq!(composer.status("header"), FragmentStatus::Failed);
        assert!(composer.cached("header").is_none());

        source.fail.store(false, Ordering::SeqCst);
        composer
            .compose(&mut doc, "header", "header-placeholder", &Variables::new())
            .await
            .unwrap();
        assert_eq!(doc.target_content("header-placeholder"), Some("<nav>ok</nav>"));
        assert_eq!(composer.status("header"), FragmentStatus::Loaded);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn joined_callers_all_observe_failure() {
        let source = Arc::new(MemorySource::gated(&[]));
        source.fail.store(true, Ordering::SeqCst);
        let composer = FragmentComposer::new(source.clone());

        let loads = join_all((0..4).map(|_| composer.load_fragment("scripts")));
        let release = async {
            tokio::task::yield_now().await;
            source.gate.notify_one();
        };
        let (results, ()) = tokio::join!(loads, release);

        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(source.calls(), 1);
        assert_eq!(composer.status("scripts"), FragmentStatus::Failed);
    }

    #[tokio::test]
    async fn late_joiner_does_not_settle_newer_retry() {
        let source = Arc::new(MemorySource::gated(&[("nav", "<nav/>")]));
        source.fail.store(true, Ordering::SeqCst);
        let composer = FragmentComposer::new(source.clone());

        let mut first = Box::pin(composer.load_fragment("nav"));
        let mut late = Box::pin(composer.load_fragment("nav"));
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(futures::poll!(late.as_mut()).is_pending());

        source.gate.notify_one();
        assert!(first.await.is_err());
        assert_eq!(composer.status("nav"), FragmentStatus::Failed);

        // A retry starts while the second joiner of the failed load has not
        // observed its result yet.
        source.fail.store(false, Ordering::SeqCst);
        let mut retry = Box::pin(composer.load_fragment("nav"));
        assert!(futures::poll!(retry.as_mut()).is_pending());
        assert_eq!(composer.status("nav"), FragmentStatus::Loading);

        assert!(late.await.is_err());
        assert_eq!(composer.status("nav"), FragmentStatus::Loading);
        assert!(composer.cached("nav").is_none());

        source.gate.notify_one();
        assert_eq!(retry.await.unwrap().as_ref(), "<nav/>");
        assert_eq!(composer.status("nav"), FragmentStatus::Loaded);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn uncached_copy_refetches() {
        let source = Arc::new(MemorySource::with(&[("footer", "<p>v1</p>")]));
        let composer = FragmentComposer::new(source.clone());
        composer.load_fragment("footer").await.unwrap();

        source.insert("footer", "<p>v2</p>");
        let fresh = composer.uncached();
        assert_eq!(fresh.cached_count(), 0);
        assert_eq!(fresh.load_fragment("footer").await.unwrap().as_ref(), "<p>v2</p>");
        assert_eq!(composer.cached("footer").as_deref(), Some("<p>v1</p>"));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn compose_request_appends() {
        let source = Arc::new(MemorySource::with(&[("meta", "<meta name=\"x\">")]));
        let composer = FragmentComposer::new(source);
        let mut doc = HtmlDocument::new(r#"<head id="head"><title>T</title></head>"#);

        let request = CompositionRequest::new("meta", "head").with_mode(InjectMode::Append);
        composer.compose_request(&mut doc, &request).await.unwrap();
        assert_eq!(
            doc.target_content("head"),
            Some("<title>T</title><meta name=\"x\">")
        );
    }

    #[tokio::test]
    async fn compose_all_dedups_and_skips_missing_targets() {
        let source = Arc::new(MemorySource::with(&[
            ("badge", "<i>{{label}}</i>"),
            ("unused", "never"),
        ]));
        let composer = FragmentComposer::new(source.clone());
        let mut doc = HtmlDocument::new(r#"<span id="a"></span><span id="b"></span>"#);

        let requests = vec![
            CompositionRequest::new("badge", "a").with_variables(vars(&[("label", "one")])),
            CompositionRequest::new("badge", "b").with_variables(vars(&[("label", "two")])),
            CompositionRequest::new("unused", "c"),
        ];
        let results = composer.compose_all(&mut doc, &requests).await;

        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(results[2].as_ref().unwrap_err().is_target_missing());
        assert_eq!(
            doc.as_str(),
            r#"<span id="a"><i>one</i></span><span id="b"><i>two</i></span>"#
        );
        assert_eq!(source.calls(), 1);
        assert_eq!(composer.status("unused"), FragmentStatus::Unloaded);
    }

    #[test]
    fn composition_request_deserializes_with_defaults() {
        let yaml = "name: sidebar\ntarget: sidebar-placeholder\nvars:\n  active: home\n";
        let request: CompositionRequest = serde_yml::from_str(yaml).unwrap();
        assert_eq!(request.name, "sidebar");
        assert_eq!(request.mode, InjectMode::Replace);
        assert_eq!(request.variables.get("active").map(String::as_str), Some("home"));
    }
}
