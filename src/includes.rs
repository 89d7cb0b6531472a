//! Fixed-name wrappers over [`FragmentComposer::compose`] for the shared
//! header, footer, styles and scripts fragments, plus the per-page bundle
//! that applies them together.

use std::path::{Component, Path};

use log::{debug, warn};
use serde::Deserialize;

use crate::composer::{CompositionRequest, FragmentComposer};
use crate::document::Document;
use crate::error::{ComposeError, LoadError};
use crate::template::Variables;

pub const HEADER_FRAGMENT: &str = "header";
pub const HEADER_TARGET: &str = "header-placeholder";
pub const FOOTER_FRAGMENT: &str = "footer";
pub const FOOTER_TARGET: &str = "footer-placeholder";
pub const STYLES_FRAGMENT: &str = "styles";
pub const STYLES_TARGET: &str = "styles-placeholder";
pub const SCRIPTS_FRAGMENT: &str = "scripts";
pub const SCRIPTS_TARGET: &str = "scripts-placeholder";

/// Variable holding the relative path from a page back to the site root
/// (`""` at the root, `"../"` one directory down).
pub const BASE_PATH_VAR: &str = "base_path";

/// Prefix leading from the page at `page` (relative to the site root) back to
/// the root.
pub fn root_prefix(page: &Path) -> String {
    let depth = page.parent().map_or(0, |dir| {
        dir.components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count()
    });
    "../".repeat(depth)
}

/// `true` for links resolved against the page's own directory.
fn is_relative_link(url: &str) -> bool {
    !url.is_empty()
        && !url.starts_with('/')
        && !url.starts_with('#')
        && !url.starts_with('?')
        && !url.contains(':')
}

fn rebase(url: &str, prefix: &str) -> String {
    if is_relative_link(url) {
        format!("{prefix}{url}")
    } else {
        url.to_owned()
    }
}

/// Variables for the `header` fragment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeaderOptions {
    pub home_url: String,
    pub home_link_class: String,
    /// Inserted as a raw attribute, hence the embedded `class="..."`.
    pub title_class: String,
    pub about_url: String,
    pub case_studies_url: String,
    pub hover_color: String,
}

impl Default for HeaderOptions {
    fn default() -> Self {
        Self {
            home_url: "index.html".to_owned(),
            home_link_class: String::new(),
            title_class: r#"class="gradient-text""#.to_owned(),
            about_url: "aboutme.html".to_owned(),
            case_studies_url: "case_studies.html".to_owned(),
            hover_color: "#bc5090".to_owned(),
        }
    }
}

impl HeaderOptions {
    pub fn variables(&self) -> Variables {
        Variables::from([
            ("home_url".to_owned(), self.home_url.clone()),
            ("home_link_class".to_owned(), self.home_link_class.clone()),
            ("title_class".to_owned(), self.title_class.clone()),
            ("about_url".to_owned(), self.about_url.clone()),
            ("case_studies_url".to_owned(), self.case_studies_url.clone()),
            ("hover_color".to_owned(), self.hover_color.clone()),
        ])
    }

    /// Copy with the relative link targets prefixed by `prefix`.  Absolute
    /// paths, fragments and URLs with a scheme are left alone.
    pub fn rebased(&self, prefix: &str) -> Self {
        Self {
            home_url: rebase(&self.home_url, prefix),
            about_url: rebase(&self.about_url, prefix),
            case_studies_url: rebase(&self.case_studies_url, prefix),
            ..self.clone()
        }
    }
}

/// Variables for the `styles` fragment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StyleOptions {
    pub gradient_color_1: String,
    pub gradient_color_2: String,
    pub additional_styles: String,
}

impl Default for StyleOptions {
    fn default() -> Self {
        Self {
            gradient_color_1: "#58508d".to_owned(),
            gradient_color_2: "#bc5090".to_owned(),
            additional_styles: String::new(),
        }
    }
}

impl StyleOptions {
    pub fn variables(&self) -> Variables {
        Variables::from([
            ("gradient_color_1".to_owned(), self.gradient_color_1.clone()),
            ("gradient_color_2".to_owned(), self.gradient_color_2.clone()),
            ("additional_styles".to_owned(), self.additional_styles.clone()),
        ])
    }
}

/// Variables for the `scripts` fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScriptOptions {
    pub additional_scripts: String,
}

impl ScriptOptions {
    pub fn variables(&self) -> Variables {
        Variables::from([(
            "additional_scripts".to_owned(),
            self.additional_scripts.clone(),
        )])
    }
}

pub fn header_request(options: &HeaderOptions) -> CompositionRequest {
    CompositionRequest::new(HEADER_FRAGMENT, HEADER_TARGET).with_variables(options.variables())
}

pub fn footer_request() -> CompositionRequest {
    CompositionRequest::new(FOOTER_FRAGMENT, FOOTER_TARGET)
}

pub fn styles_request(options: &StyleOptions) -> CompositionRequest {
    CompositionRequest::new(STYLES_FRAGMENT, STYLES_TARGET).with_variables(options.variables())
}

pub fn scripts_request(options: &ScriptOptions) -> CompositionRequest {
    CompositionRequest::new(SCRIPTS_FRAGMENT, SCRIPTS_TARGET).with_variables(options.variables())
}

impl FragmentComposer {
    pub async fn include_header<D>(&self, doc: &mut D, options: &HeaderOptions) -> Result<(), ComposeError>
    where
        D: Document + ?Sized,
    {
        self.compose_request(doc, &header_request(options)).await
    }

    pub async fn include_footer<D>(&self, doc: &mut D) -> Result<(), ComposeError>
    where
        D: Document + ?Sized,
    {
        self.compose_request(doc, &footer_request()).await
    }

    pub async fn include_styles<D>(&self, doc: &mut D, options: &StyleOptions) -> Result<(), ComposeError>
    where
        D: Document + ?Sized,
    {
        self.compose_request(doc, &styles_request(options)).await
    }

    pub async fn include_scripts<D>(&self, doc: &mut D, options: &ScriptOptions) -> Result<(), ComposeError>
    where
        D: Document + ?Sized,
    {
        self.compose_request(doc, &scripts_request(options)).await
    }
}

/// Everything composed into each page: the four standard includes plus any
/// extra fragments from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PageIncludes {
    pub header: HeaderOptions,
    pub styles: StyleOptions,
    pub scripts: ScriptOptions,
    pub fragments: Vec<CompositionRequest>,
}

/// What happened to one page.
#[derive(Debug, Default)]
pub struct PageReport {
    /// Targets that received content.
    pub composed: Vec<String>,
    /// Targets absent from the page.
    pub skipped: Vec<String>,
    pub failed: Vec<LoadError>,
}

impl PageIncludes {
    /// Standard includes first, then configured extras, in that order.
    pub fn requests(&self) -> Vec<CompositionRequest> {
        self.requests_for(Path::new(""))
    }

    /// Requests for the page at `page` (relative to the site root).  Header
    /// links are rebased onto the root and every request gets `base_path`
    /// unless it sets one itself.
    pub fn requests_for(&self, page: &Path) -> Vec<CompositionRequest> {
        let prefix = root_prefix(page);
        let mut requests = vec![
            styles_request(&self.styles),
            header_request(&self.header.rebased(&prefix)),
            footer_request(),
            scripts_request(&self.scripts),
        ];
        requests.extend(self.fragments.iter().cloned());
        for request in &mut requests {
            request
                .variables
                .entry(BASE_PATH_VAR.to_owned())
                .or_insert_with(|| prefix.clone());
        }
        requests
    }

    /// Compose every request into `doc` as a page at the site root.
    pub async fn apply<D>(&self, composer: &FragmentComposer, doc: &mut D) -> PageReport
    where
        D: Document + ?Sized,
    {
        self.apply_at(composer, doc, Path::new("")).await
    }

    /// Compose every request into `doc`, the page at `page` relative to the
    /// site root.  Missing targets are skipped quietly; load failures are
    /// logged and collected.
    pub async fn apply_at<D>(&self, composer: &FragmentComposer, doc: &mut D, page: &Path) -> PageReport
    where
        D: Document + ?Sized,
    {
        let requests = self.requests_for(page);
        let results = composer.compose_all(doc, &requests).await;

        let mut report = PageReport::default();
        for (request, result) in requests.into_iter().zip(results) {
            match result {
                Ok(()) => report.composed.push(request.target),
                Err(ComposeError::TargetMissing { target }) => {
                    debug!("[page] target={target} skipped");
                    report.skipped.push(target);
                }
                Err(ComposeError::Load(err)) => {
                    warn!("[page] target={} fragment omitted: {err}", request.target);
                    report.failed.push(err);
                }
            }
        }
        report
    }
}
