//! Document model for composition targets.
//!
//! A target location is an element carrying `id="<target>"` that already
//! exists in the page.  The composer only ever rewrites the *content* of such
//! an element; it never creates or removes elements.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// How composed content is written into a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectMode {
    /// Replace any prior content of the target.
    #[default]
    Replace,
    /// Insert after the target's existing content.
    Append,
}

/// A page that exposes identified target locations.
pub trait Document {
    /// Return `true` when an element with `id` exists and can hold content.
    fn has_target(&self, id: &str) -> bool;

    /// Write `content` into the target.  Returns `false` (and leaves the
    /// document untouched) when the target does not exist.
    fn write_target(&mut self, id: &str, content: &str, mode: InjectMode) -> bool;
}

static OPEN_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<([A-Za-z][A-Za-z0-9-]*)(\s(?:"[^"]*"|'[^']*'|[^'">])*)?>"#)
        .expect("open tag regex is valid")
});

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#)
        .expect("attribute regex is valid")
});

/// A comment, or the open tag of an element whose body is raw text.
static OPAQUE_START_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<!--.*?-->|<(script|style)(?:\s(?:"[^"]*"|'[^']*'|[^'">])*)?>"#)
        .expect("opaque start regex is valid")
});

static RAW_CLOSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</(script|style)\s*>").expect("raw close regex is valid")
});

/// Elements that never have content and so cannot be targets.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// An HTML page held as text.
///
/// Element matching is a lightweight scan, not a full HTML parse: it finds the
/// first element outside comments whose `id` attribute equals the target, then
/// balances same-named open/close tags to locate the end of its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlDocument {
    html: String,
}

impl HtmlDocument {
    pub fn new(html: impl Into<String>) -> Self {
        Self { html: html.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.html
    }

    pub fn into_string(self) -> String {
        self.html
    }

    /// Current content of the target element, if it exists.
    pub fn target_content(&self, id: &str) -> Option<&str> {
        self.content_span(id).map(|span| &self.html[span])
    }

    /// Byte range of the content of the element whose `id` equals `id`.
    fn content_span(&self, id: &str) -> Option<Range<usize>> {
        let opaque = opaque_ranges(&self.html);

        for cap in OPEN_TAG_RE.captures_iter(&self.html) {
            let Some(whole) = cap.get(0) else { continue };
            if in_ranges(&opaque, whole.start()) {
                continue;
            }
            let attrs = cap.get(2).map(|m| m.as_str()).unwrap_or("");
            if attr_id(attrs) != Some(id) {
                continue;
            }

            let tag = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            if attrs.trim_end().ends_with('/')
                || VOID_ELEMENTS.iter().any(|v| v.eq_ignore_ascii_case(tag))
            {
                return None;
            }
            let start = whole.end();
            return find_close(&self.html, tag, start, &opaque).map(|end| start..end);
        }
        None
    }
}

impl Document for HtmlDocument {
    fn has_target(&self, id: &str) -> bool {
        self.content_span(id).is_some()
    }

    fn write_target(&mut self, id: &str, content: &str, mode: InjectMode) -> bool {
        let Some(span) = self.content_span(id) else {
            return false;
        };
        match mode {
            InjectMode::Replace => self.html.replace_range(span, content),
            InjectMode::Append => self.html.insert_str(span.end, content),
        }
        true
    }
}

/// Extract the value of the `id` attribute from an attribute string.
fn attr_id(attrs: &str) -> Option<&str> {
    ATTR_RE.captures_iter(attrs).find_map(|cap| {
        let name = cap.get(1)?;
        if !name.as_str().eq_ignore_ascii_case("id") {
            return None;
        }
        cap.get(2)
            .or_else(|| cap.get(3))
            .or_else(|| cap.get(4))
            .map(|m| m.as_str())
    })
}

/// Byte ranges whose text is never markup: comments and the bodies of
/// `script` and `style` elements.
fn opaque_ranges(html: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut pos = 0;
    while let Some(cap) = OPAQUE_START_RE.captures_at(html, pos) {
        let Some(whole) = cap.get(0) else { break };
        let Some(raw_tag) = cap.get(1) else {
            ranges.push(whole.range());
            pos = whole.end();
            continue;
        };
        let body_start = whole.end();
        let body_end = RAW_CLOSE_RE
            .captures_iter(&html[body_start..])
            .filter_map(|c| Some((c.get(0)?.start(), c.get(1)?.as_str())))
            .find(|(_, name)| name.eq_ignore_ascii_case(raw_tag.as_str()))
            .map_or(html.len(), |(offset, _)| body_start + offset);
        ranges.push(body_start..body_end);
        pos = body_end;
    }
    ranges
}

fn in_ranges(ranges: &[Range<usize>], pos: usize) -> bool {
    ranges.iter().any(|r| r.contains(&pos))
}

/// Find the byte offset of the `</tag>` that closes an element whose content
/// starts at `from`, accounting for nested elements with the same name.
/// Tags inside `opaque` ranges are ignored.
fn find_close(html: &str, tag: &str, from: usize, opaque: &[Range<usize>]) -> Option<usize> {
    let pattern = format!(
        r#"(?i)<(/?){}(?:\s(?:"[^"]*"|'[^']*'|[^'">])*)?>"#,
        regex::escape(tag)
    );
    let re = Regex::new(&pattern).ok()?;
    let mut depth = 1usize;
    for cap in re.captures_iter(&html[from..]) {
        let whole = cap.get(0)?;
        if in_ranges(opaque, from + whole.start()) {
            continue;
        }
        let closing = cap.get(1).is_some_and(|m| !m.as_str().is_empty());
        if closing {
            depth -= 1;
            if depth == 0 {
                return Some(from + whole.start());
            }
        } else if !whole.as_str().ends_with("/>") {
            depth += 1;
        }
    }
    None
}
