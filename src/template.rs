//! `{{key}}` placeholder substitution for fragment bodies.
//!
//! This is not a template language: there are no conditionals,
//! loops, filters or escaping.  A placeholder is the literal token `{{key}}`
//! and is replaced by the caller-supplied value verbatim.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Placeholder key to replacement value.
///
/// Substitution does not depend on map order.
pub type Variables = BTreeMap<String, String>;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").expect("placeholder regex is valid"));

/// Format `key` as its placeholder token, e.g. `name` -> `{{name}}`.
pub fn token(key: &str) -> String {
    format!("{{{{{key}}}}}")
}

/// Return `true` when `key` is a well-formed placeholder identifier
/// (non-empty, ASCII alphanumeric or underscore).
pub fn is_identifier(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Replace every `{{key}}` token in `body` for every key present in `vars`.
///
/// - Placeholders whose key is not in `vars` are left verbatim.
/// - Keys present in `vars` but absent from `body` are ignored.
/// - Matching is longest-key-first at each candidate position, so a key
///   that is a prefix of another (`name` / `name_extra`) can never consume
///   part of the longer token.
/// - Inserted values are never re-scanned: a value containing `{{other}}`
///   is emitted literally even if `other` is also mapped.
pub fn substitute(body: &str, vars: &Variables) -> String {
    if vars.is_empty() || !body.contains("{{") {
        return body.to_owned();
    }

    let mut tokens: Vec<(String, &str)> = vars
        .iter()
        .map(|(key, value)| (token(key), value.as_str()))
        .collect();
    tokens.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(pos) = rest.find("{{") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match tokens.iter().find(|(tok, _)| tail.starts_with(tok.as_str())) {
            Some((tok, value)) => {
                out.push_str(value);
                rest = &tail[tok.len()..];
            }
            None => {
                // Advance a single brace so `{{{key}}}` still matches at +1.
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// List the distinct placeholder identifiers in `body`, in order of first
/// appearance.
pub fn placeholders(body: &str) -> Vec<&str> {
    let mut seen: Vec<&str> = Vec::new();
    for cap in PLACEHOLDER_RE.captures_iter(body) {
        if let Some(m) = cap.get(1) {
            if !seen.contains(&m.as_str()) {
                seen.push(m.as_str());
            }
        }
    }
    seen
}

/// Placeholders in `body` that `vars` does not map.
pub fn unmapped<'a>(body: &'a str, vars: &Variables) -> Vec<&'a str> {
    placeholders(body)
        .into_iter()
        .filter(|key| !vars.contains_key(*key))
        .collect()
}
