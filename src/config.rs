//! Site configuration (`fragkit.yml`) and template source selection.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use reqwest::Url;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::includes::PageIncludes;
use crate::source::{DirSource, FragmentSource, HttpSource};

/// File looked up in the site root when no `--config` is given.
pub const CONFIG_FILE_NAME: &str = "fragkit.yml";

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Contents of `fragkit.yml`.  Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Directory (relative to the site root) or `http(s)://` base URL that
    /// `templates/<name>.html` resolves against.  Defaults to the site root.
    pub template_root: Option<String>,
    pub http_timeout_secs: u64,
    #[serde(flatten)]
    pub includes: PageIncludes,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            template_root: None,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            includes: PageIncludes::default(),
        }
    }
}

impl SiteConfig {
    /// Load configuration with fallback chain: an explicit path must load;
    /// otherwise `<site_root>/fragkit.yml` is used when present; otherwise
    /// built-in defaults.
    pub fn load(site_root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        let local = site_root.join(CONFIG_FILE_NAME);
        if local.is_file() {
            return Self::load_from_file(&local);
        }
        debug!("[config] no {CONFIG_FILE_NAME} in {}; using defaults", site_root.display());
        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("[config] loaded {}", path.display());
        Ok(config)
    }

    /// Parse YAML text.  An empty document yields the defaults.
    pub fn parse(text: &str) -> Result<Self, serde_yml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yml::from_str(text)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Resolve where fragments come from, preferring `override_root`
    /// (from the command line) over the configured `template_root`.
    pub fn template_source(
        &self,
        site_root: &Path,
        override_root: Option<&str>,
    ) -> Result<TemplateSource, ConfigError> {
        match override_root.or(self.template_root.as_deref()) {
            Some(raw) => TemplateSource::parse(raw, site_root),
            None => Ok(TemplateSource::Dir(site_root.to_path_buf())),
        }
    }
}

/// Where fragment bodies are fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Dir(PathBuf),
    Http(Url),
}

impl TemplateSource {
    /// Interpret `raw` as an `http(s)://` base URL or a directory.  Relative
    /// directories are taken relative to `site_root`.
    pub fn parse(raw: &str, site_root: &Path) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::InvalidTemplates(raw.to_owned()));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            let url =
                Url::parse(raw).map_err(|_| ConfigError::InvalidTemplates(raw.to_owned()))?;
            return Ok(TemplateSource::Http(url));
        }
        if raw.contains("://") {
            return Err(ConfigError::InvalidTemplates(raw.to_owned()));
        }
        let path = Path::new(raw);
        if path.is_absolute() {
            Ok(TemplateSource::Dir(path.to_path_buf()))
        } else {
            Ok(TemplateSource::Dir(site_root.join(path)))
        }
    }

    pub fn build(&self, timeout: Duration) -> Result<Arc<dyn FragmentSource>, ConfigError> {
        match self {
            TemplateSource::Dir(root) => Ok(Arc::new(DirSource::new(root.clone()))),
            TemplateSource::Http(base) => HttpSource::new(base.clone(), timeout)
                .map(|source| Arc::new(source) as Arc<dyn FragmentSource>)
                .map_err(|e| ConfigError::HttpClient(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::document::InjectMode;

    #[test]
    fn empty_config_is_default() {
        assert_eq!(SiteConfig::parse("").unwrap(), SiteConfig::default());
        assert_eq!(SiteConfig::default().http_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn full_config_parses() {
        let yaml = r##"
template_root: shared
http_timeout_secs: 3
header:
  home_url: ../index.html
  hover_color: "#ff0000"
styles:
  additional_styles: ".note { color: red; }"
fragments:
  - name: sidebar
    target: sidebar-placeholder
    vars:
      active: concepts
  - name: partials/head.html
    target: head
    mode: append
"##;
        let config = SiteConfig::parse(yaml).unwrap();
        assert_eq!(config.template_root.as_deref(), Some("shared"));
        assert_eq!(config.http_timeout_secs, 3);
        assert_eq!(config.includes.header.home_url, "../index.html");
        assert_eq!(config.includes.header.hover_color, "#ff0000");
        assert_eq!(config.includes.header.about_url, "aboutme.html");
        assert_eq!(config.includes.styles.gradient_color_1, "#58508d");
        assert_eq!(config.includes.styles.additional_styles, ".note { color: red; }");
        assert_eq!(config.includes.fragments.len(), 2);
        assert_eq!(
            config.includes.fragments[0].variables.get("active").map(String::as_str),
            Some("concepts")
        );
        assert_eq!(config.includes.fragments[1].mode, InjectMode::Append);
    }

    #[test]
    fn load_falls_back_to_defaults_without_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SiteConfig::load(tmp.path(), None).unwrap();
        assert_eq!(config, SiteConfig::default());
    }

    #[test]
    fn load_reads_site_root_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE_NAME), "http_timeout_secs: 7\n").unwrap();
        let config = SiteConfig::load(tmp.path(), None).unwrap();
        assert_eq!(config.http_timeout_secs, 7);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.yml");
        let err = SiteConfig::load(tmp.path(), Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "header: [unterminated\n").unwrap();
        let err = SiteConfig::load(tmp.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn template_source_defaults_to_site_root() {
        let root = Path::new("/srv/site");
        let source = SiteConfig::default().template_source(root, None).unwrap();
        assert_eq!(source, TemplateSource::Dir(root.to_path_buf()));
    }

    #[test]
    fn template_source_override_wins() {
        let root = Path::new("/srv/site");
        let config = SiteConfig {
            template_root: Some("shared".to_owned()),
            ..SiteConfig::default()
        };
        assert_eq!(
            config.template_source(root, None).unwrap(),
            TemplateSource::Dir(root.join("shared"))
        );
        assert_eq!(
            config
                .template_source(root, Some("https://example.com/site"))
                .unwrap(),
            TemplateSource::Http(Url::parse("https://example.com/site").unwrap())
        );
    }

    #[test]
    fn template_source_rejects_other_schemes_and_empty() {
        let root = Path::new("/srv/site");
        assert!(TemplateSource::parse("ftp://example.com", root).is_err());
        assert!(TemplateSource::parse("   ", root).is_err());
    }

    #[test]
    fn absolute_directory_kept() {
        let root = Path::new("/srv/site");
        assert_eq!(
            TemplateSource::parse("/opt/templates", root).unwrap(),
            TemplateSource::Dir(PathBuf::from("/opt/templates"))
        );
    }
}
