use std::{
    fs, io,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use fragkit::composer::{CompositionRequest, FragmentComposer};
use fragkit::config::SiteConfig;
use fragkit::document::HtmlDocument;
use fragkit::template::{self, Variables};
use fragkit::{serve, site};

#[derive(Parser)]
#[command(
    name = "fragkit",
    version,
    about = "Compose shared HTML fragments into static site pages",
    after_help = "INVOCATION FORMS:\n  fragkit compose [OPTIONS] <page>        Compose one page and print it\n  fragkit build [OPTIONS] <root> --out D  Compose a whole site into D\n  fragkit serve [OPTIONS] <root>          Serve a site, composing pages per request"
)]
struct Cli {
    /// Log at debug level (RUST_LOG still applies when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand that composes pages.
#[derive(Args)]
struct SourceArgs {
    /// Path to a fragkit.yml (default: <site root>/fragkit.yml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory or http(s) base URL that templates/<name>.html resolves against
    #[arg(long)]
    template_root: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compose a single page
    Compose {
        /// Path to the HTML page
        page: PathBuf,
        #[command(flatten)]
        source: SourceArgs,
        /// Extra fragment to compose, as NAME=TARGET (repeatable)
        #[arg(long = "fragment", value_parser = parse_pair)]
        fragments: Vec<(String, String)>,
        /// Variable for the extra fragments, as KEY=VALUE (repeatable)
        #[arg(long = "var", value_parser = parse_pair)]
        vars: Vec<(String, String)>,
        /// Write the composed page here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Exit with an error when any fragment fails to load
        #[arg(long)]
        strict: bool,
    },
    /// Compose every page under a site root into an output directory
    Build {
        /// Site root directory
        root: PathBuf,
        /// Output directory
        #[arg(long)]
        out: PathBuf,
        #[command(flatten)]
        source: SourceArgs,
        /// Remove the output directory before building
        #[arg(long)]
        clean: bool,
        /// Print the build summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve a site over HTTP, composing pages on request
    ///
    /// Fragments are cached for the life of the server, so edits under
    /// templates/ show up after a restart unless --no-cache is given.
    Serve {
        /// Site root directory
        #[arg(default_value = ".")]
        root: PathBuf,
        #[command(flatten)]
        source: SourceArgs,
        /// Interface address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Starting port number for the HTTP server
        #[arg(long, default_value = "4000")]
        port: u16,
        /// Reload fragments on every request instead of caching them
        #[arg(long)]
        no_cache: bool,
    },
}

/// Parse a `LEFT=RIGHT` command-line pair.  The right side may be empty.
fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((left, right)) if !left.is_empty() => Ok((left.to_owned(), right.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.format_timestamp(None).init();
}

fn other_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Load config for `site_root` and build a composer over the selected source.
fn prepare(site_root: &Path, args: &SourceArgs) -> io::Result<(SiteConfig, FragmentComposer)> {
    let config = SiteConfig::load(site_root, args.config.as_deref()).map_err(other_error)?;
    let source = config
        .template_source(site_root, args.template_root.as_deref())
        .and_then(|s| s.build(config.http_timeout()))
        .map_err(other_error)?;
    info!("[config] templates={}", source.describe());
    Ok((config, FragmentComposer::new(source)))
}

fn main() -> io::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = match cli.command {
        Commands::Compose {
            page,
            source,
            fragments,
            vars,
            output,
            strict,
        } => rt.block_on(run_compose(page, source, fragments, vars, output, strict)),
        Commands::Build {
            root,
            out,
            source,
            clean,
            json,
        } => rt.block_on(run_build(root, out, source, clean, json)),
        Commands::Serve {
            root,
            source,
            bind,
            port,
            no_cache,
        } => prepare(&root, &source).and_then(|(config, composer)| {
            rt.block_on(serve::run_serve(
                root,
                bind,
                port,
                composer,
                config.includes,
                no_cache,
            ))
        }),
    };

    if let Err(ref e) = result {
        eprintln!("Error: {e}");
    }
    result
}

async fn run_compose(
    page: PathBuf,
    source: SourceArgs,
    fragments: Vec<(String, String)>,
    vars: Vec<(String, String)>,
    output: Option<PathBuf>,
    strict: bool,
) -> io::Result<()> {
    let html = fs::read_to_string(&page)
        .map_err(|e| io::Error::new(e.kind(), format!("reading {}: {e}", page.display())))?;
    let site_root = page
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let (config, composer) = prepare(&site_root, &source)?;

    let variables: Variables = vars.into_iter().collect();
    for key in variables.keys().filter(|k| !template::is_identifier(k)) {
        warn!("[compose] var={key} is not a placeholder identifier and will never match");
    }
    let mut includes = config.includes;
    includes
        .fragments
        .extend(fragments.into_iter().map(|(name, target)| {
            CompositionRequest::new(name, target).with_variables(variables.clone())
        }));

    let mut doc = HtmlDocument::new(html);
    let report = includes.apply(&composer, &mut doc).await;
    info!(
        "[compose] page={} composed={} skipped={} failed={}",
        page.display(),
        report.composed.len(),
        report.skipped.len(),
        report.failed.len()
    );

    match output {
        Some(path) => fs::write(&path, doc.as_str())?,
        None => print!("{}", doc.as_str()),
    }

    if strict && !report.failed.is_empty() {
        return Err(other_error(format!(
            "{} fragment(s) failed to load",
            report.failed.len()
        )));
    }
    Ok(())
}

async fn run_build(
    root: PathBuf,
    out: PathBuf,
    source: SourceArgs,
    clean: bool,
    json: bool,
) -> io::Result<()> {
    let (config, composer) = prepare(&root, &source)?;
    let summary = site::build_site(&root, &out, clean, &composer, &config.includes)
        .await
        .map_err(other_error)?;

    if json {
        let text = serde_json::to_string_pretty(&summary).map_err(other_error)?;
        println!("{text}");
    } else {
        println!(
            "built pages={} copied={} fragment_errors={}",
            summary.pages, summary.copied, summary.fragment_errors
        );
        for page in &summary.degraded_pages {
            println!("degraded: {page}");
        }
    }
    Ok(())
}
