//! Source identity resolution and the fetch collaborator contract.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use revsync_core::{FetchParams, SourceKey};
use revsync_storage::sha256_hex;
use thiserror::Error;
use tracing::{debug, info};
use url::{Position, Url};

pub const CRATE_NAME: &str = "revsync-adapters";

pub const GENERIC_SPIDER: &str = "generic";

/// Site families with a known product-id shape. Order matters: the first
/// family whose host label matches is the only one consulted, and within a
/// family the first matching pattern wins.
const SITE_PATTERNS: &[(&str, &[&str])] = &[
    ("amazon", &[r"/(?:dp|gp/product|asin)/([A-Z0-9]{10})(?:[/?]|$)"]),
    ("bestbuy", &[r"[?&]skuId=(\d+)", r"/(\d{6,8})\.p(?:[/?]|$)"]),
    ("walmart", &[r"/ip/(?:[^/?]+/)?(\d+)(?:[/?]|$)"]),
    ("target", &[r"/-/A-(\d+)(?:[/?#]|$)"]),
    ("ebay", &[r"/itm/(?:[^/?]+/)?(\d+)(?:[/?]|$)"]),
    ("etsy", &[r"/listing/(\d+)(?:[/?]|$)"]),
    ("aliexpress", &[r"/item/(?:[^/?]+/)?(\d+)\.html", r"/item/(\d+)(?:[/?]|$)"]),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid source url {url:?}: {reason}")]
    InvalidSource { url: String, reason: String },
}

#[derive(Debug, Clone)]
struct SiteMatcher {
    spider: &'static str,
    patterns: Vec<Regex>,
}

/// A URL resolved to its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub key: SourceKey,
    /// Host without leading `www.`, `m.`, `mobile.` or `smile.` labels.
    pub domain: String,
    pub product_id: Option<String>,
    /// Spider that knows this site, or [`GENERIC_SPIDER`].
    pub spider: String,
    /// URL with fragment dropped and alias subdomains stripped; input to the fallback hash.
    pub normalized_url: String,
}

/// Derives stable [`SourceKey`]s from product URLs.
#[derive(Debug, Clone)]
pub struct SourceIdentity {
    sites: Vec<SiteMatcher>,
}

impl Default for SourceIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceIdentity {
    pub fn new() -> Self {
        let sites = SITE_PATTERNS
            .iter()
            .map(|&(spider, patterns)| SiteMatcher {
                spider,
                patterns: patterns
                    .iter()
                    .map(|p| Regex::new(p).expect("static pattern is valid"))
                    .collect(),
            })
            .collect();
        Self { sites }
    }

    pub fn key_for(&self, url: &str) -> Result<SourceKey, IdentityError> {
        self.resolve(url).map(|r| r.key)
    }

    /// `domain_productId` when a site pattern extracts an id, otherwise the
    /// SHA-256 hex of the normalized URL.
    pub fn resolve(&self, url: &str) -> Result<ResolvedSource, IdentityError> {
        let invalid = |reason: &str| IdentityError::InvalidSource {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let mut parsed = Url::parse(url.trim()).map_err(|e| invalid(&e.to_string()))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("no host"))?
            .to_ascii_lowercase();
        let domain = site_domain(&host).to_string();

        parsed.set_fragment(None);
        if domain != host {
            parsed
                .set_host(Some(&domain))
                .map_err(|e| invalid(&e.to_string()))?;
        }

        let site = self
            .sites
            .iter()
            .find(|site| domain.split('.').any(|label| label == site.spider));
        let locator = &parsed[Position::BeforePath..Position::AfterQuery];
        let product_id = site.and_then(|site| {
            site.patterns
                .iter()
                .find_map(|p| p.captures(locator).map(|c| c[1].to_string()))
        });

        let normalized_url = parsed.to_string();
        let key = match &product_id {
            Some(id) => SourceKey::new(format!("{domain}_{id}")),
            None => SourceKey::new(sha256_hex(normalized_url.as_bytes())),
        };

        Ok(ResolvedSource {
            key,
            domain,
            product_id,
            spider: site.map_or(GENERIC_SPIDER, |s| s.spider).to_string(),
            normalized_url,
        })
    }
}

/// Host labels that front the same catalogue as the bare domain.
const ALIAS_SUBDOMAINS: &[&str] = &["www", "m", "mobile", "smile"];

/// `host` without leading alias labels, keeping at least two labels.
fn site_domain(host: &str) -> &str {
    let mut domain = host;
    while let Some((label, rest)) = domain.split_once('.') {
        if !ALIAS_SUBDOMAINS.contains(&label) || !rest.contains('.') {
            break;
        }
        domain = rest;
    }
    domain
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("launching fetch program {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("fetch program {program} failed ({status}): {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("fetch produced no output at {}", path.display())]
    MissingOutput { path: PathBuf },
    #[error("replaying {}: {source}", path.display())]
    Replay { path: PathBuf, source: io::Error },
}

/// One fetch handed to the collaborator. On success a dataset file exists at
/// `output_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub spider: String,
    pub params: FetchParams,
    pub max_reviews: Option<usize>,
    pub output_path: PathBuf,
}

impl FetchRequest {
    /// `name=value` crawl arguments, incremental bounds only when set.
    pub fn crawl_arguments(&self) -> Vec<String> {
        let mut args = vec![
            format!("url={}", self.url),
            format!("output={}", self.output_path.display()),
        ];
        if let Some(date) = self.params.since_date {
            args.push(format!("since_date={}", date.format("%Y-%m-%d")));
        }
        if let Some(id) = &self.params.since_id {
            args.push(format!("since_id={id}"));
        }
        if let Some(max) = self.max_reviews {
            args.push(format!("max_reviews={max}"));
        }
        args
    }
}

/// The external fetch collaborator. Timeouts are the collaborator's concern.
#[async_trait]
pub trait ReviewFetcher: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError>;
}

/// Runs a crawl program (`scrapy` by default) as a child process:
/// `<program> crawl <spider> -a url=... -a output=... [-a since_date=...]`.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    program: String,
    project_dir: Option<PathBuf>,
}

impl CommandFetcher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            project_dir: None,
        }
    }

    pub fn with_project_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.project_dir = dir;
        self
    }

    pub fn command_args(&self, request: &FetchRequest) -> Vec<String> {
        let mut args = vec!["crawl".to_string(), request.spider.clone()];
        for arg in request.crawl_arguments() {
            args.push("-a".to_string());
            args.push(arg);
        }
        args
    }
}

#[async_trait]
impl ReviewFetcher for CommandFetcher {
    fn name(&self) -> &str {
        &self.program
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
        let args = self.command_args(request);
        info!(program = %self.program, args = %args.join(" "), "running fetch program");

        let mut command = tokio::process::Command::new(&self.program);
        command.args(&args).stdin(Stdio::null());
        if let Some(dir) = &self.project_dir {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|source| FetchError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        debug!(
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "fetch program finished"
        );

        if !output.status.success() {
            return Err(FetchError::Exit {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    const KEEP: usize = 2048;
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    match text.char_indices().rev().nth(KEEP) {
        Some((idx, _)) => format!("...{}", &text[idx..]),
        None => text.to_string(),
    }
}

/// Replays an already-fetched dataset file as the fetch output.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    source: PathBuf,
}

impl FileFetcher {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[async_trait]
impl ReviewFetcher for FileFetcher {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<(), FetchError> {
        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FetchError::Replay {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::copy(&self.source, &request.output_path)
            .await
            .map_err(|source| FetchError::Replay {
                path: self.source.clone(),
                source,
            })?;
        debug!(source = %self.source.display(), "replayed dataset file");
        Ok(())
    }
}
