//! Listing page fetch strategies + badge parser for the global badges page.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use badge_core::{ScrapedBadge, BADGE_PATH_MARKER, CDN_HOST, DEFAULT_VERSION_ID};
use badge_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "badge-adapters";

/// Browser-like User-Agent sent with the primary page request.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Body marker of an anti-bot interstitial, matched case-insensitively.
const CHALLENGE_MARKER: &str = "cloudflare";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPath {
    Http,
    Browserless,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub html: String,
    pub via: RenderPath,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("anti-bot challenge served (status {status})")]
    Challenged { status: u16 },
    #[error("rendering service error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("rendering service network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("source page unavailable: {primary}")]
    Unavailable { primary: RenderError },
    #[error("source page unavailable: {primary}; fallback also failed: {fallback}")]
    FallbackFailed {
        primary: RenderError,
        fallback: RenderError,
    },
}

/// Capability: return the final HTML for a URL.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    fn path(&self) -> RenderPath;

    async fn render(&self, url: &str) -> Result<String, RenderError>;
}

/// A 403, or a body that mentions the challenge vendor and carries no badge
/// links. Pages that merely load the vendor's analytics still count as real.
pub fn looks_like_challenge(status: u16, body: &str) -> bool {
    status == 403
        || (body.to_ascii_lowercase().contains(CHALLENGE_MARKER)
            && !body.contains(BADGE_PATH_MARKER))
}

/// Plain GET through the shared HTTP client.
pub struct HttpRenderer {
    http: HttpFetcher,
}

impl HttpRenderer {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    fn path(&self) -> RenderPath {
        RenderPath::Http
    }

    async fn render(&self, url: &str) -> Result<String, RenderError> {
        let resp = self.http.fetch_page(url).await?;
        let status = resp.status.as_u16();
        if looks_like_challenge(status, &resp.body) {
            return Err(RenderError::Challenged { status });
        }
        if !resp.status.is_success() {
            return Err(FetchError::HttpStatus {
                status,
                url: resp.final_url,
            }
            .into());
        }
        Ok(resp.body)
    }
}

/// Headless-browser rendering through a Browserless-compatible `/content` API.
pub struct BrowserlessRenderer {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    wait_selector: String,
    settle: Duration,
}

impl BrowserlessRenderer {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .context("building browserless client")?;

        let mut endpoint =
            reqwest::Url::parse(&format!("{}/content", base_url.trim_end_matches('/')))
                .with_context(|| format!("parsing browserless url {base_url}"))?;
        {
            let mut query = endpoint.query_pairs_mut();
            query.append_pair("stealth", "true");
            if let Some(token) = token {
                query.append_pair("token", token);
            }
        }

        Ok(Self {
            client,
            endpoint,
            wait_selector: format!("a[href*=\"{BADGE_PATH_MARKER}\"]"),
            settle: Duration::from_secs(5),
        })
    }

    fn request_body(&self, url: &str) -> serde_json::Value {
        serde_json::json!({
            "url": url,
            "bestAttempt": true,
            "gotoOptions": { "waitUntil": "networkidle2", "timeout": 60000 },
            "waitForSelector": { "selector": self.wait_selector, "timeout": 60000 },
            "waitForTimeout": self.settle.as_millis() as u64,
        })
    }
}

#[async_trait]
impl PageRenderer for BrowserlessRenderer {
    fn path(&self) -> RenderPath {
        RenderPath::Browserless
    }

    async fn render(&self, url: &str) -> Result<String, RenderError> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(&self.request_body(url))
            .send()
            .await
            .map_err(|e| RenderError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(RenderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        resp.text()
            .await
            .map_err(|e| RenderError::Network(e.to_string()))
    }
}

/// Primary renderer with an optional fallback taken on any primary failure.
pub struct PageFetcher {
    primary: Box<dyn PageRenderer>,
    fallback: Option<Box<dyn PageRenderer>>,
}

impl PageFetcher {
    pub fn new(primary: Box<dyn PageRenderer>, fallback: Option<Box<dyn PageRenderer>>) -> Self {
        Self { primary, fallback }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, AdapterError> {
        let primary_err = match self.primary.render(url).await {
            Ok(html) => return Ok(self.page(url, html, self.primary.path())),
            Err(err) => err,
        };

        let Some(fallback) = &self.fallback else {
            warn!(url, error = %primary_err, "primary fetch failed and no fallback is configured");
            return Err(AdapterError::Unavailable {
                primary: primary_err,
            });
        };

        info!(url, error = %primary_err, via = ?fallback.path(), "primary fetch failed; trying fallback");
        match fallback.render(url).await {
            Ok(html) => Ok(self.page(url, html, fallback.path())),
            Err(fallback_err) => {
                warn!(url, error = %fallback_err, "fallback fetch failed");
                Err(AdapterError::FallbackFailed {
                    primary: primary_err,
                    fallback: fallback_err,
                })
            }
        }
    }

    fn page(&self, url: &str, html: String, via: RenderPath) -> FetchedPage {
        info!(url, ?via, bytes = html.len(), "listing page fetched");
        FetchedPage {
            url: url.to_string(),
            html,
            via,
            fetched_at: Utc::now(),
        }
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Path segments of a badge detail link, with scheme, host, query and
/// fragment removed and surrounding slashes trimmed.
fn link_segments(href: &str) -> Vec<String> {
    let href = href.trim();
    let path = if href.contains("://") || href.starts_with("//") {
        let absolute = if href.starts_with("//") {
            format!("https:{href}")
        } else {
            href.to_string()
        };
        match reqwest::Url::parse(&absolute) {
            Ok(url) => url.path().to_string(),
            Err(_) => return Vec::new(),
        }
    } else {
        href.split(['?', '#']).next().unwrap_or_default().to_string()
    };
    path.trim_matches('/')
        .split('/')
        .map(ToString::to_string)
        .collect()
}

/// Rewrite a CDN image URL to request the largest published size (`/3`).
pub fn normalize_cdn_url(src: &str) -> String {
    let rewritten = match src.rfind('/') {
        Some(idx) => {
            let tail = &src[idx + 1..];
            let digits = tail.strip_prefix('_').unwrap_or(tail);
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                format!("{}/3", &src[..idx])
            } else {
                src.to_string()
            }
        }
        None => src.to_string(),
    };
    if rewritten.ends_with("/3") {
        rewritten
    } else {
        format!("{}/3", rewritten.trim_end_matches('/'))
    }
}

fn badge_from_anchor(anchor: ElementRef<'_>, img_sel: &Selector) -> Option<ScrapedBadge> {
    let href = anchor.value().attr("href")?;
    let img = anchor.select(img_sel).next()?;

    let segments = link_segments(href);
    if segments.len() < 3 {
        return None;
    }
    let set_id = segments[2].clone();
    if set_id.is_empty() {
        return None;
    }
    let id = segments
        .get(3)
        .filter(|s| !s.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_VERSION_ID.to_string());

    let src = img.value().attr("src")?.trim();
    if !src.contains(CDN_HOST) {
        return None;
    }

    let name = img
        .value()
        .attr("alt")
        .and_then(text_or_none)
        .unwrap_or_else(|| set_id.clone());

    Some(ScrapedBadge {
        set_id,
        id,
        name,
        url: normalize_cdn_url(src),
    })
}

/// Extract badge records in document order. Duplicates are kept; the
/// reconciler is responsible for collapsing them.
pub fn parse_badges(html: &str) -> Result<Vec<ScrapedBadge>, AdapterError> {
    let document = Html::parse_document(html);
    let anchor_sel = selector(&format!("a[href*=\"{BADGE_PATH_MARKER}\"]"))?;
    let img_sel = selector("img")?;

    Ok(document
        .select(&anchor_sel)
        .filter_map(|anchor| badge_from_anchor(anchor, &img_sel))
        .collect())
}

pub fn parse_badges_from_file(path: impl AsRef<Path>) -> Result<Vec<ScrapedBadge>> {
    let path = path.as_ref();
    let html = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_badges(&html).with_context(|| format!("parsing {}", path.display()))
}
