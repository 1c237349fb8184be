//! Snapshot persistence, raw page archive and HTTP utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use badge_core::{BadgeCollection, SOURCE_ID};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "badge-storage";

async fn write_and_sync(file: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Write `bytes` to a temp file next to `target`, then rename it into place.
async fn write_atomically(target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = write_and_sync(&mut file, bytes).await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                target.display()
            )
        });
    }
    Ok(())
}

/// Loads and saves the `{"global": [...]}` snapshot file.
#[derive(Debug, Clone)]
pub struct CollectionStore {
    path: PathBuf,
}

impl CollectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing, unreadable or malformed file yields an
    /// empty collection; this never fails the run.
    pub async fn load(&self) -> BadgeCollection {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no snapshot yet; starting empty");
                return BadgeCollection::default();
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unreadable snapshot; starting empty");
                return BadgeCollection::default();
            }
        };

        match serde_json::from_str::<BadgeCollection>(&text) {
            Ok(collection) => {
                debug!(
                    path = %self.path.display(),
                    sets = collection.global.len(),
                    versions = collection.version_count(),
                    "loaded snapshot"
                );
                collection
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "malformed snapshot; starting empty");
                BadgeCollection::default()
            }
        }
    }

    /// Four-space indented JSON with non-ASCII left as-is.
    pub fn render(collection: &BadgeCollection) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        collection
            .serialize(&mut ser)
            .context("serializing badge snapshot")?;
        Ok(out)
    }

    pub async fn save(&self, collection: &BadgeCollection) -> anyhow::Result<()> {
        let bytes = Self::render(collection)?;
        write_atomically(&self.path, &bytes).await?;
        info!(path = %self.path.display(), bytes = bytes.len(), "snapshot written");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw listing pages kept for post-mortems.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn page_relative_path(&self, fetched_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(SOURCE_ID)
            .join(format!("{content_hash}.html"))
    }

    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        html: &str,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = html.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomically(&absolute_path, bytes).await?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            probe_timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Answers whether an image URL is still reachable.
#[async_trait]
pub trait LinkProbe: Send + Sync {
    /// `true` when the URL should be treated as broken. Errors count as broken.
    async fn is_broken(&self, url: &str) -> bool;
}

/// Explicitly constructed HTTP client shared by the page fetch and link probes.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            probe_timeout: config.probe_timeout,
        })
    }

    /// GET `url` and return the body whatever the status; callers decide what
    /// a non-success response means.
    pub async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.text().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "page fetched");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl LinkProbe for HttpFetcher {
    async fn is_broken(&self, url: &str) -> bool {
        if url.trim().is_empty() {
            return true;
        }
        match self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => false,
            Ok(resp) => {
                debug!(url, status = resp.status().as_u16(), "link probe non-success");
                true
            }
            Err(err) => {
                debug!(url, error = %err, "link probe failed");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use badge_core::{BadgeSet, BadgeVersion};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves every connection a bodiless response with `status`.
    async fn serve_status(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => read += n,
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/badges/v1/abc/3")
    }

    fn sample_collection() -> BadgeCollection {
        let mut collection = BadgeCollection::default();
        collection.global.push(BadgeSet::new(
            "glhf-pledge",
            BadgeVersion::with_url("1", "https://static-cdn.jtvnw.net/badges/v1/3158e758/3"),
        ));
        collection
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn missing_snapshot_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = CollectionStore::new(dir.path().join("global-badges.json"));
        assert_eq!(store.load().await, BadgeCollection::default());
    }

    #[tokio::test]
    async fn malformed_snapshot_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("global-badges.json");
        std::fs::write(&path, "{\"global\": [ this is not json").unwrap();
        let store = CollectionStore::new(&path);
        assert!(store.load().await.global.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_preserves_collection() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("global-badges.json");
        let store = CollectionStore::new(&path);
        let collection = sample_collection();

        store.save(&collection).await.expect("save");
        assert_eq!(store.load().await, collection);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn render_uses_four_space_indent_and_keeps_unicode() {
        let mut collection = sample_collection();
        collection.global[0]
            .extra
            .insert("title".into(), serde_json::Value::from("Glück"));
        let text = String::from_utf8(CollectionStore::render(&collection).unwrap()).unwrap();
        assert!(text.starts_with("{\n    \"global\": [\n        {\n            \"set_id\""));
        assert!(text.contains("Glück"));
        assert!(!text.ends_with('\n'));
    }

    #[tokio::test]
    async fn archived_pages_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .archive_page(fetched_at, "<html>challenge</html>")
            .await
            .expect("first archive");
        let second = store
            .archive_page(fetched_at, "<html>challenge</html>")
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("20260224_120000").join(SOURCE_ID)));
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn empty_url_is_broken_without_a_request() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        assert!(fetcher.is_broken("").await);
        assert!(fetcher.is_broken("   ").await);
    }

    #[tokio::test]
    async fn healthy_link_is_not_broken() {
        let url = serve_status(200).await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        assert!(!fetcher.is_broken(&url).await);
    }

    #[tokio::test]
    async fn non_success_status_is_broken() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        for status in [404, 500] {
            let url = serve_status(status).await;
            assert!(fetcher.is_broken(&url).await, "status {status}");
        }
    }

    #[tokio::test]
    async fn refused_connection_is_broken() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            probe_timeout: Duration::from_secs(2),
            ..HttpClientConfig::default()
        })
        .expect("client");
        assert!(fetcher.is_broken("http://127.0.0.1:1/badges/v1/abc/3").await);
    }
}
