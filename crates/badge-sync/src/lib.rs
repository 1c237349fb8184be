//! Scrape → reconcile → persist pipeline for the global badge snapshot.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use badge_adapters::{
    parse_badges, BrowserlessRenderer, HttpRenderer, PageFetcher, PageRenderer, RenderPath,
    BROWSER_USER_AGENT,
};
use badge_core::{
    BadgeCollection, BadgeKey, BadgeSet, BadgeVersion, ScrapedBadge, DEFAULT_OUTPUT_FILE,
    SOURCE_URL,
};
use badge_notify::{notifier_for, NoopNotifier, Notification, Notifier};
use badge_storage::{ArtifactStore, CollectionStore, HttpClientConfig, HttpFetcher, LinkProbe};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "badge-sync";

/// Share of persisted versions re-checked per run under `BADGE_REPAIR_POLICY=sampled`.
pub const DEFAULT_SAMPLE_RATIO: f64 = 0.1;

/// Which persisted versions get a link-health probe on each run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RepairPolicy {
    /// Probe every persisted version.
    #[default]
    Always,
    /// Probe each version with probability `ratio`; versions without a URL are always probed.
    Sampled { ratio: f64 },
    /// No repair pass.
    Off,
}

impl RepairPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" => Some(RepairPolicy::Always),
            "sampled" => Some(RepairPolicy::Sampled {
                ratio: DEFAULT_SAMPLE_RATIO,
            }),
            "off" | "none" => Some(RepairPolicy::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_url: String,
    pub output_path: PathBuf,
    pub webhook_url: Option<String>,
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
    pub artifacts_dir: Option<PathBuf>,
    pub repair_policy: RepairPolicy,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_url: SOURCE_URL.to_string(),
            output_path: PathBuf::from(DEFAULT_OUTPUT_FILE),
            webhook_url: None,
            browserless_url: None,
            browserless_token: None,
            artifacts_dir: None,
            repair_policy: RepairPolicy::Always,
            http_timeout_secs: 20,
        }
    }
}

fn non_blank_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let repair_policy = match non_blank_env("BADGE_REPAIR_POLICY") {
            Some(raw) => RepairPolicy::parse(&raw).unwrap_or_else(|| {
                warn!(value = raw.as_str(), "unknown BADGE_REPAIR_POLICY; using always");
                RepairPolicy::Always
            }),
            None => RepairPolicy::Always,
        };
        Self {
            webhook_url: non_blank_env("DISCORD_WEBHOOK"),
            browserless_url: non_blank_env("BROWSERLESS_URL"),
            browserless_token: non_blank_env("BROWSERLESS_TOKEN"),
            artifacts_dir: non_blank_env("BADGE_ARTIFACTS_DIR").map(PathBuf::from),
            repair_policy,
            http_timeout_secs: non_blank_env("BADGE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("scrape of {url} yielded no badge records; snapshot left untouched")]
    EmptyScrape {
        url: String,
        archived: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub changed: bool,
    pub checked: usize,
    pub broken: usize,
    pub repaired: usize,
    pub added_sets: usize,
    pub added_versions: usize,
}

/// Merges scraped records into the persisted collection. Never removes a
/// set or version; only appends and rewrites URLs.
pub struct Reconciler<'a> {
    probe: &'a dyn LinkProbe,
    notifier: &'a dyn Notifier,
    policy: RepairPolicy,
    rng: StdRng,
}

impl<'a> Reconciler<'a> {
    pub fn new(probe: &'a dyn LinkProbe, notifier: &'a dyn Notifier, policy: RepairPolicy) -> Self {
        Self {
            probe,
            notifier,
            policy,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn should_check(&mut self, version: &BadgeVersion) -> bool {
        match self.policy {
            RepairPolicy::Always => true,
            RepairPolicy::Off => false,
            RepairPolicy::Sampled { ratio } => {
                version.primary_url().trim().is_empty()
                    || self.rng.random_bool(ratio.clamp(0.0, 1.0))
            }
        }
    }

    pub async fn reconcile(
        &mut self,
        collection: &mut BadgeCollection,
        scraped: &[ScrapedBadge],
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let lookup: HashMap<BadgeKey, &ScrapedBadge> =
            scraped.iter().map(|b| (b.key(), b)).collect();
        let mut existing: HashSet<BadgeKey> = collection.keys();

        for set in collection.global.iter_mut() {
            for version in set.versions.iter_mut() {
                if !self.should_check(version) {
                    continue;
                }
                outcome.checked += 1;
                if !self.probe.is_broken(version.primary_url()).await {
                    continue;
                }
                outcome.broken += 1;

                let key = BadgeKey::new(set.set_id.clone(), version.id.clone());
                let Some(fresh) = lookup.get(&key) else {
                    warn!(badge = %key, url = version.primary_url(), "broken link with no scraped replacement");
                    continue;
                };
                let already_current = version.image_url_1x == fresh.url
                    && version.image_url_2x == fresh.url
                    && version.image_url_4x == fresh.url;
                if already_current {
                    debug!(badge = %key, "broken link already matches the scraped URL");
                    continue;
                }

                info!(badge = %key, from = version.primary_url(), to = fresh.url.as_str(), "repairing link");
                version.replace_urls(&fresh.url);
                outcome.repaired += 1;
                outcome.changed = true;
                self.notifier
                    .notify(&Notification::repaired(&key.set_id, &key.id, &fresh.url))
                    .await;
            }
        }

        for badge in scraped {
            let key = badge.key();
            if existing.contains(&key) {
                continue;
            }

            let version = BadgeVersion::with_url(badge.id.clone(), &badge.url);
            let notification = match collection.find_set_mut(&badge.set_id) {
                Some(set) => {
                    set.versions.push(version);
                    outcome.added_versions += 1;
                    info!(badge = %key, "new version");
                    Notification::new_version(&badge.set_id, &badge.id, &badge.url)
                }
                None => {
                    collection
                        .global
                        .push(BadgeSet::new(badge.set_id.clone(), version));
                    outcome.added_sets += 1;
                    info!(badge = %key, name = badge.name.as_str(), "new set");
                    Notification::new_set(&badge.name, &badge.url)
                }
            };
            existing.insert(key);
            outcome.changed = true;
            self.notifier.notify(&notification).await;
        }

        outcome
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub via: RenderPath,
    pub scraped: usize,
    pub outcome: ReconcileOutcome,
    pub saved: bool,
    pub dry_run: bool,
    pub output_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: CollectionStore,
    fetcher: PageFetcher,
    probe: Box<dyn LinkProbe>,
    notifier: Box<dyn Notifier>,
    archive: Option<ArtifactStore>,
    dry_run: bool,
    seed: Option<u64>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(BROWSER_USER_AGENT.to_string()),
            ..Default::default()
        })?;

        let fallback: Option<Box<dyn PageRenderer>> = match &config.browserless_url {
            Some(base_url) => Some(Box::new(BrowserlessRenderer::new(
                base_url,
                config.browserless_token.as_deref(),
            )?)),
            None => None,
        };
        let fetcher = PageFetcher::new(Box::new(HttpRenderer::new(http.clone())), fallback);
        let notifier = notifier_for(config.webhook_url.as_deref())?;

        Ok(Self::from_parts(config, fetcher, Box::new(http), notifier))
    }

    /// Assemble a pipeline from explicit collaborators.
    pub fn from_parts(
        config: SyncConfig,
        fetcher: PageFetcher,
        probe: Box<dyn LinkProbe>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let store = CollectionStore::new(config.output_path.clone());
        let archive = config.artifacts_dir.clone().map(ArtifactStore::new);
        Self {
            config,
            store,
            fetcher,
            probe,
            notifier,
            archive,
            dry_run: false,
            seed: None,
        }
    }

    /// Reconcile without writing the snapshot or sending notifications.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        if dry_run {
            self.notifier = Box::new(NoopNotifier);
        }
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let url = self.config.source_url.as_str();

        let page = self
            .fetcher
            .fetch(url)
            .await
            .with_context(|| format!("fetching {url}"))?;
        let scraped = parse_badges(&page.html).context("parsing listing page")?;
        info!(records = scraped.len(), via = ?page.via, "listing parsed");

        if scraped.is_empty() {
            let archived = self.archive_empty_page(page.fetched_at, &page.html).await;
            return Err(SyncError::EmptyScrape {
                url: url.to_string(),
                archived,
            }
            .into());
        }

        let mut collection = self.store.load().await;
        let mut reconciler = Reconciler::new(
            self.probe.as_ref(),
            self.notifier.as_ref(),
            self.config.repair_policy,
        );
        if let Some(seed) = self.seed {
            reconciler = reconciler.with_seed(seed);
        }
        let outcome = reconciler.reconcile(&mut collection, &scraped).await;

        let saved = if outcome.changed && !self.dry_run {
            self.store
                .save(&collection)
                .await
                .with_context(|| format!("saving {}", self.store.path().display()))?;
            info!("changes detected and saved");
            true
        } else {
            if outcome.changed {
                info!("changes detected; dry run, not saved");
            } else {
                info!("no changes found");
            }
            false
        };

        Ok(SyncRunSummary {
            started_at,
            finished_at: Utc::now(),
            via: page.via,
            scraped: scraped.len(),
            outcome,
            saved,
            dry_run: self.dry_run,
            output_path: self.store.path().display().to_string(),
        })
    }

    async fn archive_empty_page(&self, fetched_at: DateTime<Utc>, html: &str) -> Option<PathBuf> {
        let archive = self.archive.as_ref()?;
        match archive.archive_page(fetched_at, html).await {
            Ok(stored) => {
                warn!(path = %stored.absolute_path.display(), "empty scrape; raw page archived");
                Some(stored.absolute_path)
            }
            Err(err) => {
                warn!(error = %err, "empty scrape; archiving raw page failed");
                None
            }
        }
    }
}

pub async fn run_sync_once_from_env(dry_run: bool) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?.with_dry_run(dry_run);
    pipeline.run_once().await
}
