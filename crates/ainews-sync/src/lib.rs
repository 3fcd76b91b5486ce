//! Collection run orchestration, multi-copy store synchronization and store maintenance.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ainews_adapters::{
    decode_entities, default_category_rules, Categorizer, CategoryRule, FeedClient, FeedFetcher,
    FeedOutcome, InsightExtractor, RelevanceFilter, DEFAULT_FALLBACK_CATEGORY, DEFAULT_FEEDS,
    DEFAULT_KEYWORDS, DEFAULT_RESEARCH_TERMS,
};
use ainews_core::{
    sort_articles_newest_first, try_parse_article_date, Article, CandidateItem, SourceType,
};
use ainews_storage::{
    dedupe_by_url, encode_articles, sha256_hex, CsvStore, DedupLedger, HttpClientConfig,
    HttpFetcher, LastUpdateMarker,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ainews-sync";

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub data_dir: PathBuf,
    pub feeds: Vec<String>,
    pub max_articles_per_source: usize,
    pub feed_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub keywords: Vec<String>,
    pub categories: Vec<CategoryRule>,
    pub fallback_category: String,
    pub research_terms: Vec<String>,
    pub primary_csv: PathBuf,
    pub mirror_csvs: Vec<PathBuf>,
    pub ledger_path: PathBuf,
    pub marker_path: PathBuf,
    pub sync_after_collect: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        let owned = |list: &[&str]| list.iter().map(ToString::to_string).collect::<Vec<_>>();
        Self {
            data_dir: PathBuf::from("."),
            feeds: owned(DEFAULT_FEEDS),
            max_articles_per_source: 5,
            feed_delay: Duration::from_secs(2),
            http_timeout_secs: 20,
            user_agent: "ainews-collector/0.1".to_string(),
            keywords: owned(DEFAULT_KEYWORDS),
            categories: default_category_rules(),
            fallback_category: DEFAULT_FALLBACK_CATEGORY.to_string(),
            research_terms: owned(DEFAULT_RESEARCH_TERMS),
            primary_csv: PathBuf::from("ai_news.csv"),
            mirror_csvs: vec![
                PathBuf::from("docs/data/ai_news.csv"),
                PathBuf::from("web_app/data/ai_news.csv"),
            ],
            ledger_path: PathBuf::from("article_history.txt"),
            marker_path: PathBuf::from("last_update.json"),
            sync_after_collect: true,
        }
    }
}

/// Optional overrides read from a YAML file. Absent keys keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub data_dir: Option<PathBuf>,
    pub feeds: Option<Vec<String>>,
    pub max_articles_per_source: Option<usize>,
    pub feed_delay_ms: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub categories: Option<Vec<CategoryRule>>,
    pub fallback_category: Option<String>,
    pub research_terms: Option<Vec<String>>,
    pub primary_csv: Option<PathBuf>,
    pub mirror_csvs: Option<Vec<PathBuf>>,
    pub ledger_path: Option<PathBuf>,
    pub marker_path: Option<PathBuf>,
    pub sync_after_collect: Option<bool>,
}

impl CollectorConfig {
    /// Defaults, then the YAML file named by `AINEWS_CONFIG`, then `AINEWS_*` variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("AINEWS_CONFIG") {
            config = config.with_file(Path::new(&path))?;
        }
        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_file(self, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: ConfigFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(self.with_config_file(file))
    }

    pub fn with_config_file(mut self, file: ConfigFile) -> Self {
        if let Some(value) = file.data_dir {
            self.data_dir = value;
        }
        if let Some(value) = file.feeds {
            self.feeds = value;
        }
        if let Some(value) = file.max_articles_per_source {
            self.max_articles_per_source = value;
        }
        if let Some(value) = file.http_timeout_secs {
            self.http_timeout_secs = value;
        }
        if let Some(value) = file.user_agent {
            self.user_agent = value;
        }
        if let Some(value) = file.keywords {
            self.keywords = value;
        }
        if let Some(value) = file.categories {
            self.categories = value;
        }
        if let Some(value) = file.fallback_category {
            self.fallback_category = value;
        }
        if let Some(value) = file.research_terms {
            self.research_terms = value;
        }
        if let Some(value) = file.primary_csv {
            self.primary_csv = value;
        }
        if let Some(value) = file.mirror_csvs {
            self.mirror_csvs = value;
        }
        if let Some(value) = file.ledger_path {
            self.ledger_path = value;
        }
        if let Some(value) = file.marker_path {
            self.marker_path = value;
        }
        if let Some(value) = file.sync_after_collect {
            self.sync_after_collect = value;
        }
        if let Some(ms) = file.feed_delay_ms {
            self.feed_delay = Duration::from_millis(ms);
        }
        self
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(dir) = lookup("AINEWS_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("AINEWS_MAX_PER_SOURCE") {
            self.max_articles_per_source = v
                .parse()
                .with_context(|| format!("AINEWS_MAX_PER_SOURCE={v} is not a count"))?;
        }
        if let Some(v) = lookup("AINEWS_FEED_DELAY_MS") {
            let ms: u64 = v
                .parse()
                .with_context(|| format!("AINEWS_FEED_DELAY_MS={v} is not a number"))?;
            self.feed_delay = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("AINEWS_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v
                .parse()
                .with_context(|| format!("AINEWS_HTTP_TIMEOUT_SECS={v} is not a number"))?;
        }
        if let Some(agent) = lookup("AINEWS_USER_AGENT") {
            self.user_agent = agent;
        }
        Ok(self)
    }

    /// Absolute paths stay as they are; relative ones hang off `data_dir`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    /// Primary store first, then mirrors, without repeats.
    pub fn store_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for path in std::iter::once(&self.primary_csv).chain(self.mirror_csvs.iter()) {
            let resolved = self.resolve(path);
            if !paths.contains(&resolved) {
                paths.push(resolved);
            }
        }
        paths
    }

    pub fn relevance_filter(&self) -> RelevanceFilter {
        RelevanceFilter::new(self.keywords.clone())
    }

    pub fn categorizer(&self) -> Categorizer {
        Categorizer::new(self.categories.clone(), self.fallback_category.clone())
    }

    pub fn insight_extractor(&self) -> InsightExtractor {
        InsightExtractor::new(self.research_terms.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Fetched,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub url: String,
    pub status: FeedStatus,
    pub candidates: usize,
    pub accepted: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds_attempted: usize,
    pub feeds_failed: usize,
    pub new_articles: usize,
    pub duplicates_skipped: usize,
    pub stored_articles: usize,
    pub feeds: Vec<FeedReport>,
    pub sync: Option<SyncReport>,
}

/// Fetch → filter → categorize → merge → ledger, one feed at a time.
pub struct CollectPipeline {
    config: CollectorConfig,
    fetcher: FeedFetcher,
    categorizer: Categorizer,
    insights: InsightExtractor,
}

impl CollectPipeline {
    pub fn new(config: CollectorConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self::with_client(config, Arc::new(http)))
    }

    pub fn with_client(config: CollectorConfig, client: Arc<dyn FeedClient>) -> Self {
        let fetcher = FeedFetcher::new(client, config.relevance_filter());
        let categorizer = config.categorizer();
        let insights = config.insight_extractor();
        Self {
            config,
            fetcher,
            categorizer,
            insights,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<CollectRunSummary> {
        self.run_at(Local::now().naive_local()).await
    }

    /// One collection pass with `now` as the local wall-clock time.
    pub async fn run_at(&self, now: NaiveDateTime) -> Result<CollectRunSummary> {
        let run_id = Uuid::new_v4();
        self.collect(run_id, now)
            .instrument(info_span!("collect_run", %run_id))
            .await
    }

    fn build_article(&self, item: &CandidateItem) -> Article {
        let source_type = SourceType::from_domain(&item.source_domain);
        let category = self.categorizer.categorize_item(item);
        let insights = if source_type.is_research() {
            self.insights.extract(&item.description)
        } else {
            String::new()
        };
        Article::from_candidate(item, category, source_type, insights)
    }

    async fn collect(&self, run_id: Uuid, now: NaiveDateTime) -> Result<CollectRunSummary> {
        let started_at = Utc::now();
        let today = now.date();
        info!(feeds = self.config.feeds.len(), "starting news collection");

        let ledger = DedupLedger::open(self.config.resolve(&self.config.ledger_path)).await?;
        let primary = CsvStore::new(self.config.resolve(&self.config.primary_csv));
        let mut accepted_this_run: HashSet<String> = HashSet::new();
        let mut new_articles = 0usize;
        let mut stored_articles = None;
        let mut duplicates_skipped = 0usize;
        let mut feeds = Vec::with_capacity(self.config.feeds.len());

        for (index, feed_url) in self.config.feeds.iter().enumerate() {
            if index > 0 && !self.config.feed_delay.is_zero() {
                tokio::time::sleep(self.config.feed_delay).await;
            }

            let outcome = self
                .fetcher
                .fetch_outcome(feed_url, self.config.max_articles_per_source, today)
                .await;

            let mut batch = Vec::new();
            for item in outcome.items() {
                if ledger.contains(&item.link) || !accepted_this_run.insert(item.link.clone()) {
                    duplicates_skipped += 1;
                    continue;
                }
                batch.push(self.build_article(item));
            }

            // A url only enters the ledger once its row is in the primary store.
            if !batch.is_empty() {
                let merge = primary.merge(&batch).await.with_context(|| {
                    format!("merging into primary store {}", primary.path().display())
                })?;
                stored_articles = Some(merge.total);
                for article in &batch {
                    if let Err(err) = ledger.record(&article.url).await {
                        error!(url = %article.url, error = %err, "failed to append to dedup ledger");
                    }
                }
            }
            new_articles += batch.len();

            feeds.push(match &outcome {
                FeedOutcome::Fetched { items } => FeedReport {
                    url: feed_url.clone(),
                    status: FeedStatus::Fetched,
                    candidates: items.len(),
                    accepted: batch.len(),
                    error: None,
                },
                FeedOutcome::Failed { reason } => FeedReport {
                    url: feed_url.clone(),
                    status: FeedStatus::Failed,
                    candidates: 0,
                    accepted: 0,
                    error: Some(reason.clone()),
                },
            });
        }

        let stored_articles = match stored_articles {
            Some(total) => total,
            None => {
                primary
                    .merge(&[])
                    .await
                    .with_context(|| {
                        format!("merging into primary store {}", primary.path().display())
                    })?
                    .total
            }
        };

        let marker_path = self.config.resolve(&self.config.marker_path);
        if let Err(err) = LastUpdateMarker::at(now).write(&marker_path).await {
            error!(path = %marker_path.display(), error = %err, "failed to write last update marker");
        }

        let sync = if self.config.sync_after_collect {
            match Synchronizer::new(self.config.store_paths()).synchronize().await {
                Ok(report) => Some(report),
                Err(err) => {
                    error!(error = %err, "synchronizing store copies failed");
                    None
                }
            }
        } else {
            None
        };

        let feeds_failed = feeds
            .iter()
            .filter(|f| f.status == FeedStatus::Failed)
            .count();
        info!(
            new_articles,
            feeds_failed,
            stored = stored_articles,
            "news collection finished"
        );

        Ok(CollectRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feeds_attempted: feeds.len(),
            feeds_failed,
            new_articles,
            duplicates_skipped,
            stored_articles,
            feeds,
            sync,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CopySyncResult {
    pub path: String,
    pub rows_before: usize,
    pub written: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub articles: usize,
    /// SHA-256 of the bytes written to every copy.
    pub digest: Option<String>,
    pub copies: Vec<CopySyncResult>,
}

impl SyncReport {
    pub fn converged(&self) -> bool {
        self.copies.iter().all(|c| c.written)
    }
}

/// Rewrites every configured copy with the date-sorted union of all copies.
///
/// When copies disagree about the row for a url, the copy listed first wins.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    paths: Vec<PathBuf>,
}

impl Synchronizer {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub async fn synchronize(&self) -> Result<SyncReport> {
        info!(copies = self.paths.len(), "starting csv synchronization");
        let mut union = Vec::new();
        // Per copy: row count, or the read error that keeps it from being rewritten.
        let mut reads: Vec<Result<usize, String>> = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            match CsvStore::new(path).read_articles().await {
                Ok(rows) => {
                    reads.push(Ok(rows.len()));
                    union.extend(rows);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "leaving unreadable copy untouched");
                    reads.push(Err(format!("{err:#}")));
                }
            }
        }

        let mut merged = dedupe_by_url(union);
        if merged.is_empty() {
            warn!("no articles found in any copy; nothing to synchronize");
            return Ok(SyncReport {
                articles: 0,
                digest: None,
                copies: Vec::new(),
            });
        }
        sort_articles_newest_first(&mut merged);
        let bytes = encode_articles(&merged)?;
        let digest = sha256_hex(&bytes);

        let mut copies = Vec::with_capacity(self.paths.len());
        for (path, read) in self.paths.iter().zip(reads) {
            let rows_before = match read {
                Ok(rows) => rows,
                Err(reason) => {
                    copies.push(CopySyncResult {
                        path: path.display().to_string(),
                        rows_before: 0,
                        written: false,
                        error: Some(format!("not rewritten, read failed: {reason}")),
                    });
                    continue;
                }
            };
            let result = CsvStore::new(path).write_encoded(&bytes).await;
            if let Err(err) = &result {
                error!(path = %path.display(), error = %err, "failed to update copy");
            }
            copies.push(CopySyncResult {
                path: path.display().to_string(),
                rows_before,
                written: result.is_ok(),
                error: result.err().map(|e| format!("{e:#}")),
            });
        }

        info!(articles = merged.len(), %digest, "csv synchronization finished");
        Ok(SyncReport {
            articles: merged.len(),
            digest: Some(digest),
            copies,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityRepair {
    pub path: String,
    pub fields_fixed: usize,
}

fn repair_field(value: &str) -> Option<String> {
    if !value.contains('&') {
        return None;
    }
    let decoded = decode_entities(value);
    (decoded != value).then_some(decoded)
}

/// Decode entities left in titles and descriptions by older writers.
///
/// Works on raw records, so every row (duplicates and rows the article reader would
/// skip included) is written back in its original order.
pub async fn repair_entities(paths: &[PathBuf]) -> Result<Vec<EntityRepair>> {
    let mut repairs = Vec::new();
    for path in paths {
        let store = CsvStore::new(path);
        if !store.exists().await? {
            continue;
        }
        let fields_fixed = store
            .rewrite_columns(&["title", "description"], repair_field)
            .await?;
        info!(path = %path.display(), fields_fixed, "entity repair finished");
        repairs.push(EntityRepair {
            path: path.display().to_string(),
            fields_fixed,
        });
    }
    Ok(repairs)
}

#[derive(Debug, Clone, Serialize)]
pub struct CopyStatus {
    pub path: String,
    pub exists: bool,
    pub bytes: u64,
    pub articles: usize,
    pub newest_date: Option<String>,
    pub sha256: Option<String>,
}

pub async fn inspect_copies(paths: &[PathBuf]) -> Result<Vec<CopyStatus>> {
    let mut statuses = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                statuses.push(CopyStatus {
                    path: path.display().to_string(),
                    exists: false,
                    bytes: 0,
                    articles: 0,
                    newest_date: None,
                    sha256: None,
                });
                continue;
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let rows = ainews_storage::decode_articles(&bytes, path);
        let newest_date = rows
            .iter()
            .filter_map(|row| try_parse_article_date(&row.date))
            .max()
            .map(|date| date.format(ainews_core::ARTICLE_DATE_FORMAT).to_string());
        statuses.push(CopyStatus {
            path: path.display().to_string(),
            exists: true,
            bytes: bytes.len() as u64,
            articles: rows.len(),
            newest_date,
            sha256: Some(sha256_hex(&bytes)),
        });
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainews_adapters::FeedError;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct StaticFeeds(HashMap<String, String>);

    #[async_trait]
    impl FeedClient for StaticFeeds {
        async fn fetch_feed(&self, url: &str) -> Result<Vec<u8>, FeedError> {
            self.0
                .get(url)
                .map(|body| body.clone().into_bytes())
                .ok_or_else(|| FeedError::Unavailable(url.to_string()))
        }
    }

    fn rss(items: &[(&str, &str, &str)]) -> String {
        let items = items
            .iter()
            .map(|(title, link, description)| {
                format!(
                    "<item><title>{title}</title><link>{link}</link><description>{description}</description><pubDate>Mon, 02 Jun 2025 09:00:00 GMT</pubDate></item>"
                )
            })
            .collect::<String>();
        format!(
            "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>T</title><link>https://example.com</link><description>d</description>{items}</channel></rss>"
        )
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 3)
            .unwrap()
            .and_hms_opt(6, 30, 0)
            .unwrap()
    }

    fn test_config(dir: &Path, feeds: &[&str]) -> CollectorConfig {
        CollectorConfig {
            data_dir: dir.to_path_buf(),
            feeds: feeds.iter().map(ToString::to_string).collect(),
            feed_delay: Duration::ZERO,
            ..CollectorConfig::default()
        }
    }

    fn pipeline(config: CollectorConfig, feeds: Vec<(&str, String)>) -> CollectPipeline {
        let map = feeds
            .into_iter()
            .map(|(url, body)| (url.to_string(), body))
            .collect();
        CollectPipeline::with_client(config, Arc::new(StaticFeeds(map)))
    }

    fn row(date: &str, url: &str, title: &str) -> Article {
        Article {
            date: date.to_string(),
            title: title.to_string(),
            description: String::new(),
            source: "example.com".to_string(),
            url: url.to_string(),
            category: "machine learning".to_string(),
            source_type: "News Source".to_string(),
            insights: String::new(),
        }
    }

    #[test]
    fn config_file_and_overrides_layer_on_defaults() {
        let file: ConfigFile = serde_yaml::from_str(
            "feeds:\n  - https://example.com/feed\nfeed_delay_ms: 10\nfallback_category: uncategorized\n",
        )
        .unwrap();
        let config = CollectorConfig::default()
            .with_config_file(file)
            .with_overrides(|key| match key {
                "AINEWS_MAX_PER_SOURCE" => Some("7".to_string()),
                "AINEWS_DATA_DIR" => Some("/srv/news".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.feeds, vec!["https://example.com/feed".to_string()]);
        assert_eq!(config.feed_delay, Duration::from_millis(10));
        assert_eq!(config.fallback_category, "uncategorized");
        assert_eq!(config.max_articles_per_source, 7);
        assert_eq!(config.keywords.len(), DEFAULT_KEYWORDS.len());
        assert_eq!(
            config.store_paths(),
            vec![
                PathBuf::from("/srv/news/ai_news.csv"),
                PathBuf::from("/srv/news/docs/data/ai_news.csv"),
                PathBuf::from("/srv/news/web_app/data/ai_news.csv"),
            ]
        );
    }

    #[test]
    fn bad_override_is_an_error() {
        let result = CollectorConfig::default()
            .with_overrides(|key| (key == "AINEWS_FEED_DELAY_MS").then(|| "soon".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        assert!(serde_yaml::from_str::<ConfigFile>("feedz: []\n").is_err());
    }

    #[tokio::test]
    async fn duplicate_syndication_is_accepted_once() {
        let dir = tempdir().unwrap();
        let shared = ("OpenAI ships GPT update", "https://shared.example/story", "An LLM story");
        let config = test_config(
            dir.path(),
            &["https://one.example/feed", "https://two.example/feed"],
        );
        let pipeline = pipeline(
            config,
            vec![
                ("https://one.example/feed", rss(&[shared])),
                (
                    "https://two.example/feed",
                    rss(&[shared, ("Deep learning chips", "https://two.example/chips", "Silicon")]),
                ),
            ],
        );

        let summary = pipeline.run_at(now()).await.unwrap();
        assert_eq!(summary.new_articles, 2);
        assert_eq!(summary.duplicates_skipped, 1);
        assert_eq!(summary.feeds[0].accepted, 1);
        assert_eq!(summary.feeds[1].accepted, 1);

        let rows = CsvStore::new(dir.path().join("ai_news.csv"))
            .read_articles()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].source, "one.example");
        assert_eq!(rows[0].category, "generative ai");
        assert_eq!(rows[1].category, "machine learning");
        assert_eq!(rows[0].date, "2025-06-02");
    }

    #[tokio::test]
    async fn ledger_entries_are_never_accepted_again() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("article_history.txt"), "https://one.example/old\n").unwrap();
        let feed = rss(&[
            ("Old AI story", "https://one.example/old", "machine learning"),
            ("New AI story", "https://one.example/new", "machine learning"),
        ]);
        let config = CollectorConfig {
            sync_after_collect: false,
            ..test_config(dir.path(), &["https://one.example/feed"])
        };
        let pipeline = pipeline(config, vec![("https://one.example/feed", feed)]);

        let first = pipeline.run_at(now()).await.unwrap();
        assert_eq!(first.new_articles, 1);
        let second = pipeline.run_at(now()).await.unwrap();
        assert_eq!(second.new_articles, 0);
        assert_eq!(second.duplicates_skipped, 2);
        assert_eq!(second.stored_articles, 1);

        let ledger = std::fs::read_to_string(dir.path().join("article_history.txt")).unwrap();
        assert_eq!(ledger.lines().collect::<Vec<_>>(), vec![
            "https://one.example/old",
            "https://one.example/new",
        ]);
        assert!(!dir.path().join("docs/data/ai_news.csv").exists());
    }

    #[tokio::test]
    async fn research_feeds_get_source_type_and_insights() {
        let dir = tempdir().unwrap();
        let feed = rss(&[(
            "Gartner survey on generative AI",
            "https://www.gartner.com/en/newsroom/ai-survey",
            "Gartner polled 500 CIOs. Adoption rose 30 percent this year. Coffee was served.",
        )]);
        let config = test_config(dir.path(), &["https://www.gartner.com/en/newsroom/feed.xml"]);
        let pipeline = pipeline(
            config,
            vec![("https://www.gartner.com/en/newsroom/feed.xml", feed)],
        );

        pipeline.run_at(now()).await.unwrap();
        let rows = CsvStore::new(dir.path().join("ai_news.csv"))
            .read_articles()
            .await
            .unwrap();
        assert_eq!(rows[0].source_type, "Gartner Research");
        assert_eq!(rows[0].source, "gartner.com");
        assert_eq!(rows[0].insights, "Adoption rose 30 percent this year.");
    }

    #[tokio::test]
    async fn failed_feed_does_not_stop_the_run() {
        let dir = tempdir().unwrap();
        let config = test_config(
            dir.path(),
            &["https://down.example/feed", "https://up.example/feed"],
        );
        let pipeline = pipeline(
            config,
            vec![(
                "https://up.example/feed",
                rss(&[("Neural network news", "https://up.example/1", "x")]),
            )],
        );

        let summary = pipeline.run_at(now()).await.unwrap();
        assert_eq!(summary.feeds_failed, 1);
        assert_eq!(summary.feeds[0].status, FeedStatus::Failed);
        assert!(summary.feeds[0].error.is_some());
        assert_eq!(summary.new_articles, 1);

        let marker = LastUpdateMarker::read(&dir.path().join("last_update.json"))
            .await
            .unwrap();
        assert_eq!(marker.last_updated, "2025-06-03");
        assert_eq!(marker.timestamp, "2025-06-03 06:30:00");

        let sync = summary.sync.expect("sync report");
        assert!(sync.converged());
        assert_eq!(sync.copies.len(), 3);
    }

    #[tokio::test]
    async fn synchronizer_converges_three_copies() {
        let dir = tempdir().unwrap();
        let paths = vec![
            dir.path().join("ai_news.csv"),
            dir.path().join("docs/data/ai_news.csv"),
            dir.path().join("web_app/data/ai_news.csv"),
        ];
        CsvStore::new(&paths[0])
            .write_articles(&[row("2025-01-03", "https://x/a", "a from primary"), row("2025-01-01", "https://x/b", "b")])
            .await
            .unwrap();
        CsvStore::new(&paths[1])
            .write_articles(&[row("2025-01-02", "https://x/c", "c"), row("2025-01-03", "https://x/a", "a from docs")])
            .await
            .unwrap();
        CsvStore::new(&paths[2])
            .write_articles(&[row("bad-date", "https://x/d", "d"), row("2025-01-05", "https://x/e", "e")])
            .await
            .unwrap();

        let report = Synchronizer::new(paths.clone()).synchronize().await.unwrap();
        assert_eq!(report.articles, 5);
        assert!(report.converged());
        assert_eq!(
            report.copies.iter().map(|c| c.rows_before).collect::<Vec<_>>(),
            vec![2, 2, 2]
        );

        let contents: Vec<Vec<u8>> = paths.iter().map(|p| std::fs::read(p).unwrap()).collect();
        assert_eq!(contents[0], contents[1]);
        assert_eq!(contents[1], contents[2]);
        assert_eq!(report.digest.as_deref(), Some(sha256_hex(&contents[0]).as_str()));

        let rows = CsvStore::new(&paths[1]).read_articles().await.unwrap();
        let urls: Vec<_> = rows.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://x/e", "https://x/a", "https://x/c", "https://x/b", "https://x/d"]);
        assert_eq!(rows[1].title, "a from primary");
    }

    #[tokio::test]
    async fn synchronizer_creates_missing_copies_and_skips_when_empty() {
        let dir = tempdir().unwrap();
        let paths = vec![dir.path().join("a.csv"), dir.path().join("nested/b.csv")];

        let empty = Synchronizer::new(paths.clone()).synchronize().await.unwrap();
        assert_eq!(empty.articles, 0);
        assert!(!paths[0].exists());

        CsvStore::new(&paths[0])
            .write_articles(&[row("2025-01-01", "https://x/1", "one")])
            .await
            .unwrap();
        let report = Synchronizer::new(paths.clone()).synchronize().await.unwrap();
        assert_eq!(report.articles, 1);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), std::fs::read(&paths[1]).unwrap());
    }

    #[tokio::test]
    async fn entity_repair_decodes_titles_and_descriptions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ai_news.csv");
        let mut broken = row("2025-01-01", "https://x/1", "OpenAI&#8217;s model");
        broken.description = "Q&amp;A with researchers".to_string();
        CsvStore::new(&path)
            .write_articles(&[broken, row("2025-01-02", "https://x/2", "R&D")])
            .await
            .unwrap();

        let repairs = repair_entities(&[path.clone(), dir.path().join("missing.csv")])
            .await
            .unwrap();
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].fields_fixed, 2);

        let rows = CsvStore::new(&path).read_articles().await.unwrap();
        assert_eq!(rows[0].title, "OpenAI\u{2019}s model");
        assert_eq!(rows[0].description, "Q&A with researchers");
        assert_eq!(rows[1].title, "R&D");
    }

    #[tokio::test]
    async fn inspect_reports_drift_between_copies() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        CsvStore::new(&a)
            .write_articles(&[row("2025-02-01", "https://x/1", "one"), row("2025-03-01", "https://x/2", "two")])
            .await
            .unwrap();

        let statuses = inspect_copies(&[a.clone(), b.clone()]).await.unwrap();
        assert!(statuses[0].exists);
        assert_eq!(statuses[0].articles, 2);
        assert_eq!(statuses[0].newest_date.as_deref(), Some("2025-03-01"));
        assert!(!statuses[1].exists);
        assert!(statuses[1].sha256.is_none());
    }

    #[tokio::test]
    async fn failed_primary_write_keeps_urls_out_of_the_ledger() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("ai_news.csv");
        std::fs::create_dir(&primary).unwrap();
        let feed = rss(&[("New LLM release", "https://n.example/1", "gpt")]);
        let config = CollectorConfig {
            sync_after_collect: false,
            ..test_config(dir.path(), &["https://n.example/feed"])
        };
        let pipeline = pipeline(config, vec![("https://n.example/feed", feed)]);

        assert!(pipeline.run_at(now()).await.is_err());
        let ledger = std::fs::read_to_string(dir.path().join("article_history.txt"))
            .unwrap_or_default();
        assert!(ledger.is_empty());

        std::fs::remove_dir(&primary).unwrap();
        let summary = pipeline.run_at(now()).await.unwrap();
        assert_eq!(summary.new_articles, 1);
        assert_eq!(summary.stored_articles, 1);
        let rows = CsvStore::new(&primary).read_articles().await.unwrap();
        assert_eq!(rows[0].url, "https://n.example/1");
    }

    #[tokio::test]
    async fn entity_repair_keeps_rows_the_reader_would_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ai_news.csv");
        std::fs::write(
            &path,
            "date,title,description,source,url,category,source_type,insights\n\
             2025-01-01,AI &amp; you,,s,https://x/1,c,News Source,\n\
             2025-01-01,AI again,,s,https://x/1,c,News Source,\n\
             2025-01-02,No link,,s,,c,News Source,\n",
        )
        .unwrap();

        let repairs = repair_entities(&[path.clone()]).await.unwrap();
        assert_eq!(repairs[0].fields_fixed, 1);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains("AI & you"));
        assert!(lines[2].contains("AI again"));
        assert!(lines[3].contains("No link"));
    }

    #[tokio::test]
    async fn synchronizer_leaves_unreadable_copies_alone() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("ai_news.csv");
        let unreadable = dir.path().join("mirror.csv");
        std::fs::create_dir(&unreadable).unwrap();
        CsvStore::new(&good)
            .write_articles(&[row("2025-01-01", "https://x/1", "one")])
            .await
            .unwrap();

        let report = Synchronizer::new(vec![good.clone(), unreadable.clone()])
            .synchronize()
            .await
            .unwrap();
        assert!(!report.converged());
        assert!(report.copies[0].written);
        assert!(!report.copies[1].written);
        assert!(report.copies[1]
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("not rewritten, read failed")));
        assert!(unreadable.is_dir());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
