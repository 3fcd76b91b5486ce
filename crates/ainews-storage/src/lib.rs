//! Flat-file persistence (CSV store, dedup ledger, update marker) + HTTP fetch for the collector.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ainews_core::{sort_articles_newest_first, Article};
use anyhow::{anyhow, Context};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ainews-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Bytes written to a sibling temp file, not yet visible at the target path.
///
/// The target is only ever mutated by [`StagedWrite::commit`], which is a
/// single rename. Dropping or aborting a staged write leaves it untouched.
#[derive(Debug)]
pub struct StagedWrite {
    target: PathBuf,
    temp_path: PathBuf,
}

impl StagedWrite {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub async fn commit(self) -> anyhow::Result<()> {
        match fs::rename(&self.temp_path, &self.target).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&self.temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming {} -> {}",
                        self.temp_path.display(),
                        self.target.display()
                    )
                })
            }
        }
    }

    pub async fn abort(self) -> anyhow::Result<()> {
        fs::remove_file(&self.temp_path)
            .await
            .with_context(|| format!("removing staged file {}", self.temp_path.display()))
    }
}

/// Write `bytes` to a fresh temp file next to `target`.
pub async fn stage_bytes(target: &Path, bytes: &[u8]) -> anyhow::Result<StagedWrite> {
    let dir = parent_dir(target);
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating directory {}", dir.display()))?;

    let file_name = target
        .file_name()
        .ok_or_else(|| anyhow!("target {} has no file name", target.display()))?;
    let temp_name = format!(".{}.{}.tmp", file_name.to_string_lossy(), Uuid::new_v4());
    let temp_path = dir.join(temp_name);

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    Ok(StagedWrite {
        target: target.to_path_buf(),
        temp_path,
    })
}

/// Replace `target` with `bytes` via temp file + rename.
pub async fn write_atomic(target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    stage_bytes(target, bytes).await?.commit().await
}

/// Keep the first row seen for each url. Rows with an empty url are dropped.
pub fn dedupe_by_url(articles: impl IntoIterator<Item = Article>) -> Vec<Article> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for article in articles {
        if article.url.trim().is_empty() {
            warn!(title = %article.title, "dropping row without url");
            continue;
        }
        if seen.insert(article.url.clone()) {
            out.push(article);
        }
    }
    out
}

/// Serialize rows with the fixed header. The header is written even when `articles` is empty.
pub fn encode_articles(articles: &[Article]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(Article::COLUMNS)
        .context("writing csv header")?;
    for article in articles {
        writer
            .serialize(article)
            .with_context(|| format!("serializing row {}", article.url))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow!("flushing csv buffer: {}", err.error()))
}

/// Parse CSV bytes, skipping rows that fail to deserialize and duplicate urls.
pub fn decode_articles(bytes: &[u8], origin: &Path) -> Vec<Article> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let mut rows = Vec::new();
    for (index, record) in reader.deserialize::<Article>().enumerate() {
        match record {
            Ok(article) => rows.push(article),
            Err(err) => warn!(
                path = %origin.display(),
                row = index + 1,
                error = %err,
                "skipping unreadable csv row"
            ),
        }
    }
    dedupe_by_url(rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: usize,
    pub total: usize,
}

/// One copy of the article CSV on disk.
#[derive(Debug, Clone)]
pub struct CsvStore {
    path: PathBuf,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> anyhow::Result<bool> {
        fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))
    }

    /// Rows currently stored; a missing file reads as empty.
    pub async fn read_articles(&self) -> anyhow::Result<Vec<Article>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "csv store does not exist yet");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        Ok(decode_articles(&bytes, &self.path))
    }

    /// Atomically replace the file with `articles` as given.
    pub async fn write_articles(&self, articles: &[Article]) -> anyhow::Result<()> {
        let bytes = encode_articles(articles)?;
        self.write_encoded(&bytes).await
    }

    pub async fn write_encoded(&self, bytes: &[u8]) -> anyhow::Result<()> {
        write_atomic(&self.path, bytes).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "csv store replaced");
        Ok(())
    }

    /// Union existing rows with `new_articles`, sort newest first and replace the file.
    pub async fn merge(&self, new_articles: &[Article]) -> anyhow::Result<MergeOutcome> {
        let existing = self.read_articles().await?;
        let existing_count = existing.len();
        let mut merged = dedupe_by_url(existing.into_iter().chain(new_articles.iter().cloned()));
        sort_articles_newest_first(&mut merged);
        self.write_articles(&merged).await?;

        let outcome = MergeOutcome {
            added: merged.len() - existing_count,
            total: merged.len(),
        };
        info!(
            path = %self.path.display(),
            added = outcome.added,
            total = outcome.total,
            "merged articles into csv store"
        );
        Ok(outcome)
    }

    /// Rewrite the named columns of every record in place; other columns, row order,
    /// duplicate rows and rows the article reader would skip are kept as they are.
    /// Returns the number of fields `fix` changed. The file is only replaced when that is non-zero.
    pub async fn rewrite_columns(
        &self,
        columns: &[&str],
        mut fix: impl FnMut(&str) -> Option<String>,
    ) -> anyhow::Result<usize> {
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());

        let mut targets: Vec<usize> = Vec::new();
        let mut changed = 0usize;
        for (index, record) in reader.records().enumerate() {
            let record = record.with_context(|| {
                format!("reading record {} of {}", index + 1, self.path.display())
            })?;
            let mut fields: Vec<String> = record.iter().map(ToString::to_string).collect();
            if index == 0 {
                targets = fields
                    .iter()
                    .enumerate()
                    .filter(|(_, name)| columns.contains(&name.trim()))
                    .map(|(position, _)| position)
                    .collect();
            } else {
                for &position in &targets {
                    if let Some(field) = fields.get_mut(position) {
                        if let Some(fixed) = fix(field.as_str()) {
                            *field = fixed;
                            changed += 1;
                        }
                    }
                }
            }
            writer
                .write_record(&fields)
                .with_context(|| format!("re-encoding record {}", index + 1))?;
        }

        if changed > 0 {
            let rewritten = writer
                .into_inner()
                .map_err(|err| anyhow!("flushing csv buffer: {}", err.error()))?;
            self.write_encoded(&rewritten).await?;
        }
        Ok(changed)
    }
}

/// Append-only set of already-emitted article urls, one per line.
///
/// The in-memory set is loaded once and not updated by [`DedupLedger::record`].
#[derive(Debug, Clone)]
pub struct DedupLedger {
    path: PathBuf,
    seen: HashSet<String>,
}

impl DedupLedger {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let seen = match fs::read_to_string(&path).await {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToString::to_string)
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading ledger {}", path.display()));
            }
        };
        debug!(path = %path.display(), entries = seen.len(), "loaded dedup ledger");
        Ok(Self { path, seen })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Append one identifier to the ledger file (open, write, close).
    pub async fn record(&self, id: &str) -> anyhow::Result<()> {
        let dir = parent_dir(&self.path);
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating directory {}", dir.display()))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening ledger {}", self.path.display()))?;
        file.write_all(format!("{}\n", id.trim()).as_bytes())
            .await
            .with_context(|| format!("appending to ledger {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing ledger {}", self.path.display()))?;
        Ok(())
    }
}

/// Small JSON record read by the static site to show freshness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUpdateMarker {
    pub last_updated: String,
    pub timestamp: String,
}

impl LastUpdateMarker {
    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            last_updated: now.format("%Y-%m-%d").to_string(),
            timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub async fn write(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("serializing last update marker")?;
        write_atomic(path, &bytes).await
    }

    pub async fn read(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Plain GET client. One attempt per call; pacing between feeds is the caller's job.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = tracing::info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}
