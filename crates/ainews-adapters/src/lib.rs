//! Feed source contracts + the fetch/filter/classify stages of the collector.

use std::sync::Arc;

use ainews_core::{source_domain, CandidateItem, SourceType};
use ainews_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use chrono::NaiveDate;
use feed_rs::model::{Entry, Feed};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "ainews-adapters";

/// Characters of the description searched for keywords on research-firm feeds.
pub const RESEARCH_DESCRIPTION_WINDOW: usize = 150;

/// Length of the fallback insight excerpt.
pub const INSIGHT_EXCERPT_CHARS: usize = 300;

pub const DEFAULT_FALLBACK_CATEGORY: &str = "artificial intelligence";

pub const DEFAULT_FEEDS: &[&str] = &[
    "https://www.technologyreview.com/feed/",
    "https://www.wired.com/feed/tag/artificial-intelligence/rss",
    "https://www.wired.com/feed/tag/machine-learning/rss",
    "https://www.theverge.com/rss/ai-artificial-intelligence/index.xml",
    "https://techcrunch.com/category/artificial-intelligence/feed/",
    "https://blog.google/technology/ai/rss/",
    "https://openai.com/blog/rss/",
    "http://news.mit.edu/rss/topic/artificial-intelligence2",
    "https://venturebeat.com/category/ai/feed/",
    "https://www.zdnet.com/topic/artificial-intelligence/rss.xml",
    "https://www.gartner.com/en/newsroom/press-releases.xml",
    "https://www.gartner.com/smarterwithgartner/feed/",
    "https://www.forrester.com/blogs/feed/",
    "https://www.forrester.com/press-newsroom/feed/",
];

pub const DEFAULT_KEYWORDS: &[&str] = &[
    "artificial intelligence",
    "machine learning",
    "deep learning",
    "neural network",
    "ai ",
    " ai,",
    " ai.",
    "large language model",
    "llm",
    "generative ai",
    "gpt",
    "chatgpt",
    "transformer",
    "diffusion model",
    "computer vision",
    "natural language processing",
    "nlp",
    "reinforcement learning",
    "ai adoption",
    "ai strategy",
    "ai market",
    "ai trends",
    "ai forecast",
    "ai capabilities",
    "ai maturity",
    "ai governance",
    "ai ethics",
    "enterprise ai",
    "ai implementation",
    "ai analytics",
    "ai automation",
    "ai research",
    "ai report",
    "ai study",
    "ai survey",
    "ai analysis",
    "magic quadrant ai",
    "wave ai",
    "forrester wave",
    "gartner magic quadrant",
    "ai benchmark",
    "ai roi",
    "ai investment",
];

pub const DEFAULT_RESEARCH_TERMS: &[&str] = &[
    "report",
    "study",
    "survey",
    "research",
    "analysis",
    "predict",
    "forecast",
    "market",
    "growth",
    "trend",
    "adoption",
    "implementation",
    "magic quadrant",
    "wave",
    "leaders",
    "challengers",
    "visionaries",
    "percent",
    "percentage",
    "statistics",
    "data",
    "figure",
    "number",
];

const DEFAULT_CATEGORY_TABLE: &[(&str, &[&str])] = &[
    (
        "generative ai",
        &[
            "generative ai",
            "large language model",
            "llm",
            "chatgpt",
            "gpt",
            "diffusion model",
            "transformer",
        ],
    ),
    (
        "machine learning",
        &[
            "machine learning",
            "deep learning",
            "neural network",
            "reinforcement learning",
        ],
    ),
    ("computer vision", &["computer vision", "image recognition"]),
    (
        "natural language processing",
        &["natural language processing", "nlp", "speech recognition"],
    ),
    (
        "ai research",
        &[
            "ai research",
            "ai report",
            "ai study",
            "ai survey",
            "ai analysis",
            "ai benchmark",
            "magic quadrant",
            "forrester wave",
        ],
    ),
    (
        "ai business",
        &[
            "ai adoption",
            "ai strategy",
            "ai market",
            "ai trends",
            "ai forecast",
            "ai investment",
            "ai roi",
            "enterprise ai",
            "ai implementation",
            "ai automation",
            "ai analytics",
        ],
    ),
    (
        "ai ethics & governance",
        &["ai ethics", "ai governance", "ai regulation", "responsible ai"],
    ),
    ("robotics", &["robotics", "robot", "autonomous"]),
    ("artificial intelligence", &["artificial intelligence"]),
];

static SENTENCE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]\s+").expect("sentence break regex"));
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

fn contains_any(haystack_lower: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|needle| haystack_lower.contains(&needle.to_lowercase()))
}

/// Decode HTML entities, including ones that survived a first decode.
pub fn decode_entities(text: &str) -> String {
    let once = html_escape::decode_html_entities(text);
    if once.contains('&') {
        html_escape::decode_html_entities(&once).into_owned()
    } else {
        once.into_owned()
    }
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RUN.replace_all(text, " ").trim().to_string()
}

/// Markup-free, entity-decoded, whitespace-collapsed text.
pub fn clean_text(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    let fragment = Html::parse_fragment(raw);
    let text = fragment.root_element().text().collect::<String>();
    collapse_whitespace(&decode_entities(&text))
}

/// Entity-decoded, whitespace-collapsed title. Angle brackets are text, not markup.
pub fn clean_title(raw: &str) -> String {
    collapse_whitespace(&decode_entities(raw))
}

/// Repair feed bodies that fail a strict parse: BOM, leading junk, HTML-only entities.
pub fn cleanup_xml(xml: &str) -> String {
    let trimmed = xml.trim();
    let trimmed = trimmed.strip_prefix('\u{FEFF}').unwrap_or(trimmed);

    let start = ["<?xml", "<rss", "<feed", "<rdf:RDF"]
        .iter()
        .find_map(|marker| trimmed.find(marker))
        .unwrap_or(0);

    trimmed[start..]
        .replace("&nbsp;", "&#160;")
        .replace("&ndash;", "&#8211;")
        .replace("&mdash;", "&#8212;")
        .replace("&rsquo;", "&#8217;")
        .replace("&lsquo;", "&#8216;")
        .replace("&rdquo;", "&#8221;")
        .replace("&ldquo;", "&#8220;")
        .replace("&hellip;", "&#8230;")
        .replace("&amp;amp;", "&amp;")
        .replace("&apos;", "&#39;")
}

/// Keyword relevance gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevanceFilter {
    keywords: Vec<String>,
}

impl Default for RelevanceFilter {
    fn default() -> Self {
        Self::new(owned(DEFAULT_KEYWORDS))
    }
}

impl RelevanceFilter {
    pub fn new(keywords: Vec<String>) -> Self {
        Self { keywords }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Research-firm feeds need a keyword in the title or near the top of the description.
    pub fn accepts(&self, title: &str, description: &str, research_firm: bool) -> bool {
        if research_firm {
            if contains_any(&title.to_lowercase(), &self.keywords) {
                return true;
            }
            let lead = description
                .chars()
                .take(RESEARCH_DESCRIPTION_WINDOW)
                .collect::<String>()
                .to_lowercase();
            contains_any(&lead, &self.keywords)
        } else {
            let combined = format!("{title} {description}").to_lowercase();
            contains_any(&combined, &self.keywords)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub contains_any: Vec<String>,
}

/// First-match category table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Categorizer {
    rules: Vec<CategoryRule>,
    fallback: String,
}

impl Default for Categorizer {
    fn default() -> Self {
        Self::new(default_category_rules(), DEFAULT_FALLBACK_CATEGORY)
    }
}

pub fn default_category_rules() -> Vec<CategoryRule> {
    DEFAULT_CATEGORY_TABLE
        .iter()
        .map(|(category, keywords)| CategoryRule {
            category: category.to_string(),
            contains_any: owned(keywords),
        })
        .collect()
}

impl Categorizer {
    pub fn new(rules: Vec<CategoryRule>, fallback: impl Into<String>) -> Self {
        Self {
            rules,
            fallback: fallback.into(),
        }
    }

    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    pub fn categorize(&self, text: &str) -> &str {
        let text = text.to_lowercase();
        self.rules
            .iter()
            .find(|rule| contains_any(&text, &rule.contains_any))
            .map(|rule| rule.category.as_str())
            .unwrap_or(self.fallback.as_str())
    }

    pub fn categorize_item(&self, item: &CandidateItem) -> &str {
        self.categorize(&format!("{} {}", item.title, item.description))
    }
}

/// Pulls research-flavoured sentences out of an article description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsightExtractor {
    terms: Vec<String>,
}

impl Default for InsightExtractor {
    fn default() -> Self {
        Self::new(owned(DEFAULT_RESEARCH_TERMS))
    }
}

pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_BREAK.find_iter(text) {
        // terminal punctuation is a single ASCII byte
        sentences.push(&text[start..m.start() + 1]);
        start = m.end();
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

impl InsightExtractor {
    pub fn new(terms: Vec<String>) -> Self {
        Self { terms }
    }

    pub fn extract(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        let matching = split_sentences(text)
            .into_iter()
            .filter(|sentence| contains_any(&sentence.to_lowercase(), &self.terms))
            .collect::<Vec<_>>();
        if !matching.is_empty() {
            return matching.join(" ");
        }

        let mut excerpt = text.chars().take(INSIGHT_EXCERPT_CHARS).collect::<String>();
        if text.chars().count() > INSIGHT_EXCERPT_CHARS {
            excerpt.push_str("...");
        }
        excerpt
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no feed body available for {0}")]
    Unavailable(String),
    #[error("feed url has no host: {0}")]
    InvalidUrl(String),
    #[error("feed parse failed: {0}")]
    Parse(String),
}

/// Source of raw feed documents.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<u8>, FeedError>;
}

#[async_trait]
impl FeedClient for HttpFetcher {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<u8>, FeedError> {
        Ok(self.fetch_bytes(url).await?)
    }
}

/// Per-feed result aggregated by the run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedOutcome {
    Fetched { items: Vec<CandidateItem> },
    Failed { reason: String },
}

impl FeedOutcome {
    pub fn items(&self) -> &[CandidateItem] {
        match self {
            Self::Fetched { items } => items,
            Self::Failed { .. } => &[],
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

pub fn parse_feed_body(body: &[u8]) -> Result<Feed, FeedError> {
    match feed_rs::parser::parse(body) {
        Ok(feed) => Ok(feed),
        Err(first_err) => {
            let cleaned = cleanup_xml(&String::from_utf8_lossy(body));
            match feed_rs::parser::parse(cleaned.as_bytes()) {
                Ok(feed) => {
                    warn!(error = %first_err, "feed parsed only after cleanup");
                    Ok(feed)
                }
                Err(second_err) => Err(FeedError::Parse(format!(
                    "{first_err}; after cleanup: {second_err}"
                ))),
            }
        }
    }
}

fn entry_description(entry: &Entry) -> String {
    entry
        .summary
        .as_ref()
        .map(|text| text.content.as_str())
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            entry
                .content
                .as_ref()
                .and_then(|content| content.body.as_deref())
                .filter(|s| !s.trim().is_empty())
        })
        .map(clean_text)
        .unwrap_or_default()
}

fn entry_date(entry: &Entry, today: NaiveDate) -> NaiveDate {
    entry
        .published
        .or(entry.updated)
        .map(|ts| ts.date_naive())
        .unwrap_or(today)
}

fn entry_to_candidate(entry: &Entry, domain: &str, today: NaiveDate) -> Option<CandidateItem> {
    let link = entry
        .links
        .iter()
        .map(|link| link.href.trim())
        .find(|href| !href.is_empty())?
        .to_string();
    let title = entry
        .title
        .as_ref()
        .map(|t| clean_title(&t.content))
        .unwrap_or_default();
    Some(CandidateItem {
        title,
        description: entry_description(entry),
        link,
        published: entry_date(entry, today),
        source_domain: domain.to_string(),
    })
}

/// Turn parsed feed entries into relevant candidates, scanning at most `2 * cap` entries.
pub fn select_candidates(
    feed: &Feed,
    domain: &str,
    cap: usize,
    filter: &RelevanceFilter,
    today: NaiveDate,
) -> Vec<CandidateItem> {
    let research_firm = SourceType::from_domain(domain).is_research();
    let mut accepted = Vec::new();
    if cap == 0 {
        return accepted;
    }
    for entry in feed.entries.iter().take(cap.saturating_mul(2)) {
        let Some(item) = entry_to_candidate(entry, domain, today) else {
            debug!(domain, entry_id = %entry.id, "skipping entry without link");
            continue;
        };
        if !filter.accepts(&item.title, &item.description, research_firm) {
            continue;
        }
        accepted.push(item);
        if accepted.len() >= cap {
            break;
        }
    }
    accepted
}

/// Fetches one feed and returns its relevant candidates.
pub struct FeedFetcher {
    client: Arc<dyn FeedClient>,
    filter: RelevanceFilter,
}

impl FeedFetcher {
    pub fn new(client: Arc<dyn FeedClient>, filter: RelevanceFilter) -> Self {
        Self { client, filter }
    }

    pub fn filter(&self) -> &RelevanceFilter {
        &self.filter
    }

    pub async fn fetch(
        &self,
        feed_url: &str,
        cap: usize,
        today: NaiveDate,
    ) -> Result<Vec<CandidateItem>, FeedError> {
        let domain =
            source_domain(feed_url).ok_or_else(|| FeedError::InvalidUrl(feed_url.to_string()))?;
        let body = self.client.fetch_feed(feed_url).await?;
        let feed = parse_feed_body(&body)?;
        Ok(select_candidates(&feed, &domain, cap, &self.filter, today))
    }

    /// Same as [`FeedFetcher::fetch`], with failures logged and folded into the outcome.
    pub async fn fetch_outcome(&self, feed_url: &str, cap: usize, today: NaiveDate) -> FeedOutcome {
        match self.fetch(feed_url, cap, today).await {
            Ok(items) => {
                info!(feed = feed_url, accepted = items.len(), "feed fetched");
                FeedOutcome::Fetched { items }
            }
            Err(err) => {
                warn!(feed = feed_url, error = %err, "feed failed; continuing");
                FeedOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}
