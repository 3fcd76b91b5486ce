//! Core domain model for the AI news collector.

use std::cmp::Reverse;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "ainews-core";

/// Accepted date layouts, tried in order when sorting persisted rows.
pub const ARTICLE_DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%d-%m-%Y"];

/// Layout used for every date this crate writes.
pub const ARTICLE_DATE_FORMAT: &str = "%Y-%m-%d";

/// Classification of the feed an article came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "Gartner Research")]
    GartnerResearch,
    #[serde(rename = "Forrester Research")]
    ForresterResearch,
    #[serde(rename = "News Source")]
    NewsSource,
}

impl SourceType {
    pub fn from_domain(domain: &str) -> Self {
        let domain = domain.to_ascii_lowercase();
        if domain.contains("gartner") {
            Self::GartnerResearch
        } else if domain.contains("forrester") {
            Self::ForresterResearch
        } else {
            Self::NewsSource
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GartnerResearch => "Gartner Research",
            Self::ForresterResearch => "Forrester Research",
            Self::NewsSource => "News Source",
        }
    }

    pub fn is_research(&self) -> bool {
        !matches!(self, Self::NewsSource)
    }
}

/// Normalized feed entry before relevance filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateItem {
    pub title: String,
    /// Plain text; markup is stripped by the fetcher.
    pub description: String,
    pub link: String,
    pub published: NaiveDate,
    pub source_domain: String,
}

/// Persisted CSV row. Field order is the on-disk column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: String,
    pub url: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub insights: String,
}

impl Article {
    pub const COLUMNS: [&'static str; 8] = [
        "date",
        "title",
        "description",
        "source",
        "url",
        "category",
        "source_type",
        "insights",
    ];

    pub fn from_candidate(
        item: &CandidateItem,
        category: impl Into<String>,
        source_type: SourceType,
        insights: impl Into<String>,
    ) -> Self {
        Self {
            date: item.published.format(ARTICLE_DATE_FORMAT).to_string(),
            title: item.title.clone(),
            description: item.description.clone(),
            source: item.source_domain.clone(),
            url: item.link.clone(),
            category: category.into(),
            source_type: source_type.as_str().to_string(),
            insights: insights.into(),
        }
    }
}

/// Date assigned to rows whose date cannot be parsed so they sort last.
pub fn unparsable_date_sentinel() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn try_parse_article_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ARTICLE_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Parse a stored date for ordering, falling back to the sentinel.
pub fn parse_sort_date(raw: &str) -> NaiveDate {
    match try_parse_article_date(raw) {
        Some(date) => date,
        None => {
            warn!(date = raw, "could not parse article date; sorting it last");
            unparsable_date_sentinel()
        }
    }
}

/// Stable sort, newest first. Rows sharing a date keep their relative order.
pub fn sort_articles_newest_first(articles: &mut [Article]) {
    articles.sort_by_cached_key(|a| Reverse(parse_sort_date(&a.date)));
}

/// Bare host of a URL with any leading `www.` removed.
pub fn source_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}
