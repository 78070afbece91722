//! MediaWiki API client used by the crawler.
//!
//! Every page costs two requests: a `query` for the intro extract, lead
//! image, visible categories, latest revision, and canonical URL, and a
//! `parse` for the rendered HTML and outbound links. Callers wait on the
//! shared [`RateLimiter`] through [`WikiApi::pace`] before each one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use loreforge_shared::{LoreforgeError, Result};

use crate::rate_limit::RateLimiter;

/// Requested lead-image thumbnail width in pixels.
const THUMBNAIL_SIZE: &str = "600";

/// Why a single page could not be fetched. Never aborts a crawl.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("request timed out")]
    Timeout,
    #[error("page does not exist")]
    NotFound,
    #[error("rate limited by server (HTTP 429)")]
    RateLimited,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Network(String),
}

impl From<reqwest::Error> for FetchFailure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Response shapes (formatversion=2)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    info: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    query: Option<QueryBody>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    #[serde(default)]
    pages: Vec<QueryPage>,
}

#[derive(Debug, Deserialize)]
struct QueryPage {
    #[serde(default)]
    pageid: Option<u64>,
    #[serde(default)]
    ns: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    extract: Option<String>,
    #[serde(default)]
    categories: Vec<TitleRef>,
    #[serde(default)]
    revisions: Vec<Revision>,
    #[serde(default)]
    fullurl: Option<String>,
    #[serde(default)]
    thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    #[serde(default)]
    source: String,
}

#[derive(Debug, Deserialize)]
struct TitleRef {
    #[serde(default)]
    ns: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    exists: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Revision {
    #[serde(default)]
    revid: Option<u64>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    #[serde(default)]
    parse: Option<ParseBody>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ParseBody {
    #[serde(default)]
    text: String,
    #[serde(default)]
    links: Vec<TitleRef>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Page metadata from the `query` request.
#[derive(Debug, Clone)]
pub struct PageInfo {
    pub page_id: u64,
    pub namespace: i64,
    /// Title after redirect resolution.
    pub title: String,
    pub url: Option<String>,
    pub extract: String,
    pub categories: Vec<String>,
    pub revision_id: Option<u64>,
    pub revision_timestamp: Option<DateTime<Utc>>,
    /// Lead image thumbnail URL.
    pub image: Option<String>,
}

/// Rendered content from the `parse` request.
#[derive(Debug, Clone)]
pub struct PageContent {
    pub html: String,
    /// Existing article-namespace link targets, deduplicated in order.
    pub links: Vec<String>,
}

/// Thin wrapper over `api.php` sharing one HTTP client and rate limiter.
#[derive(Clone)]
pub struct WikiApi {
    client: Client,
    api_url: String,
    limiter: Arc<RateLimiter>,
}

impl WikiApi {
    pub fn new(api_url: &str, user_agent: &str, timeout_secs: u64, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LoreforgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.to_string(),
            limiter,
        })
    }

    /// Waits for the next request slot. Callers pace before each request so
    /// the wait stays outside any per-request deadline.
    pub async fn pace(&self) {
        self.limiter.acquire().await;
    }

    async fn get<T: DeserializeOwned>(&self, params: &[(&str, &str)]) -> std::result::Result<T, FetchFailure> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&[("format", "json"), ("formatversion", "2")])
            .query(params)
            .send()
            .await?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(FetchFailure::RateLimited),
            StatusCode::NOT_FOUND => return Err(FetchFailure::NotFound),
            status if !status.is_success() => {
                return Err(FetchFailure::Network(format!("HTTP {status}")));
            }
            _ => {}
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| FetchFailure::Malformed(e.to_string()))
    }

    /// Resolve `title` (following redirects) and read its metadata.
    pub async fn page_info(&self, title: &str) -> std::result::Result<PageInfo, FetchFailure> {
        let response: QueryResponse = self
            .get(&[
                ("action", "query"),
                ("titles", title),
                ("redirects", "1"),
                ("prop", "extracts|pageimages|categories|revisions|info"),
                ("exintro", "1"),
                ("explaintext", "1"),
                ("piprop", "thumbnail"),
                ("pithumbsize", THUMBNAIL_SIZE),
                ("cllimit", "max"),
                ("clshow", "!hidden"),
                ("rvprop", "ids|timestamp"),
                ("inprop", "url"),
            ])
            .await?;

        if let Some(err) = response.error {
            return Err(api_error(err));
        }

        let page = response
            .query
            .and_then(|q| q.pages.into_iter().next())
            .ok_or_else(|| FetchFailure::Malformed("no pages in query response".into()))?;

        if page.missing || page.invalid {
            return Err(FetchFailure::NotFound);
        }
        let page_id = page
            .pageid
            .ok_or_else(|| FetchFailure::Malformed("page without pageid".into()))?;

        let categories = page
            .categories
            .into_iter()
            .map(|c| c.title.trim_start_matches("Category:").to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let revision = page.revisions.into_iter().next();
        let image = page
            .thumbnail
            .map(|t| t.source)
            .filter(|s| !s.trim().is_empty());

        Ok(PageInfo {
            page_id,
            namespace: page.ns,
            title: page.title,
            url: page.fullurl,
            extract: page.extract.unwrap_or_default().trim().to_string(),
            categories,
            revision_id: revision.as_ref().and_then(|r| r.revid),
            revision_timestamp: revision.and_then(|r| r.timestamp),
            image,
        })
    }

    /// Rendered HTML and article links of a resolved title.
    pub async fn page_content(&self, title: &str) -> std::result::Result<PageContent, FetchFailure> {
        let response: ParseResponse = self
            .get(&[
                ("action", "parse"),
                ("page", title),
                ("redirects", "1"),
                ("prop", "text|links"),
                ("disableeditsection", "1"),
            ])
            .await?;

        if let Some(err) = response.error {
            return Err(api_error(err));
        }
        let body = response
            .parse
            .ok_or_else(|| FetchFailure::Malformed("no parse body".into()))?;

        let mut links: Vec<String> = Vec::new();
        for link in body.links {
            if link.ns != 0 || link.exists == Some(false) || link.title.is_empty() {
                continue;
            }
            if !links.contains(&link.title) {
                links.push(link.title);
            }
        }

        Ok(PageContent {
            html: body.text,
            links,
        })
    }
}

fn api_error(err: ApiError) -> FetchFailure {
    match err.code.as_str() {
        "missingtitle" | "invalidtitle" | "nosuchpageid" => FetchFailure::NotFound,
        "ratelimited" => FetchFailure::RateLimited,
        _ => FetchFailure::Malformed(format!("API error {}: {}", err.code, err.info)),
    }
}
