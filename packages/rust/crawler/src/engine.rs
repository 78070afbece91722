//! Breadth-first, rate-limited crawl over the wiki API.
//!
//! The crawl proceeds level by level from the seeds (depth 0). Within a level,
//! titles are fetched on a bounded worker pool; results are collected back in
//! queue order so the output is independent of task scheduling. Links found on
//! a page at depth `d` become candidates for level `d + 1` if the seed's hop
//! limit allows it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use loreforge_shared::wiki::{canonical_title, namespace_prefix, title_to_url};
use loreforge_shared::{CrawlConfig, FetchedPage, LoreforgeError, Result, Seed};

use crate::api::{FetchFailure, WikiApi};
use crate::rate_limit::RateLimiter;
use crate::sections::extract_sections;

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Why a title produced no page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Timeout,
    NotFound,
    RateLimited,
    Malformed,
    Network,
    /// Namespace or title pattern exclusion.
    Excluded,
    /// Redirected onto a page already fetched in this crawl.
    DuplicateRedirect,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::Malformed => "malformed",
            Self::Network => "network",
            Self::Excluded => "excluded",
            Self::DuplicateRedirect => "duplicate_redirect",
        }
    }
}

impl From<&FetchFailure> for SkipReason {
    fn from(failure: &FetchFailure) -> Self {
        match failure {
            FetchFailure::Timeout => Self::Timeout,
            FetchFailure::NotFound => Self::NotFound,
            FetchFailure::RateLimited => Self::RateLimited,
            FetchFailure::Malformed(_) => Self::Malformed,
            FetchFailure::Network(_) => Self::Network,
        }
    }
}

/// One entry of the crawl skip log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSkip {
    pub title: String,
    pub seed: String,
    pub depth: u32,
    pub reason: SkipReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Counters for the run manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlStats {
    pub seeds: usize,
    pub pages_fetched: usize,
    pub pages_skipped: usize,
    /// Skip count per [`SkipReason::as_str`].
    pub skip_reasons: BTreeMap<String, usize>,
    /// Titles still queued when `max_pages` was reached.
    pub queue_remaining: usize,
    pub deepest_level: u32,
    pub duration_ms: u64,
}

/// Everything a crawl produced.
#[derive(Debug, Clone)]
pub struct CrawlOutput {
    pub pages: Vec<FetchedPage>,
    pub skips: Vec<CrawlSkip>,
    pub stats: CrawlStats,
}

/// Receives a tick for every fetched page.
pub trait CrawlProgress: Send + Sync {
    fn page_fetched(&self, title: &str, fetched: usize, cap: usize);
}

/// Progress sink that ignores everything.
pub struct NoProgress;

impl CrawlProgress for NoProgress {
    fn page_fetched(&self, _title: &str, _fetched: usize, _cap: usize) {}
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

/// A queued title plus the traversal context it was reached with.
#[derive(Debug, Clone)]
struct QueueItem {
    title: String,
    depth: u32,
    seed: String,
    hop_limit: u32,
}

/// Bounded-concurrency wiki crawler.
pub struct Crawler {
    config: CrawlConfig,
    api: WikiApi,
    title_patterns: Vec<Regex>,
}

impl Crawler {
    /// Create a crawler. Fails on an invalid exclusion pattern or HTTP client setup.
    pub fn new(config: CrawlConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::from_millis(config.rate_limit_ms));
        let api = WikiApi::new(
            &config.api_url,
            &config.user_agent,
            config.request_timeout_secs,
            limiter,
        )?;

        let title_patterns = config
            .exclude_title_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    LoreforgeError::config(format!("invalid exclude_title_patterns entry '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            api,
            title_patterns,
        })
    }

    /// True if `title` falls in an excluded namespace or matches an excluded pattern.
    pub fn is_excluded(&self, title: &str) -> bool {
        if let Some(ns) = namespace_prefix(title) {
            if self
                .config
                .exclude_namespaces
                .iter()
                .any(|excluded| excluded.eq_ignore_ascii_case(ns))
            {
                return true;
            }
        }
        self.title_patterns.iter().any(|re| re.is_match(title))
    }

    /// Crawl from `seeds` without progress reporting.
    pub async fn crawl(&self, seeds: &[Seed]) -> CrawlOutput {
        self.crawl_with_progress(seeds, &NoProgress).await
    }

    /// Crawl from `seeds`, returning pages in traversal order plus the skip log.
    #[instrument(skip_all, fields(seeds = seeds.len()))]
    pub async fn crawl_with_progress(
        &self,
        seeds: &[Seed],
        progress: &dyn CrawlProgress,
    ) -> CrawlOutput {
        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1) as usize));

        let mut visited: HashSet<String> = HashSet::new();
        let mut fetched_titles: HashSet<String> = HashSet::new();
        let mut pages: Vec<FetchedPage> = Vec::new();
        let mut skips: Vec<CrawlSkip> = Vec::new();
        let mut deepest_level = 0;

        info!(
            max_depth = self.config.max_depth,
            max_pages = self.config.max_pages,
            concurrency = self.config.concurrency,
            rate_limit_ms = self.config.rate_limit_ms,
            "starting crawl"
        );

        let mut level: Vec<QueueItem> = Vec::new();
        for seed in seeds {
            let title = canonical_title(&seed.title);
            if !visited.insert(title.clone()) {
                continue;
            }
            let item = QueueItem {
                title: title.clone(),
                depth: 0,
                seed: title,
                hop_limit: self.config.max_depth.min(seed.hop_budget),
            };
            if self.is_excluded(&item.title) {
                skips.push(skip_for(&item, SkipReason::Excluded, None));
                continue;
            }
            level.push(item);
        }

        let mut queue_remaining = 0;

        while !level.is_empty() {
            let depth = level[0].depth;
            deepest_level = deepest_level.max(depth);
            let mut next_level: Vec<QueueItem> = Vec::new();
            let mut pending = level.into_iter().peekable();

            while pending.peek().is_some() {
                let capacity = self.config.max_pages.saturating_sub(pages.len());
                if capacity == 0 {
                    break;
                }
                let chunk: Vec<QueueItem> = pending.by_ref().take(capacity).collect();
                let results = self.fetch_chunk(&chunk, &semaphore).await;

                for (item, result) in chunk.into_iter().zip(results) {
                    let page = match result {
                        Ok(page) => page,
                        Err(failure) => {
                            debug!(title = %item.title, reason = SkipReason::from(&failure).as_str(), "page skipped");
                            let detail = failure.to_string();
                            skips.push(skip_for(&item, SkipReason::from(&failure), Some(detail)));
                            continue;
                        }
                    };

                    if fetched_titles.contains(&page.title) {
                        skips.push(skip_for(
                            &item,
                            SkipReason::DuplicateRedirect,
                            Some(format!("resolves to already fetched {}", page.title)),
                        ));
                        continue;
                    }
                    if page.title != item.title {
                        visited.insert(canonical_title(&page.title));
                    }
                    fetched_titles.insert(page.title.clone());

                    if item.depth < item.hop_limit {
                        for link in &page.links {
                            let link = canonical_title(link);
                            if !visited.insert(link.clone()) {
                                continue;
                            }
                            let child = QueueItem {
                                title: link,
                                depth: item.depth + 1,
                                seed: item.seed.clone(),
                                hop_limit: item.hop_limit,
                            };
                            if self.is_excluded(&child.title) {
                                skips.push(skip_for(&child, SkipReason::Excluded, None));
                                continue;
                            }
                            next_level.push(child);
                        }
                    }

                    progress.page_fetched(&page.title, pages.len() + 1, self.config.max_pages);
                    pages.push(page);
                }
            }

            let leftover = pending.count();
            if leftover > 0 || pages.len() >= self.config.max_pages {
                queue_remaining = leftover + next_level.len();
                if queue_remaining > 0 {
                    warn!(queue_remaining, "max_pages reached, stopping crawl");
                }
                break;
            }
            level = next_level;
        }

        let mut skip_reasons: BTreeMap<String, usize> = BTreeMap::new();
        for skip in &skips {
            *skip_reasons.entry(skip.reason.as_str().to_string()).or_default() += 1;
        }

        let stats = CrawlStats {
            seeds: seeds.len(),
            pages_fetched: pages.len(),
            pages_skipped: skips.len(),
            skip_reasons,
            queue_remaining,
            deepest_level,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            pages_fetched = stats.pages_fetched,
            pages_skipped = stats.pages_skipped,
            queue_remaining = stats.queue_remaining,
            duration_ms = stats.duration_ms,
            "crawl completed"
        );

        CrawlOutput { pages, skips, stats }
    }

    /// Fetch a chunk of titles concurrently; results come back in chunk order.
    async fn fetch_chunk(
        &self,
        chunk: &[QueueItem],
        semaphore: &Arc<Semaphore>,
    ) -> Vec<std::result::Result<FetchedPage, FetchFailure>> {
        let page_timeout = Duration::from_secs(self.config.page_timeout_secs);
        let mut handles = Vec::with_capacity(chunk.len());

        for item in chunk {
            let api = self.api.clone();
            let sem = semaphore.clone();
            let item = item.clone();
            let wiki_host = self.config.wiki_host.clone();

            handles.push(tokio::spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return Err(FetchFailure::Network("worker pool closed".into()));
                };
                fetch_page(&api, &item, &wiki_host, page_timeout).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => Err(FetchFailure::Network(format!("fetch task failed: {e}"))),
            });
        }
        results
    }
}

// ---------------------------------------------------------------------------
// Page fetching
// ---------------------------------------------------------------------------

async fn within<T>(
    budget: Duration,
    request: impl std::future::Future<Output = std::result::Result<T, FetchFailure>>,
) -> std::result::Result<T, FetchFailure> {
    match tokio::time::timeout(budget, request).await {
        Ok(result) => result,
        Err(_) => Err(FetchFailure::Timeout),
    }
}

/// Fetches one page with two paced requests. `page_timeout` bounds the time
/// spent on the network only; waiting for a rate-limit slot does not count.
async fn fetch_page(
    api: &WikiApi,
    item: &QueueItem,
    wiki_host: &str,
    page_timeout: Duration,
) -> std::result::Result<FetchedPage, FetchFailure> {
    debug!(title = %item.title, depth = item.depth, "fetching page");

    api.pace().await;
    let started = Instant::now();
    let info = within(page_timeout, api.page_info(&item.title)).await?;
    let remaining = page_timeout.saturating_sub(started.elapsed());

    api.pace().await;
    let content = within(remaining, api.page_content(&info.title)).await?;

    let sections = extract_sections(&content.html);
    let full_text = sections
        .iter()
        .map(|s| {
            if s.heading.is_empty() {
                s.text.clone()
            } else {
                format!("{}\n{}", s.heading, s.text)
            }
        })
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let lead_summary = if info.extract.is_empty() {
        sections
            .first()
            .filter(|s| s.level == 0)
            .map(|s| s.text.clone())
            .unwrap_or_default()
    } else {
        info.extract
    };

    Ok(FetchedPage {
        page_id: info.page_id,
        url: info.url.unwrap_or_else(|| title_to_url(&info.title, wiki_host)),
        title: info.title,
        namespace: info.namespace,
        content_hash: content_hash(&lead_summary, &full_text),
        lead_summary,
        full_text,
        sections,
        categories: info.categories,
        links: content.links,
        revision_id: info.revision_id,
        revision_timestamp: info.revision_timestamp,
        image: info.image,
        fetched_at: Utc::now(),
        seed: item.seed.clone(),
        depth: item.depth,
    })
}

fn skip_for(item: &QueueItem, reason: SkipReason, detail: Option<String>) -> CrawlSkip {
    CrawlSkip {
        title: item.title.clone(),
        seed: item.seed.clone(),
        depth: item.depth,
        reason,
        detail,
        at: Utc::now(),
    }
}

/// SHA-256 over the extracted text of a page.
pub fn content_hash(lead: &str, full_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lead.as_bytes());
    hasher.update(b"\n\x00\n");
    hasher.update(full_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loreforge_shared::{AppConfig, SeedOrigin};
    use wiremock::matchers::{method, path, query_param};
    use std::sync::Mutex;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn config(server: &MockServer) -> CrawlConfig {
        let mut config = CrawlConfig::from(&AppConfig::default());
        config.api_url = format!("{}/api.php", server.uri());
        config.rate_limit_ms = 0;
        config.concurrency = 3;
        config.page_timeout_secs = 5;
        config
    }

    fn seed(title: &str, hop_budget: u32) -> Seed {
        Seed {
            title: title.into(),
            url: title_to_url(title, "fallout.fandom.com"),
            origin: SeedOrigin::Direct,
            categories: Vec::new(),
            hop_budget,
        }
    }

    fn query_body(page_id: u64, title: &str, extract: &str) -> serde_json::Value {
        serde_json::json!({
            "batchcomplete": true,
            "query": {"pages": [{
                "pageid": page_id,
                "ns": 0,
                "title": title,
                "extract": extract,
                "categories": [{"ns": 14, "title": "Category:Fallout 3 locations"}],
                "revisions": [{"revid": page_id * 10, "parentid": 1, "timestamp": "2024-03-01T12:00:00Z"}],
                "fullurl": format!("https://fallout.fandom.com/wiki/{}", title.replace(' ', "_")),
                "thumbnail": {
                    "source": format!("https://static.wikia.nocookie.net/fallout/images/{page_id}.png"),
                    "width": 600,
                    "height": 400
                }
            }]}
        })
    }

    fn parse_body(title: &str, html: &str, links: &[&str]) -> serde_json::Value {
        let links: Vec<_> = links
            .iter()
            .map(|l| {
                let ns = if l.contains(':') { 1 } else { 0 };
                serde_json::json!({"ns": ns, "title": l, "exists": true})
            })
            .collect();
        serde_json::json!({"parse": {"title": title, "pageid": 1, "text": html, "links": links}})
    }

    async fn mount_page(server: &MockServer, page_id: u64, title: &str, links: &[&str]) {
        Mock::given(method("GET"))
            .and(path("/api.php"))
            .and(query_param("action", "query"))
            .and(query_param("titles", title))
            .respond_with(ResponseTemplate::new(200).set_body_json(query_body(
                page_id,
                title,
                &format!("{title} is a place in the Capital Wasteland."),
            )))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api.php"))
            .and(query_param("action", "parse"))
            .and(query_param("page", title))
            .respond_with(ResponseTemplate::new(200).set_body_json(parse_body(
                title,
                &format!("<div class=\"mw-parser-output\"><p>{title} body.</p><h2>History</h2><p>Built in 2063.</p></div>"),
                links,
            )))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn crawl_follows_links_breadth_first() {
        let server = MockServer::start().await;
        mount_page(&server, 1, "Megaton", &["Moriarty's Saloon", "Talk:Megaton", "Vault 101"]).await;
        mount_page(&server, 2, "Moriarty's Saloon", &["Megaton", "Gob"]).await;
        mount_page(&server, 3, "Vault 101", &["Megaton", "Lone Wanderer"]).await;
        mount_page(&server, 4, "Gob", &["Underworld"]).await;
        mount_page(&server, 5, "Lone Wanderer", &[]).await;

        let crawler = Crawler::new(config(&server)).unwrap();
        let output = crawler.crawl(&[seed("Megaton", 2)]).await;

        let titles: Vec<_> = output.pages.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Megaton", "Moriarty's Saloon", "Vault 101", "Gob", "Lone Wanderer"]
        );
        assert!(output.skips.is_empty());
        assert_eq!(output.stats.deepest_level, 2);

        let gob = &output.pages[3];
        assert_eq!(gob.depth, 2);
        assert_eq!(gob.seed, "Megaton");
        assert_eq!(gob.categories, vec!["Fallout 3 locations"]);
        assert_eq!(gob.revision_id, Some(40));
        assert_eq!(gob.sections.len(), 2);
        assert!(gob.full_text.contains("History\nBuilt in 2063."));
        assert_eq!(gob.content_hash.len(), 64);
        assert_eq!(
            gob.image.as_deref(),
            Some("https://static.wikia.nocookie.net/fallout/images/4.png")
        );
    }

    #[tokio::test]
    async fn hop_budget_limits_depth() {
        let server = MockServer::start().await;
        mount_page(&server, 1, "Megaton", &["Vault 101"]).await;
        mount_page(&server, 3, "Vault 101", &["Lone Wanderer"]).await;

        let crawler = Crawler::new(config(&server)).unwrap();
        let output = crawler.crawl(&[seed("Megaton", 1)]).await;

        let titles: Vec<_> = output.pages.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Megaton", "Vault 101"]);
    }

    #[tokio::test]
    async fn failures_are_skips_not_errors() {
        let server = MockServer::start().await;
        mount_page(&server, 1, "Megaton", &["Missing page", "Busy page", "Slow page"]).await;

        Mock::given(path("/api.php"))
            .and(query_param("titles", "Missing page"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "query": {"pages": [{"ns": 0, "title": "Missing page", "missing": true}]}
            })))
            .mount(&server)
            .await;

        Mock::given(path("/api.php"))
            .and(query_param("titles", "Busy page"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        Mock::given(path("/api.php"))
            .and(query_param("titles", "Slow page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(query_body(9, "Slow page", "slow"))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let mut config = config(&server);
        config.page_timeout_secs = 1;
        let crawler = Crawler::new(config).unwrap();
        let output = crawler.crawl(&[seed("Megaton", 2)]).await;

        assert_eq!(output.pages.len(), 1);
        let reasons: Vec<_> = output.skips.iter().map(|s| (s.title.as_str(), s.reason)).collect();
        assert_eq!(
            reasons,
            vec![
                ("Missing page", SkipReason::NotFound),
                ("Busy page", SkipReason::RateLimited),
                ("Slow page", SkipReason::Timeout),
            ]
        );
        assert_eq!(output.stats.skip_reasons.get("timeout"), Some(&1));
        assert_eq!(output.stats.pages_skipped, 3);
    }

    #[tokio::test]
    async fn redirect_onto_fetched_page_is_skipped() {
        let server = MockServer::start().await;
        mount_page(&server, 1, "Megaton", &["Megaton (Fallout 3)"]).await;

        Mock::given(path("/api.php"))
            .and(query_param("titles", "Megaton (Fallout 3)"))
            .respond_with(ResponseTemplate::new(200).set_body_json(query_body(1, "Megaton", "again")))
            .mount(&server)
            .await;

        let crawler = Crawler::new(config(&server)).unwrap();
        let output = crawler.crawl(&[seed("Megaton", 2)]).await;

        assert_eq!(output.pages.len(), 1);
        assert_eq!(output.skips.len(), 1);
        assert_eq!(output.skips[0].reason, SkipReason::DuplicateRedirect);
    }

    #[tokio::test]
    async fn max_pages_caps_the_crawl() {
        let server = MockServer::start().await;
        mount_page(&server, 1, "Megaton", &["Moriarty's Saloon", "Vault 101"]).await;
        mount_page(&server, 2, "Moriarty's Saloon", &["Gob"]).await;
        mount_page(&server, 3, "Vault 101", &[]).await;

        let mut config = config(&server);
        config.max_pages = 2;
        let crawler = Crawler::new(config).unwrap();
        let output = crawler.crawl(&[seed("Megaton", 2)]).await;

        assert_eq!(output.pages.len(), 2);
        assert_eq!(output.stats.queue_remaining, 2);
    }

    #[test]
    fn exclusions() {
        let mut config = CrawlConfig::from(&AppConfig::default());
        config.api_url = "http://127.0.0.1:9/api.php".into();
        let crawler = Crawler::new(config).unwrap();

        assert!(crawler.is_excluded("User talk:Someone"));
        assert!(crawler.is_excluded("File:Megaton.png"));
        assert!(crawler.is_excluded("Frost (mod)"));
        assert!(!crawler.is_excluded("Megaton"));
        assert!(!crawler.is_excluded("Fallout: New Vegas"));
    }

    #[test]
    fn bad_pattern_is_config_error() {
        let mut config = CrawlConfig::from(&AppConfig::default());
        config.exclude_title_patterns = vec!["(".into()];
        assert!(matches!(Crawler::new(config), Err(LoreforgeError::Config { .. })));
    }

    #[test]
    fn excluded_seed_is_recorded() {
        let skip = skip_for(
            &QueueItem {
                title: "Talk:Megaton".into(),
                depth: 0,
                seed: "Talk:Megaton".into(),
                hop_limit: 2,
            },
            SkipReason::Excluded,
            None,
        );
        let json = serde_json::to_string(&skip).unwrap();
        assert!(json.contains("\"reason\":\"excluded\""));
    }

    /// Records when each request arrives and answers after a fixed delay.
    struct Arrivals {
        seen: Arc<Mutex<Vec<Instant>>>,
        body: serde_json::Value,
        delay: Duration,
    }

    impl Respond for Arrivals {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.seen.lock().unwrap().push(Instant::now());
            ResponseTemplate::new(200)
                .set_body_json(self.body.clone())
                .set_delay(self.delay)
        }
    }

    #[tokio::test]
    async fn concurrency_bounds_requests_in_flight() {
        let server = MockServer::start().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let delay = Duration::from_millis(300);
        let titles = ["Megaton", "Rivet City", "Tenpenny Tower", "Vault 101", "Paradise Falls", "Canterbury Commons"];

        for (i, title) in titles.iter().enumerate() {
            Mock::given(method("GET"))
                .and(path("/api.php"))
                .and(query_param("action", "query"))
                .and(query_param("titles", *title))
                .respond_with(Arrivals {
                    seen: seen.clone(),
                    body: query_body(i as u64 + 1, title, "A settlement."),
                    delay,
                })
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/api.php"))
                .and(query_param("action", "parse"))
                .and(query_param("page", *title))
                .respond_with(Arrivals {
                    seen: seen.clone(),
                    body: parse_body(title, "<p>Body.</p>", &[]),
                    delay,
                })
                .mount(&server)
                .await;
        }

        let mut config = config(&server);
        config.concurrency = 2;
        let crawler = Crawler::new(config).unwrap();
        let seeds: Vec<_> = titles.iter().map(|t| seed(t, 0)).collect();
        let output = crawler.crawl(&seeds).await;
        assert_eq!(output.pages.len(), titles.len());

        let mut arrivals = seen.lock().unwrap().clone();
        arrivals.sort();
        assert_eq!(arrivals.len(), titles.len() * 2);

        // A worker sends its next request only after the previous answer, so
        // any three arrivals span at least one delay when at most two workers run.
        for window in arrivals.windows(3) {
            assert!(window[2] - window[0] >= delay, "three requests overlapped");
        }
        // Both workers did run side by side.
        assert!(arrivals[1] - arrivals[0] < delay);
    }

    #[tokio::test]
    async fn rate_limit_wait_does_not_count_against_page_timeout() {
        let server = MockServer::start().await;
        mount_page(&server, 1, "Megaton", &[]).await;
        mount_page(&server, 2, "Rivet City", &[]).await;
        mount_page(&server, 3, "Tenpenny Tower", &[]).await;

        // Six requests at 400ms spacing take two seconds, twice the page budget.
        let mut config = config(&server);
        config.rate_limit_ms = 400;
        config.page_timeout_secs = 1;
        let crawler = Crawler::new(config).unwrap();
        let output = crawler
            .crawl(&[seed("Megaton", 0), seed("Rivet City", 0), seed("Tenpenny Tower", 0)])
            .await;

        assert!(output.skips.is_empty(), "skipped: {:?}", output.skips);
        assert_eq!(output.pages.len(), 3);
    }
}
