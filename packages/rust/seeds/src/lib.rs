//! Seed catalog builder.
//!
//! Expands curated category references into their member articles via the
//! MediaWiki `categorymembers` list (following `cmcontinue` pagination),
//! merges them with the direct seed list, and tags every seed with the
//! categories it was found in. A category that fails to resolve is logged and
//! skipped; it never fails the catalog.

mod parser;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use loreforge_shared::wiki::title_to_url;
use loreforge_shared::{LoreforgeError, Result, Seed, SeedOrigin};

pub use parser::{load_category_titles, load_seed_titles, parse_category_titles, parse_seed_titles};

/// Upper bound on continuation requests for a single category.
const MAX_CONTINUATIONS: usize = 100;

// ---------------------------------------------------------------------------
// Category resolution
// ---------------------------------------------------------------------------

/// Resolves `Category:` titles into article titles through the wiki API.
pub struct CategoryResolver {
    client: Client,
    api_url: String,
    member_cap: usize,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    query: Option<MembersQuery>,
    #[serde(default, rename = "continue")]
    cont: Option<MembersContinue>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct MembersQuery {
    #[serde(default)]
    categorymembers: Vec<Member>,
}

#[derive(Debug, Deserialize)]
struct Member {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct MembersContinue {
    #[serde(default)]
    cmcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    info: String,
}

impl CategoryResolver {
    /// Build a resolver with its own HTTP client.
    pub fn new(api_url: &str, user_agent: &str, timeout_secs: u64, member_cap: usize) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LoreforgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.to_string(),
            member_cap,
        })
    }

    /// All article-namespace member titles of `category`, up to the member cap.
    ///
    /// Titles containing `:` are dropped; order follows the API.
    #[instrument(skip(self))]
    pub async fn members(&self, category: &str) -> Result<Vec<String>> {
        let mut members: Vec<String> = Vec::new();
        let mut cont: Option<String> = None;

        for _ in 0..MAX_CONTINUATIONS {
            let mut params: Vec<(&str, String)> = vec![
                ("action", "query".into()),
                ("format", "json".into()),
                ("formatversion", "2".into()),
                ("list", "categorymembers".into()),
                ("cmtitle", category.to_string()),
                ("cmnamespace", "0".into()),
                ("cmlimit", "max".into()),
            ];
            if let Some(token) = &cont {
                params.push(("cmcontinue", token.clone()));
            }

            let response = self
                .client
                .get(&self.api_url)
                .query(&params)
                .send()
                .await
                .map_err(|e| LoreforgeError::Network(format!("{category}: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(LoreforgeError::Network(format!("{category}: HTTP {status}")));
            }

            let body: MembersResponse = response
                .json()
                .await
                .map_err(|e| LoreforgeError::parse(format!("{category}: malformed response: {e}")))?;

            if let Some(err) = body.error {
                return Err(LoreforgeError::Network(format!(
                    "{category}: API error {}: {}",
                    err.code, err.info
                )));
            }

            for member in body.query.map(|q| q.categorymembers).unwrap_or_default() {
                if member.title.is_empty() || member.title.contains(':') {
                    continue;
                }
                if !members.contains(&member.title) {
                    members.push(member.title);
                }
                if members.len() >= self.member_cap {
                    return Ok(members);
                }
            }

            let next = body.cont.and_then(|c| c.cmcontinue);
            match next {
                Some(token) if cont.as_deref() != Some(token.as_str()) => cont = Some(token),
                _ => break,
            }
        }

        debug!(category, members = members.len(), "category resolved");
        Ok(members)
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Options for catalog building.
#[derive(Debug, Clone)]
pub struct SeedCatalogConfig {
    /// Host for building seed URLs.
    pub wiki_host: String,
    /// Hop budget given to every seed.
    pub hop_budget: u32,
}

/// A category that could not be resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryFailure {
    pub category: String,
    pub error: String,
}

/// Counts describing a built catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSummary {
    pub generated_at: DateTime<Utc>,
    pub base_seed_count: usize,
    pub categories_count: usize,
    /// Titles returned by category resolution, before deduplication.
    pub resolved_members: usize,
    pub expanded_seed_count: usize,
    #[serde(default)]
    pub failed_categories: Vec<CategoryFailure>,
}

/// The ordered, deduplicated seed list plus its summary.
#[derive(Debug, Clone)]
pub struct SeedCatalog {
    pub seeds: Vec<Seed>,
    pub summary: CatalogSummary,
}

/// Build the seed catalog.
///
/// Direct seeds come first in input order, followed by category members in
/// category order. A title seen again only gains the extra category tag.
#[instrument(skip_all, fields(direct = direct.len(), categories = categories.len()))]
pub async fn build_catalog(
    resolver: &CategoryResolver,
    direct: &[String],
    categories: &[String],
    config: &SeedCatalogConfig,
) -> SeedCatalog {
    let mut seeds: Vec<Seed> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut failed_categories = Vec::new();
    let mut resolved_members = 0;

    for title in direct {
        if index.contains_key(title) {
            continue;
        }
        index.insert(title.clone(), seeds.len());
        seeds.push(Seed {
            title: title.clone(),
            url: title_to_url(title, &config.wiki_host),
            origin: SeedOrigin::Direct,
            categories: Vec::new(),
            hop_budget: config.hop_budget,
        });
    }

    for category in categories {
        let members = match resolver.members(category).await {
            Ok(members) => members,
            Err(e) => {
                warn!(category = %category, error = %e, "category resolution failed, skipping");
                failed_categories.push(CategoryFailure {
                    category: category.clone(),
                    error: e.to_string(),
                });
                continue;
            }
        };
        resolved_members += members.len();

        let tag = category.trim_start_matches("Category:").to_string();
        for title in members {
            match index.get(&title) {
                Some(&i) => {
                    if !seeds[i].categories.contains(&tag) {
                        seeds[i].categories.push(tag.clone());
                    }
                }
                None => {
                    index.insert(title.clone(), seeds.len());
                    seeds.push(Seed {
                        url: title_to_url(&title, &config.wiki_host),
                        title,
                        origin: SeedOrigin::Category,
                        categories: vec![tag.clone()],
                        hop_budget: config.hop_budget,
                    });
                }
            }
        }
    }

    let summary = CatalogSummary {
        generated_at: Utc::now(),
        base_seed_count: direct.len(),
        categories_count: categories.len(),
        resolved_members,
        expanded_seed_count: seeds.len(),
        failed_categories,
    };

    info!(
        seeds = summary.expanded_seed_count,
        failed = summary.failed_categories.len(),
        "seed catalog built"
    );

    SeedCatalog { seeds, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> SeedCatalogConfig {
        SeedCatalogConfig {
            wiki_host: "fallout.fandom.com".into(),
            hop_budget: 2,
        }
    }

    fn members_body(titles: &[&str], cont: Option<&str>) -> serde_json::Value {
        let members: Vec<_> = titles
            .iter()
            .map(|t| serde_json::json!({"ns": 0, "title": t}))
            .collect();
        let mut body = serde_json::json!({"query": {"categorymembers": members}});
        if let Some(token) = cont {
            body["continue"] = serde_json::json!({"cmcontinue": token, "continue": "-||"});
        }
        body
    }

    fn resolver(server: &MockServer, cap: usize) -> CategoryResolver {
        CategoryResolver::new(&format!("{}/api.php", server.uri()), "loreforge-test", 5, cap).unwrap()
    }

    #[tokio::test]
    async fn members_follow_pagination() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api.php"))
            .and(query_param("cmtitle", "Category:Power armor"))
            .and(query_param("cmcontinue", "page|2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(members_body(
                &["X-01 power armor", "T-60 power armor"],
                None,
            )))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api.php"))
            .and(query_param("cmtitle", "Category:Power armor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(members_body(
                &["T-45 power armor", "Talk:T-45 power armor", "T-51 power armor"],
                Some("page|2"),
            )))
            .with_priority(2)
            .mount(&server)
            .await;

        let members = resolver(&server, 200)
            .members("Category:Power armor")
            .await
            .unwrap();
        assert_eq!(
            members,
            vec![
                "T-45 power armor",
                "T-51 power armor",
                "X-01 power armor",
                "T-60 power armor"
            ]
        );
    }

    #[tokio::test]
    async fn members_respect_cap() {
        let server = MockServer::start().await;
        Mock::given(path("/api.php"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(members_body(&["A", "B", "C"], Some("more"))),
            )
            .mount(&server)
            .await;

        let members = resolver(&server, 2).members("Category:Letters").await.unwrap();
        assert_eq!(members, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn catalog_dedupes_and_tags() {
        let server = MockServer::start().await;

        Mock::given(path("/api.php"))
            .and(query_param("cmtitle", "Category:Power armor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(members_body(
                &["T-45 power armor", "Power armor"],
                None,
            )))
            .mount(&server)
            .await;

        Mock::given(path("/api.php"))
            .and(query_param("cmtitle", "Category:Fallout 4 armor"))
            .respond_with(ResponseTemplate::new(200).set_body_json(members_body(
                &["T-45 power armor", "Combat armor"],
                None,
            )))
            .mount(&server)
            .await;

        Mock::given(path("/api.php"))
            .and(query_param("cmtitle", "Category:Broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let direct = vec!["Power armor".to_string()];
        let categories = vec![
            "Category:Power armor".to_string(),
            "Category:Broken".to_string(),
            "Category:Fallout 4 armor".to_string(),
        ];

        let catalog = build_catalog(&resolver(&server, 200), &direct, &categories, &config()).await;
        let titles: Vec<_> = catalog.seeds.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Power armor", "T-45 power armor", "Combat armor"]);

        assert_eq!(catalog.seeds[0].origin, SeedOrigin::Direct);
        assert_eq!(catalog.seeds[0].categories, vec!["Power armor"]);
        assert_eq!(catalog.seeds[1].origin, SeedOrigin::Category);
        assert_eq!(catalog.seeds[1].categories, vec!["Power armor", "Fallout 4 armor"]);
        assert_eq!(
            catalog.seeds[2].url,
            "https://fallout.fandom.com/wiki/Combat_armor"
        );

        assert_eq!(catalog.summary.failed_categories.len(), 1);
        assert_eq!(catalog.summary.failed_categories[0].category, "Category:Broken");
        assert_eq!(catalog.summary.expanded_seed_count, 3);
        assert_eq!(catalog.summary.resolved_members, 4);
    }

    #[tokio::test]
    async fn api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(path("/api.php"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"code": "invalidtitle", "info": "Bad title"}
            })))
            .mount(&server)
            .await;

        let err = resolver(&server, 10).members("Category:<>").await.unwrap_err();
        assert!(err.to_string().contains("invalidtitle"));
    }
}
