//! Curated seed and category file parsing.
//!
//! Both files are JSON, either a bare list of strings or an object holding the
//! list under `seed_urls` / `category_urls`. Entries may be article URLs or titles.

use std::path::Path;

use serde::Deserialize;

use loreforge_shared::wiki::{normalize_category_title, url_to_title};
use loreforge_shared::{LoreforgeError, Result};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListFile {
    Bare(Vec<String>),
    Wrapped {
        #[serde(
            default,
            alias = "seed_urls",
            alias = "category_urls",
            alias = "seeds",
            alias = "categories"
        )]
        entries: Vec<String>,
    },
}

impl ListFile {
    fn into_entries(self) -> Vec<String> {
        match self {
            Self::Bare(entries) | Self::Wrapped { entries } => entries,
        }
    }
}

fn parse_list(content: &str, what: &str) -> Result<Vec<String>> {
    let file: ListFile = serde_json::from_str(content)
        .map_err(|e| LoreforgeError::parse(format!("{what}: expected a list or object: {e}")))?;
    Ok(file.into_entries())
}

/// Parse direct seed titles, dropping foreign/invalid entries and duplicates.
pub fn parse_seed_titles(content: &str, wiki_host: &str) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for entry in parse_list(content, "seed file")? {
        if let Some(title) = url_to_title(&entry, wiki_host) {
            if !out.contains(&title) {
                out.push(title);
            }
        }
    }
    Ok(out)
}

/// Parse category references into `Category:` titles, deduplicated in order.
pub fn parse_category_titles(content: &str, wiki_host: &str) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for entry in parse_list(content, "category file")? {
        if let Some(title) = normalize_category_title(&entry, wiki_host) {
            if !out.contains(&title) {
                out.push(title);
            }
        }
    }
    Ok(out)
}

/// Read and parse a seed file from disk.
pub fn load_seed_titles(path: &Path, wiki_host: &str) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| LoreforgeError::io(path, e))?;
    parse_seed_titles(&content, wiki_host)
}

/// Read and parse a category file from disk.
pub fn load_category_titles(path: &Path, wiki_host: &str) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| LoreforgeError::io(path, e))?;
    parse_category_titles(&content, wiki_host)
}
