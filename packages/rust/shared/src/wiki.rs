//! Title and URL conventions for MediaWiki-hosted sources.

use url::Url;

/// Default wiki host for article URLs.
pub const DEFAULT_WIKI_HOST: &str = "fallout.fandom.com";

/// Path marker preceding the title in article URLs.
const ARTICLE_MARKER: &str = "/wiki/";

/// Normalize a title the way MediaWiki does: underscores become spaces,
/// runs of whitespace collapse, and the first letter is upper-cased.
pub fn canonical_title(raw: &str) -> String {
    let spaced = raw.replace('_', " ");
    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Convert a seed value (article URL or bare title) into a canonical title.
///
/// Returns `None` for empty values, URLs on another host, and URLs that are
/// not article paths.
pub fn url_to_title(value: &str, wiki_host: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if value.starts_with("http://") || value.starts_with("https://") {
        let parsed = Url::parse(value).ok()?;
        if parsed.host_str().is_some_and(|h| h != wiki_host) {
            return None;
        }
        let (_, raw) = parsed.path().split_once(ARTICLE_MARKER)?;
        if raw.is_empty() {
            return None;
        }
        let decoded = urlencoding::decode(raw).ok()?;
        let title = canonical_title(&decoded);
        return (!title.is_empty()).then_some(title);
    }

    let title = canonical_title(value);
    (!title.is_empty()).then_some(title)
}

/// Build the article URL for a title.
pub fn title_to_url(title: &str, wiki_host: &str) -> String {
    let slug = title.replace(' ', "_");
    format!("https://{wiki_host}{ARTICLE_MARKER}{}", urlencoding::encode(&slug))
}

/// Normalize a category reference (URL, `Category:X`, or bare `X`) to `Category:X`.
pub fn normalize_category_title(value: &str, wiki_host: &str) -> Option<String> {
    let title = url_to_title(value, wiki_host)?;
    if title.starts_with("Category:") {
        Some(title)
    } else {
        Some(format!("Category:{title}"))
    }
}

/// Namespace prefix of a title (`"User talk"` for `"User talk:Foo"`), if any.
pub fn namespace_prefix(title: &str) -> Option<&str> {
    title.split_once(':').map(|(ns, _)| ns.trim())
}
