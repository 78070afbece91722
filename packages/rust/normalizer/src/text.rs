//! Text helpers for identifiers, lore trimming, and year detection.

/// Identifier slug: lowercase word characters joined by `_`, at most 80 chars.
pub fn slugify(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_sep = false;

    for c in lowered.chars() {
        if c.is_alphanumeric() || c == '_' {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else if c.is_whitespace() || c == '-' {
            pending_sep = true;
        }
    }

    let slug: String = out.trim_matches('_').chars().take(80).collect();
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

/// Collapse all whitespace runs into single spaces.
pub fn squash(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The first `max` sentences of `text`, whitespace-collapsed.
///
/// A sentence ends at `.`, `!`, or `?` followed by a space.
pub fn first_sentences(text: &str, max: usize) -> String {
    let text = squash(text);
    let max = max.max(1);

    let mut count = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        if let Some(&(_, ' ')) = chars.peek() {
            count += 1;
            if count == max {
                return text[..i + c.len_utf8()].to_string();
            }
        }
    }
    text
}

/// First standalone four-digit year between 1900 and 2399.
pub fn find_year(text: &str) -> Option<u16> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|token| token.len() == 4 && token.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|year| (1900..=2399).contains(year))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs() {
        assert_eq!(slugify("T-45 power armor"), "t_45_power_armor");
        assert_eq!(slugify("Moriarty's Saloon"), "moriartys_saloon");
        assert_eq!(slugify("  --  "), "unknown");
        assert_eq!(slugify("Nuka-Cola Quantum!"), "nuka_cola_quantum");
        assert_eq!(slugify(&"a".repeat(120)).len(), 80);
    }

    #[test]
    fn sentences() {
        let text = "Vault 101 is a Vault-Tec vault.  It was sealed in 2077!  Nobody left? Until one day.";
        assert_eq!(first_sentences(text, 2), "Vault 101 is a Vault-Tec vault. It was sealed in 2077!");
        assert_eq!(first_sentences(text, 10), squash(text));
        assert_eq!(first_sentences("No terminator", 2), "No terminator");
        assert_eq!(first_sentences("", 2), "");
    }

    #[test]
    fn years() {
        assert_eq!(find_year("The Great War of 2077 ended everything."), Some(2077));
        assert_eq!(find_year("Model 1234 was built in 1969"), Some(1969));
        assert_eq!(find_year("serial v2077a"), None);
        assert_eq!(find_year("year 2500"), None);
    }
}
