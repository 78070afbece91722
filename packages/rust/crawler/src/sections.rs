//! Section extraction from rendered article HTML.
//!
//! Splits the parser output into heading-bounded sections and lifts the
//! structured parts (portable infoboxes, two-column tables, `Key: Value`
//! list items, definition lists) into [`SpecEntry`] pairs.

use scraper::{ElementRef, Html};

use loreforge_shared::{PageSection, SectionTable, SpecEntry};

/// Longer "keys" are prose that happens to contain a colon.
const MAX_ENTRY_KEY_CHARS: usize = 48;

const NOISE_TAGS: &[&str] = &["script", "style", "noscript", "figure", "link", "meta"];

const NOISE_CLASSES: &[&str] = &[
    "mw-editsection",
    "reference",
    "references",
    "mw-references-wrap",
    "toc",
    "navbox",
    "printfooter",
    "noprint",
    "thumb",
    "mw-empty-elt",
];

const BLOCK_TAGS: &[&str] = &["p", "div", "li", "tr", "td", "th", "dd", "dt", "ul", "ol", "table"];

/// Split rendered article HTML into sections.
///
/// The lead (content before the first heading) is returned with an empty
/// heading and level 0. Sections without any content are dropped.
pub fn extract_sections(html: &str) -> Vec<PageSection> {
    let doc = Html::parse_fragment(html);
    let root = doc.root_element();
    let content = root
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|el| has_class(el, "mw-parser-output"))
        .unwrap_or(root);

    let mut builder = SectionBuilder::default();
    builder.walk(content);
    builder.finish()
}

/// Split `Key: Value` text into an entry when it looks like one.
pub fn split_entry(text: &str) -> Option<SpecEntry> {
    let (key, value) = text.split_once(':')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty()
        || value.is_empty()
        || value.starts_with("//")
        || key.chars().count() > MAX_ENTRY_KEY_CHARS
    {
        return None;
    }
    Some(SpecEntry {
        key: key.to_string(),
        value: value.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tree walking
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SectionBuilder {
    done: Vec<PageSection>,
    current: PageSection,
}

impl SectionBuilder {
    fn walk(&mut self, parent: ElementRef<'_>) {
        for child in parent.children() {
            if let Some(text) = child.value().as_text() {
                self.push_paragraph(squash(text));
                continue;
            }
            let Some(el) = ElementRef::wrap(child) else {
                continue;
            };
            if is_noise(&el) {
                continue;
            }

            match el.value().name() {
                "h2" | "h3" | "h4" => self.start_section(el),
                "ul" | "ol" => self.list(el),
                "dl" => self.definition_list(el),
                "table" => self.table(el),
                "aside" if has_class(&el, "portable-infobox") => self.infobox(el),
                "div" if has_class(&el, "mw-heading") => {
                    let heading = el
                        .children()
                        .filter_map(ElementRef::wrap)
                        .find(|h| matches!(h.value().name(), "h2" | "h3" | "h4"));
                    match heading {
                        Some(h) => self.start_section(h),
                        None => self.push_paragraph(text_of(el)),
                    }
                }
                "div" | "section" | "aside" | "center" => self.walk(el),
                _ => self.push_paragraph(text_of(el)),
            }
        }
    }

    fn start_section(&mut self, heading: ElementRef<'_>) {
        let finished = std::mem::take(&mut self.current);
        if !is_empty(&finished) {
            self.done.push(finished);
        }
        let level = heading.value().name()[1..].parse().unwrap_or(2);
        self.current = PageSection {
            heading: text_of(heading),
            level,
            ..PageSection::default()
        };
    }

    fn push_paragraph(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        if !self.current.text.is_empty() {
            self.current.text.push('\n');
        }
        self.current.text.push_str(&text);
    }

    fn list(&mut self, list: ElementRef<'_>) {
        for item in list
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| el.value().name() == "li")
        {
            let text = text_of(item);
            if text.is_empty() {
                continue;
            }
            if let Some(entry) = split_entry(&text) {
                self.current.entries.push(entry);
            }
            self.current.items.push(text);
        }
    }

    fn definition_list(&mut self, list: ElementRef<'_>) {
        let mut pending_key: Option<String> = None;
        for el in list.children().filter_map(ElementRef::wrap) {
            match el.value().name() {
                "dt" => pending_key = Some(text_of(el)),
                "dd" => {
                    let value = text_of(el);
                    match pending_key.take() {
                        Some(key) if !key.is_empty() && !value.is_empty() => {
                            self.current.entries.push(SpecEntry { key, value });
                        }
                        _ => self.push_paragraph(value),
                    }
                }
                _ => {}
            }
        }
    }

    fn infobox(&mut self, aside: ElementRef<'_>) {
        for data in aside
            .descendants()
            .filter_map(ElementRef::wrap)
            .filter(|el| has_class(el, "pi-data"))
        {
            let label = find_class(data, "pi-data-label").map(text_of).filter(|l| !l.is_empty());
            let key = label.or_else(|| data.value().attr("data-source").map(str::to_string));
            let value = find_class(data, "pi-data-value").map(text_of).unwrap_or_default();

            if let Some(key) = key {
                if !value.is_empty() {
                    self.current.entries.push(SpecEntry { key, value });
                }
            }
        }
    }

    fn table(&mut self, table: ElementRef<'_>) {
        let rows: Vec<(Vec<String>, bool)> = table
            .descendants()
            .filter_map(ElementRef::wrap)
            .filter(|el| el.value().name() == "tr")
            .map(|tr| {
                let cells: Vec<ElementRef<'_>> = tr
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|c| matches!(c.value().name(), "th" | "td"))
                    .collect();
                let all_header = !cells.is_empty() && cells.iter().all(|c| c.value().name() == "th");
                (cells.into_iter().map(text_of).collect(), all_header)
            })
            .filter(|(cells, _): &(Vec<String>, bool)| cells.iter().any(|c| !c.is_empty()))
            .collect();

        if rows.is_empty() {
            return;
        }

        let key_value = rows.iter().all(|(cells, _)| cells.len() <= 2)
            && rows.iter().any(|(cells, _)| cells.len() == 2);

        if key_value {
            for (idx, (cells, all_header)) in rows.into_iter().enumerate() {
                if cells.len() != 2 || (idx == 0 && all_header) {
                    continue;
                }
                let mut cells = cells.into_iter();
                let key = cells.next().unwrap_or_default();
                let value = cells.next().unwrap_or_default();
                if !key.is_empty() && !value.is_empty() && key.chars().count() <= MAX_ENTRY_KEY_CHARS {
                    self.current.entries.push(SpecEntry { key, value });
                }
            }
            return;
        }

        let mut rows = rows.into_iter().peekable();
        let headers = match rows.peek() {
            Some((_, true)) => rows.next().map(|(cells, _)| cells).unwrap_or_default(),
            _ => Vec::new(),
        };
        self.current.tables.push(SectionTable {
            headers,
            rows: rows.map(|(cells, _)| cells).collect(),
        });
    }

    fn finish(mut self) -> Vec<PageSection> {
        let last = std::mem::take(&mut self.current);
        if !is_empty(&last) {
            self.done.push(last);
        }
        self.done
    }
}

fn is_empty(section: &PageSection) -> bool {
    section.text.is_empty()
        && section.entries.is_empty()
        && section.tables.is_empty()
        && section.items.is_empty()
}

fn has_class(el: &ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

fn find_class<'a>(el: ElementRef<'a>, class: &str) -> Option<ElementRef<'a>> {
    el.descendants()
        .filter_map(ElementRef::wrap)
        .find(|d| has_class(d, class))
}

fn is_noise(el: &ElementRef<'_>) -> bool {
    let value = el.value();
    NOISE_TAGS.contains(&value.name())
        || value.id() == Some("toc")
        || value.classes().any(|c| NOISE_CLASSES.contains(&c))
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            if is_noise(&child_el) {
                continue;
            }
            let name = child_el.value().name();
            if name == "br" {
                out.push(' ');
                continue;
            }
            collect_text(child_el, out);
            if BLOCK_TAGS.contains(&name) {
                out.push(' ');
            }
        }
    }
}

/// Visible text of an element with whitespace collapsed.
fn text_of(el: ElementRef<'_>) -> String {
    let mut raw = String::new();
    collect_text(el, &mut raw);
    squash(&raw)
}

fn squash(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE: &str = r#"
<div class="mw-parser-output">
  <aside class="portable-infobox">
    <h2 class="pi-title">T-45 power armor</h2>
    <div class="pi-item pi-data" data-source="games">
      <h3 class="pi-data-label">Games</h3>
      <div class="pi-data-value">Fallout 4<br>Fallout 76</div>
    </div>
    <div class="pi-item pi-data" data-source="manufacturer">
      <div class="pi-data-value">West Tek</div>
    </div>
  </aside>
  <p>The <b>T-45 power armor</b> is the first production model of power armor.<sup class="reference">[1]</sup></p>
  <div id="toc" class="toc"><ul><li>1 Background</li></ul></div>
  <div class="mw-heading mw-heading2"><h2 id="Background">Background</h2><span class="mw-editsection">[edit]</span></div>
  <p>Deployed by the U.S. Army in 2067.</p>
  <ul>
    <li>Armor rating: 260</li>
    <li>Used by the Brotherhood of Steel</li>
  </ul>
  <h3>Parts <span class="mw-editsection">[edit]</span></h3>
  <table class="va-table">
    <tr><th>Part</th><th>Damage resistance</th><th>Weight</th></tr>
    <tr><td>Helmet</td><td>33</td><td>9</td></tr>
    <tr><td>Torso</td><td>55</td><td>16</td></tr>
  </table>
  <table>
    <tr><td>Value</td><td>2500</td></tr>
    <tr><td>Weight</td><td>70</td></tr>
  </table>
  <h2>Empty</h2>
  <h2>Notes</h2>
  <dl><dt>Base ID</dt><dd>00154abf</dd></dl>
</div>"#;

    #[test]
    fn splits_lead_and_headings() {
        let sections = extract_sections(ARTICLE);
        let headings: Vec<_> = sections.iter().map(|s| (s.heading.as_str(), s.level)).collect();
        assert_eq!(
            headings,
            vec![("", 0), ("Background", 2), ("Parts", 3), ("Notes", 2)]
        );

        let lead = &sections[0];
        assert_eq!(
            lead.text,
            "The T-45 power armor is the first production model of power armor."
        );
    }

    #[test]
    fn infobox_becomes_entries() {
        let sections = extract_sections(ARTICLE);
        let lead = &sections[0];
        assert_eq!(
            lead.entries,
            vec![
                SpecEntry { key: "Games".into(), value: "Fallout 4 Fallout 76".into() },
                SpecEntry { key: "manufacturer".into(), value: "West Tek".into() },
            ]
        );
    }

    #[test]
    fn lists_tables_and_definitions() {
        let sections = extract_sections(ARTICLE);

        let background = &sections[1];
        assert_eq!(background.text, "Deployed by the U.S. Army in 2067.");
        assert_eq!(background.items.len(), 2);
        assert_eq!(
            background.entries,
            vec![SpecEntry { key: "Armor rating".into(), value: "260".into() }]
        );

        let parts = &sections[2];
        assert_eq!(parts.tables.len(), 1);
        assert_eq!(parts.tables[0].headers, vec!["Part", "Damage resistance", "Weight"]);
        assert_eq!(parts.tables[0].rows[1], vec!["Torso", "55", "16"]);
        assert_eq!(parts.entries.len(), 2);
        assert_eq!(parts.entries[0].key, "Value");

        let notes = &sections[3];
        assert_eq!(notes.entries[0].value, "00154abf");
    }

    #[test]
    fn entry_splitting_rejects_prose() {
        assert!(split_entry("Weight: 70").is_some());
        assert!(split_entry("See https://fallout.fandom.com").is_none());
        assert!(split_entry("No colon here").is_none());
        assert!(split_entry(": missing key").is_none());
        let long = format!("{}: value", "word ".repeat(20));
        assert!(split_entry(&long).is_none());
    }

    #[test]
    fn plain_fragment_without_wrapper() {
        let sections = extract_sections("<p>Vault 101 is a vault.</p>");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].text, "Vault 101 is a vault.");
    }
}
