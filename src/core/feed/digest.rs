use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::parser::{clean_text, first_image};
use super::types::{DecohackProduct, StoredRecord};

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h[23][^>]*>(.*?)</h[23]\s*>").expect("static regex"));
static PARAGRAPH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<p\b[^>]*>(.*?)</p\s*>").expect("static regex"));
static LINK_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*<a\b[^>]*>.*</a>\s*$").expect("static regex"));
static ANCHOR_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*href\s*=\s*["']([^"']+)["']"#).expect("static regex")
});
static NUMBERING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:(?:No\.|#)\s*)?\d+(?:\s*[.)、:：-]\s*|\s+)|[-*•]\s*)").expect("static regex")
});

/// Splits one daily digest into its products, one per `<h2>`/`<h3>` section.
///
/// Products are unique by name within a digest; the first section wins.
pub fn explode_digest(record: &StoredRecord, fetched_at: DateTime<Utc>) -> Vec<DecohackProduct> {
    let html = record
        .item
        .raw_html
        .as_deref()
        .or(record.full_content.as_deref())
        .unwrap_or_default();
    let publish_date = record
        .item
        .published_at
        .unwrap_or(fetched_at)
        .format("%Y-%m-%d")
        .to_string();

    let headings: Vec<_> = HEADING.captures_iter(html).collect();
    let mut seen = HashSet::new();
    let mut products = Vec::new();

    for (index, heading) in headings.iter().enumerate() {
        let (Some(whole), Some(inner)) = (heading.get(0), heading.get(1)) else {
            continue;
        };
        let section_end = headings
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map_or(html.len(), |next| next.start());
        let section = &html[whole.end()..section_end];

        let product_name = NUMBERING.replace(&clean_text(inner.as_str()), "").trim().to_string();
        if product_name.is_empty() || !seen.insert(product_name.clone()) {
            continue;
        }

        let mut paragraphs = PARAGRAPH
            .captures_iter(section)
            .filter_map(|caps| caps.get(1))
            .filter(|inner| !LINK_ONLY.is_match(inner.as_str()))
            .map(|inner| clean_text(inner.as_str()))
            .filter(|text| !text.is_empty());
        let tagline = paragraphs.next().or_else(|| {
            let text = clean_text(section);
            (!text.is_empty()).then_some(text)
        });
        let rest: Vec<String> = paragraphs.collect();

        products.push(DecohackProduct {
            product_name,
            tagline,
            description: (!rest.is_empty()).then(|| rest.join("\n")),
            product_url: ANCHOR_HREF
                .captures(section)
                .and_then(|caps| caps.get(1))
                .map(|href| href.as_str().trim().to_string()),
            image_url: first_image(section),
            ph_publish_date: publish_date.clone(),
            source_guid: record.item.guid.clone(),
        });
    }

    products
}
