use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use roxmltree::{Document, Node};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::entities::decode_entities;
use super::repair::{
    declare_missing_namespaces, extract_embedded_feed, repair_markup, sanitize,
    DEFAULT_NAMESPACES,
};
use super::types::{DocumentKind, FeedItem, FeedKind, ParsedFeed};

const SUMMARY_LIMIT: usize = 1000;
const UNTITLED: &str = "No Title";
const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
const ATOM_03_NS: &str = "http://purl.org/atom/ns#";

static IMG_SRC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img[^>]+src\s*=\s*["']([^"']+)["']"#).expect("static regex")
});
static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

#[derive(Debug, thiserror::Error)]
pub enum FeedParseError {
    #[error("feed payload is empty")]
    EmptyPayload,
    #[error("feed is not well-formed xml even after repair: {0}")]
    Malformed(String),
    #[error("unsupported feed root element `{0}`")]
    UnsupportedRoot(String),
}

/// Parses an RSS 2.0, RSS 1.0 (RDF) or Atom payload into normalized items.
///
/// The payload goes through a sanitize pass first. If it still does not parse,
/// the markup repair pass runs once before giving up.
pub fn parse_feed(raw: &[u8], kind: FeedKind) -> Result<ParsedFeed, FeedParseError> {
    let decoded = String::from_utf8_lossy(raw);
    if decoded.trim().is_empty() {
        return Err(FeedParseError::EmptyPayload);
    }

    let extracted = extract_embedded_feed(&decoded);
    let sanitized = sanitize(&extracted);
    let prepared = declare_missing_namespaces(&sanitized);

    let (mut parsed, repaired) = match read_document(&prepared) {
        Ok(parsed) => (parsed, false),
        Err(FeedParseError::Malformed(first_error)) => {
            debug!(?kind, error = %first_error, "feed markup rejected, running repair pass");
            let repaired = repair_markup(&prepared);
            let parsed = read_document(&repaired).map_err(|error| {
                warn!(?kind, error = %error, "feed markup still rejected after repair");
                error
            })?;
            (parsed, true)
        }
        Err(other) => return Err(other),
    };

    parsed.repaired = repaired;
    for item in &mut parsed.items {
        apply_source_rules(item, kind);
    }
    Ok(parsed)
}

fn read_document(text: &str) -> Result<ParsedFeed, FeedParseError> {
    let document =
        Document::parse(text).map_err(|error| FeedParseError::Malformed(error.to_string()))?;
    let root = document.root_element();
    let namespaces = Namespaces::collect(&document);

    let (kind, title, entries): (DocumentKind, String, Vec<Node>) =
        match root.tag_name().name() {
            "rss" => {
                let channel = child(root, "channel");
                let entries = channel
                    .map(|channel| children(channel, "item").collect())
                    .unwrap_or_default();
                let title = channel.and_then(|c| child_text(c, "title")).unwrap_or_default();
                (DocumentKind::Rss, title, entries)
            }
            "RDF" => {
                let title = root
                    .children()
                    .find(|node| node.tag_name().name() == "channel")
                    .and_then(|c| local_text(c, "title"))
                    .unwrap_or_default();
                let entries = root
                    .descendants()
                    .filter(|node| node.is_element() && node.tag_name().name() == "item")
                    .collect();
                (DocumentKind::Rdf, title, entries)
            }
            "feed" => {
                let atom = namespaces.uri("atom");
                let title = atom_child(root, atom)
                    .find(|node| node.tag_name().name() == "title")
                    .map(text_of)
                    .unwrap_or_default();
                let entries = atom_child(root, atom)
                    .filter(|node| node.tag_name().name() == "entry")
                    .collect();
                (DocumentKind::Atom, title, entries)
            }
            other => return Err(FeedParseError::UnsupportedRoot(other.to_string())),
        };

    let items = entries
        .into_iter()
        .map(|entry| match kind {
            DocumentKind::Atom => atom_item(entry, &namespaces),
            DocumentKind::Rss | DocumentKind::Rdf => rss_item(entry, &namespaces),
        })
        .collect();

    Ok(ParsedFeed {
        document: kind,
        title: decode_entities(title.trim()),
        items,
        repaired: false,
    })
}

/// Prefix to URI map built from the document's own declarations, with the
/// well-known defaults filling any gap.
struct Namespaces {
    by_prefix: HashMap<String, String>,
}

impl Namespaces {
    fn collect(document: &Document) -> Self {
        let mut by_prefix = HashMap::new();
        for node in document.descendants().filter(Node::is_element) {
            for namespace in node.namespaces() {
                if let Some(prefix) = namespace.name() {
                    by_prefix
                        .entry(prefix.to_string())
                        .or_insert_with(|| namespace.uri().to_string());
                }
            }
        }
        for (prefix, uri) in DEFAULT_NAMESPACES {
            by_prefix
                .entry(prefix.to_string())
                .or_insert_with(|| uri.to_string());
        }
        // Atom 0.3 feeds keep the same element names under an older namespace.
        let root = document.root_element();
        if root.tag_name().name() == "feed" && root.tag_name().namespace() == Some(ATOM_03_NS) {
            by_prefix.insert("atom".to_string(), ATOM_03_NS.to_string());
        }
        Self { by_prefix }
    }

    fn uri(&self, prefix: &str) -> &str {
        self.by_prefix.get(prefix).map(String::as_str).unwrap_or("")
    }

    fn find<'a, 'input>(
        &self,
        node: Node<'a, 'input>,
        prefix: &str,
        local: &str,
    ) -> Option<Node<'a, 'input>> {
        let uri = self.uri(prefix);
        node.children().find(|child| {
            child.is_element()
                && child.tag_name().name() == local
                && child.tag_name().namespace() == Some(uri)
        })
    }

    fn text(&self, node: Node, prefix: &str, local: &str) -> Option<String> {
        self.find(node, prefix, local)
            .map(text_of)
            .filter(|text| !text.is_empty())
    }
}

fn rss_item(item: Node, namespaces: &Namespaces) -> FeedItem {
    let title = local_text(item, "title")
        .map(|title| clean_text(&title))
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    let link = local_text(item, "link")
        .or_else(|| {
            child(item, "link")
                .and_then(|node| node.attribute("href"))
                .map(|href| href.trim().to_string())
        })
        .or_else(|| dangling_link_text(item))
        .or_else(|| {
            namespaces
                .find(item, "atom", "link")
                .and_then(|node| node.attribute("href"))
                .map(|href| href.trim().to_string())
        })
        .or_else(|| {
            item.attribute((RDF_NS, "about"))
                .map(ToString::to_string)
        })
        .unwrap_or_default();

    let excerpt = local_text(item, "description")
        .or_else(|| namespaces.text(item, "content", "encoded"))
        .unwrap_or_default();

    let published_at = local_text(item, "pubDate")
        .or_else(|| namespaces.text(item, "dc", "date"))
        .and_then(|value| parse_date(&value));

    let author = local_text(item, "author")
        .or_else(|| namespaces.text(item, "dc", "creator"))
        .map(|author| clean_text(&author))
        .filter(|author| !author.is_empty());

    let image_url = first_image(&excerpt)
        .or_else(|| {
            namespaces
                .text(item, "content", "encoded")
                .and_then(|html| first_image(&html))
        })
        .or_else(|| {
            item.children()
                .find(|node| {
                    node.tag_name().name() == "enclosure"
                        && node
                            .attribute("type")
                            .is_some_and(|kind| kind.starts_with("image"))
                })
                .and_then(|node| node.attribute("url"))
                .map(ToString::to_string)
        })
        .or_else(|| media_image(item, namespaces));

    FeedItem {
        guid: resolve_guid(local_text(item, "guid"), &link, &title, &excerpt),
        title,
        summary: summarize(&excerpt),
        author,
        category: local_text(item, "category").map(|category| clean_text(&category)),
        published_at,
        image_url,
        link,
        visit_url: None,
        cover_image_url: None,
        raw_html: (!excerpt.is_empty()).then_some(excerpt),
        feed_type: None,
    }
}

fn atom_item(entry: Node, namespaces: &Namespaces) -> FeedItem {
    let atom = namespaces.uri("atom");
    let field = |local: &str| {
        atom_child(entry, atom)
            .find(|node| node.tag_name().name() == local)
            .map(text_of)
            .filter(|text| !text.is_empty())
    };

    let title = field("title")
        .map(|title| clean_text(&title))
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    let links: Vec<Node> = atom_child(entry, atom)
        .filter(|node| node.tag_name().name() == "link")
        .collect();
    let link = links
        .iter()
        .find(|node| node.attribute("rel").is_none_or(|rel| rel == "alternate"))
        .or_else(|| links.first())
        .and_then(|node| node.attribute("href"))
        .map(|href| href.trim().to_string())
        .unwrap_or_default();

    let excerpt = field("summary").or_else(|| field("content")).unwrap_or_default();
    let published_at = field("published")
        .or_else(|| field("updated"))
        .or_else(|| field("issued"))
        .or_else(|| field("modified"))
        .and_then(|value| parse_date(&value));

    let author = atom_child(entry, atom)
        .find(|node| node.tag_name().name() == "author")
        .and_then(|author| {
            atom_child(author, atom)
                .find(|node| node.tag_name().name() == "name")
                .map(text_of)
        })
        .map(|name| clean_text(&name))
        .filter(|name| !name.is_empty());

    let category = atom_child(entry, atom)
        .find(|node| node.tag_name().name() == "category")
        .and_then(|node| node.attribute("term"))
        .map(clean_text)
        .filter(|term| !term.is_empty());

    let image_url = first_image(&excerpt)
        .or_else(|| field("content").and_then(|html| first_image(&html)))
        .or_else(|| media_image(entry, namespaces));

    FeedItem {
        guid: resolve_guid(field("id"), &link, &title, &excerpt),
        title,
        summary: summarize(&excerpt),
        author,
        category,
        published_at,
        image_url,
        link,
        visit_url: None,
        cover_image_url: None,
        raw_html: (!excerpt.is_empty()).then_some(excerpt),
        feed_type: None,
    }
}

fn apply_source_rules(item: &mut FeedItem, kind: FeedKind) {
    match kind {
        FeedKind::Betalist if !item.link.is_empty() => {
            item.visit_url = Some(format!("{}/visit", item.link.trim_end_matches('/')));
        }
        FeedKind::Decohack => {
            item.cover_image_url = item.raw_html.as_deref().and_then(first_image);
        }
        _ => {}
    }
    if kind != FeedKind::Decohack {
        item.raw_html = None;
    }
}

/// Guid, else link, else a digest of what the entry does have. Never empty.
fn resolve_guid(guid: Option<String>, link: &str, title: &str, excerpt: &str) -> String {
    if let Some(guid) = guid.map(|guid| guid.trim().to_string()).filter(|g| !g.is_empty()) {
        return guid;
    }
    if !link.is_empty() {
        return link.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(excerpt.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("urn:sha256:{hex}")
}

fn summarize(excerpt: &str) -> String {
    clean_text(excerpt).chars().take(SUMMARY_LIMIT).collect()
}

/// Drops markup, decodes entities and collapses whitespace.
pub fn clean_text(html: &str) -> String {
    let stripped = MARKUP.replace_all(html, " ");
    let decoded = decode_entities(&stripped);
    WHITESPACE.replace_all(&decoded, " ").trim().to_string()
}

pub fn first_image(html: &str) -> Option<String> {
    IMG_SRC
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|src| decode_entities(src.as_str()))
}

fn media_image(node: Node, namespaces: &Namespaces) -> Option<String> {
    namespaces
        .find(node, "media", "thumbnail")
        .or_else(|| {
            let uri = namespaces.uri("media");
            node.children().find(|child| {
                child.tag_name().name() == "content"
                    && child.tag_name().namespace() == Some(uri)
                    && child.attribute("medium").is_none_or(|medium| medium == "image")
            })
        })
        .and_then(|node| node.attribute("url"))
        .map(ToString::to_string)
}

/// RFC 2822, RFC 3339, then a few layouts feeds commonly get wrong.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for layout in ["%a, %d %b %Y %H:%M:%S %z", "%d %b %Y %H:%M:%S %z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(parsed) = DateTime::parse_from_str(value, layout) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for layout in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%a, %d %b %Y %H:%M:%S",
    ] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, layout) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|parsed| parsed.and_utc())
}

/// `<link/>https://...` is well-formed, so the URL survives only as the
/// text node after the empty element.
fn dangling_link_text(item: Node) -> Option<String> {
    let link = child(item, "link").filter(|node| !node.has_children())?;
    link.next_sibling()
        .filter(Node::is_text)
        .and_then(|node| node.text())
        .and_then(|text| text.split_whitespace().next())
        .map(ToString::to_string)
}

fn child<'a, 'input>(node: Node<'a, 'input>, local: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|child| {
        child.is_element()
            && child.tag_name().name() == local
            && child.tag_name().namespace().is_none()
    })
}

fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    local: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |child| child.is_element() && child.tag_name().name() == local)
}

fn child_text(node: Node, local: &str) -> Option<String> {
    child(node, local).map(text_of).filter(|text| !text.is_empty())
}

/// Text of the first child with this local name, in the element's own
/// namespace or none (RDF items live in the RSS 1.0 namespace).
fn local_text(node: Node, local: &str) -> Option<String> {
    let own = node.tag_name().namespace();
    node.children()
        .find(|child| {
            child.is_element()
                && child.tag_name().name() == local
                && (child.tag_name().namespace().is_none() || child.tag_name().namespace() == own)
        })
        .map(text_of)
        .filter(|text| !text.is_empty())
}

/// Children in the Atom namespace, or un-namespaced for feeds that forgot it.
fn atom_child<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    atom: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |child| {
        child.is_element() && child.tag_name().namespace().is_none_or(|uri| uri == atom)
    })
}

/// All text below a node (CDATA included), trimmed.
fn text_of(node: Node) -> String {
    let text: Cow<str> = match node.text() {
        Some(text) if node.children().count() <= 1 => Cow::Borrowed(text),
        _ => Cow::Owned(
            node.descendants()
                .filter(Node::is_text)
                .filter_map(|text| text.text())
                .collect(),
        ),
    };
    text.trim().to_string()
}
