use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Feed family. Each family owns one storage table and its own enrichment rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Betalist,
    TheVerge,
    IndieHackers,
    TechCrunch,
    YCombinator,
    Decohack,
}

impl FeedKind {
    pub const ALL: [FeedKind; 6] = [
        FeedKind::Betalist,
        FeedKind::TheVerge,
        FeedKind::IndieHackers,
        FeedKind::TechCrunch,
        FeedKind::YCombinator,
        FeedKind::Decohack,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            FeedKind::Betalist => "rss_betalist",
            FeedKind::TheVerge => "rss_theverge",
            FeedKind::IndieHackers => "rss_indiehackers",
            FeedKind::TechCrunch => "rss_techcrunch",
            FeedKind::YCombinator => "rss_ycombinator",
            FeedKind::Decohack => "rss_decohack",
        }
    }

    /// Whether the syndicated excerpt is too thin and the page must be fetched.
    pub fn needs_enrichment(&self) -> bool {
        matches!(
            self,
            FeedKind::IndieHackers | FeedKind::TechCrunch | FeedKind::YCombinator
        )
    }

    /// Resolves a configured feed name (`indiehackers_week`, `techcrunch_ai`, ...).
    pub fn from_feed_name(name: &str) -> Option<FeedKind> {
        let name = name.trim().to_lowercase();
        let kind = if name.starts_with("indiehackers") {
            FeedKind::IndieHackers
        } else if name.starts_with("techcrunch") {
            FeedKind::TechCrunch
        } else {
            match name.as_str() {
                "betalist" => FeedKind::Betalist,
                "theverge" => FeedKind::TheVerge,
                "ycombinator" | "hackernews" => FeedKind::YCombinator,
                "decohack" => FeedKind::Decohack,
                _ => return None,
            }
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DocumentKind {
    Rss,
    Rdf,
    Atom,
}

/// One parsed entry before deduplication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub guid: String,
    pub summary: String,
    pub author: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
    pub visit_url: Option<String>,
    pub cover_image_url: Option<String>,
    pub raw_html: Option<String>,
    pub feed_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedFeed {
    pub document: DocumentKind,
    pub title: String,
    pub items: Vec<FeedItem>,
    /// Whether the markup repair pass was needed before the document parsed.
    pub repaired: bool,
}

/// A feed item ready to be written: the item plus its full content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRecord {
    pub item: FeedItem,
    pub full_content: Option<String>,
    pub content_fetched_at: Option<DateTime<Utc>>,
}

/// One product exploded out of a daily digest entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecohackProduct {
    pub product_name: String,
    pub tagline: Option<String>,
    pub description: Option<String>,
    pub product_url: Option<String>,
    pub image_url: Option<String>,
    pub ph_publish_date: String,
    pub source_guid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_names_resolve_to_their_family() {
        assert_eq!(
            FeedKind::from_feed_name("indiehackers_alltime"),
            Some(FeedKind::IndieHackers)
        );
        assert_eq!(
            FeedKind::from_feed_name("techcrunch_ai"),
            Some(FeedKind::TechCrunch)
        );
        assert_eq!(FeedKind::from_feed_name("Betalist"), Some(FeedKind::Betalist));
        assert_eq!(FeedKind::from_feed_name("unknown"), None);
    }

    #[test]
    fn only_thin_feeds_need_enrichment() {
        let enriched: Vec<FeedKind> = FeedKind::ALL
            .into_iter()
            .filter(FeedKind::needs_enrichment)
            .collect();
        assert_eq!(
            enriched,
            vec![
                FeedKind::IndieHackers,
                FeedKind::TechCrunch,
                FeedKind::YCombinator
            ]
        );
    }
}
