use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::feed::fetcher::MirrorRule;
use super::feed::types::FeedKind;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                                      (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const DEFAULT_MIRRORS: &str = "https://rsshub.app=>https://rsshub.rssforever.com";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// One configured feed. `feed_type` tags Indie Hackers boards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    pub kind: FeedKind,
    pub feed_type: Option<String>,
}

impl FeedSource {
    pub fn new(name: &str, url: &str, kind: FeedKind) -> Self {
        let feed_type = match kind {
            FeedKind::IndieHackers => name
                .strip_prefix("indiehackers_")
                .filter(|suffix| !suffix.is_empty())
                .map(ToString::to_string),
            _ => None,
        };
        Self {
            name: name.to_string(),
            url: url.to_string(),
            kind,
            feed_type,
        }
    }
}

/// The feeds the pipeline ingests when nothing narrows the list.
pub fn default_feeds() -> Vec<FeedSource> {
    [
        ("betalist", "https://feeds.feedburner.com/BetaList", FeedKind::Betalist),
        (
            "theverge",
            "https://www.theverge.com/rss/ai-artificial-intelligence/index.xml",
            FeedKind::TheVerge,
        ),
        ("indiehackers_alltime", "https://ihrss.io/top/all-time", FeedKind::IndieHackers),
        ("indiehackers_month", "https://ihrss.io/top/month", FeedKind::IndieHackers),
        ("indiehackers_week", "https://ihrss.io/top/week", FeedKind::IndieHackers),
        ("indiehackers_today", "https://ihrss.io/top/today", FeedKind::IndieHackers),
        ("indiehackers_growth", "https://ihrss.io/group/growth", FeedKind::IndieHackers),
        ("indiehackers_developers", "https://ihrss.io/group/developers", FeedKind::IndieHackers),
        ("indiehackers_saas", "https://ihrss.io/group/saas-marketing", FeedKind::IndieHackers),
        ("techcrunch", "https://rsshub.app/techcrunch/news", FeedKind::TechCrunch),
        ("ycombinator", "https://rsshub.app/hackernews", FeedKind::YCombinator),
        ("decohack", "https://decohack.com/feed", FeedKind::Decohack),
    ]
    .into_iter()
    .map(|(name, url, kind)| FeedSource::new(name, url, kind))
    .collect()
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub feed_timeout: Duration,
    pub user_agent: String,
    pub mirrors: Vec<MirrorRule>,
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
    pub feeds: Vec<FeedSource>,
    pub retention_days: i64,
}

impl IngestConfig {
    /// Reads settings from the environment. `.env.local` wins over `.env`
    /// and both lose to variables already set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let database_max_connections = parse_or("DATABASE_MAX_CONNECTIONS", get("DATABASE_MAX_CONNECTIONS"), 5)?;
        let feed_timeout_secs = parse_or("FEED_TIMEOUT_SECS", get("FEED_TIMEOUT_SECS"), 30)?;
        let retention_days = parse_or("DATA_RETENTION_DAYS", get("DATA_RETENTION_DAYS"), 30)?;
        if retention_days < 1 {
            return Err(ConfigError::Invalid {
                key: "DATA_RETENTION_DAYS",
                value: retention_days.to_string(),
            });
        }

        let mirrors = parse_mirrors(&get("FEED_MIRRORS").unwrap_or_else(|| DEFAULT_MIRRORS.to_string()))?;
        let feeds = select_feeds(default_feeds(), get("INGEST_FEEDS").as_deref())?;

        Ok(Self {
            database_url,
            database_max_connections,
            feed_timeout: Duration::from_secs(feed_timeout_secs),
            user_agent: get("FEED_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            mirrors,
            browserless_url: get("BROWSERLESS_URL"),
            browserless_token: get("BROWSERLESS_TOKEN"),
            feeds,
            retention_days,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// Parses `primary=>fallback` pairs separated by commas.
pub fn parse_mirrors(raw: &str) -> Result<Vec<MirrorRule>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once("=>") {
            Some((primary, fallback)) if !primary.trim().is_empty() && !fallback.trim().is_empty() => {
                Ok(MirrorRule::new(primary.trim(), fallback.trim()))
            }
            _ => Err(ConfigError::Invalid {
                key: "FEED_MIRRORS",
                value: pair.to_string(),
            }),
        })
        .collect()
}

/// Narrows the catalogue to a comma list of feed names. Unknown names are rejected.
pub fn select_feeds(catalogue: Vec<FeedSource>, filter: Option<&str>) -> Result<Vec<FeedSource>, ConfigError> {
    let Some(filter) = filter else {
        return Ok(catalogue);
    };
    let wanted: Vec<&str> = filter
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();
    if let Some(unknown) = wanted
        .iter()
        .find(|name| !catalogue.iter().any(|feed| feed.name == **name))
    {
        return Err(ConfigError::Invalid {
            key: "INGEST_FEEDS",
            value: unknown.to_string(),
        });
    }
    Ok(catalogue
        .into_iter()
        .filter(|feed| wanted.contains(&feed.name.as_str()))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<IngestConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        IngestConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_fill_everything_but_the_database() {
        let config = config_from(&[("DATABASE_URL", "sqlite::memory:")]).expect("config should load");
        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.feed_timeout, Duration::from_secs(30));
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.feeds.len(), default_feeds().len());
        assert_eq!(
            config.mirrors,
            vec![MirrorRule::new("https://rsshub.app", "https://rsshub.rssforever.com")]
        );
        assert!(config.browserless_url.is_none());

        assert!(matches!(config_from(&[]), Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    fn bad_numbers_name_their_key() {
        let result = config_from(&[("DATABASE_URL", "sqlite::memory:"), ("FEED_TIMEOUT_SECS", "soon")]);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key: "FEED_TIMEOUT_SECS", .. })
        ));
    }

    #[test]
    fn feed_filter_keeps_catalogue_order() {
        let config = config_from(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("INGEST_FEEDS", "ycombinator, indiehackers_week"),
        ])
        .expect("config should load");
        let names: Vec<&str> = config.feeds.iter().map(|feed| feed.name.as_str()).collect();
        assert_eq!(names, vec!["indiehackers_week", "ycombinator"]);
        assert_eq!(config.feeds[0].feed_type.as_deref(), Some("week"));

        assert!(select_feeds(default_feeds(), Some("nope")).is_err());
    }

    #[test]
    fn mirror_pairs_parse_and_reject_garbage() {
        let mirrors = parse_mirrors("https://a.example=>https://b.example/, https://c=>https://d")
            .expect("pairs should parse");
        assert_eq!(mirrors.len(), 2);
        assert_eq!(mirrors[0].fallback, "https://b.example");
        assert!(parse_mirrors("https://a.example").is_err());
        assert!(parse_mirrors("").expect("empty list is fine").is_empty());
    }

    #[test]
    fn only_indie_hackers_sources_carry_a_board() {
        let feeds = default_feeds();
        for feed in &feeds {
            assert_eq!(feed.feed_type.is_some(), feed.kind == FeedKind::IndieHackers, "{}", feed.name);
        }
    }
}
