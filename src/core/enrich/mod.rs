pub mod cleanup;
pub mod page;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::Rng;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::core::feed::types::{FeedItem, FeedKind, StoredRecord};
use cleanup::extract_main_content;
use page::{PageFetchError, PageFetcher};

pub const MISSING_LINK_CONTENT: &str = "Missing link, full content unavailable";

static INDIE_HACKERS_POST_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[?&]post=([^&#/]+)").expect("static regex"));

pub fn rate_limited_content(link: &str) -> String {
    format!("# Error 1015: rate limited while fetching {link}")
}

pub fn unavailable_content(link: &str) -> String {
    format!("Unable to fetch full content, see original link: {link}")
}

/// Pacing for one feed family. Delay before retry `n` (1-based) is
/// `base_delay * 2^(n-1)` plus up to `jitter` of random noise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentPolicy {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub concurrency: usize,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl EnrichmentPolicy {
    pub fn for_kind(kind: FeedKind) -> Self {
        match kind {
            // Indie Hackers sits behind a CDN that throttles aggressively.
            FeedKind::IndieHackers => Self {
                batch_size: 3,
                batch_delay: Duration::from_secs(8),
                concurrency: 3,
                max_retries: 2,
                base_delay: Duration::from_secs(2),
                jitter: Duration::from_millis(1000),
            },
            _ => Self {
                batch_size: 5,
                batch_delay: Duration::from_secs(2),
                concurrency: 5,
                max_retries: 2,
                base_delay: Duration::from_secs(2),
                jitter: Duration::from_millis(1000),
            },
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay * 2u32.pow(attempt.saturating_sub(1));
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }
}

/// Fetches full article bodies for feeds whose excerpts are too thin.
pub struct ContentEnricher {
    fetcher: Arc<dyn PageFetcher>,
    overrides: HashMap<FeedKind, EnrichmentPolicy>,
}

impl ContentEnricher {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            fetcher,
            overrides: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, kind: FeedKind, policy: EnrichmentPolicy) -> Self {
        self.overrides.insert(kind, policy);
        self
    }

    pub fn policy(&self, kind: FeedKind) -> EnrichmentPolicy {
        self.overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| EnrichmentPolicy::for_kind(kind))
    }

    /// One record per input item, in input order. Failures become sentinel
    /// content on the record; nothing is dropped.
    pub async fn enrich(&self, items: Vec<FeedItem>, kind: FeedKind) -> Vec<StoredRecord> {
        if !kind.needs_enrichment() {
            let now = Utc::now();
            return items
                .into_iter()
                .map(|item| StoredRecord {
                    full_content: Some(item.summary.clone()),
                    content_fetched_at: Some(now),
                    item,
                })
                .collect();
        }

        let policy = self.policy(kind);
        let total = items.len();
        let batch_size = policy.batch_size.max(1);
        let mut records = Vec::with_capacity(total);
        let mut remaining = items.into_iter().peekable();
        let mut batch_number = 0_usize;

        while remaining.peek().is_some() {
            if batch_number > 0 {
                debug!(?kind, delay_ms = policy.batch_delay.as_millis() as u64, "cooling down between batches");
                tokio::time::sleep(policy.batch_delay).await;
            }
            batch_number += 1;

            let batch: Vec<FeedItem> = remaining.by_ref().take(batch_size).collect();
            info!(?kind, batch = batch_number, size = batch.len(), total, "enriching batch");
            let enriched: Vec<StoredRecord> = stream::iter(batch)
                .map(|item| self.enrich_one(item, kind, &policy))
                .buffered(policy.concurrency.max(1))
                .collect()
                .await;
            records.extend(enriched);
        }

        records
    }

    async fn enrich_one(
        &self,
        mut item: FeedItem,
        kind: FeedKind,
        policy: &EnrichmentPolicy,
    ) -> StoredRecord {
        if item.link.trim().is_empty() {
            return StoredRecord {
                item,
                full_content: Some(MISSING_LINK_CONTENT.to_string()),
                content_fetched_at: None,
            };
        }

        let fetch_link = match kind {
            FeedKind::IndieHackers => {
                normalize_indiehackers_link(&item.link).unwrap_or_else(|| item.link.clone())
            }
            _ => item.link.clone(),
        };
        if matches!(kind, FeedKind::IndieHackers | FeedKind::TechCrunch) {
            item.link = fetch_link.clone();
        }

        match self.fetch_with_retry(&fetch_link, policy).await {
            Ok(page) => {
                let cleaned = extract_main_content(&page, kind);
                let content = if cleaned.is_empty() {
                    page.trim().to_string()
                } else {
                    cleaned
                };
                StoredRecord {
                    item,
                    full_content: Some(content),
                    content_fetched_at: Some(Utc::now()),
                }
            }
            Err(PageFetchError::RateLimited(signature)) => {
                warn!(url = %fetch_link, signature, "page fetch rate limited, storing sentinel");
                StoredRecord {
                    full_content: Some(rate_limited_content(&item.link)),
                    content_fetched_at: Some(Utc::now()),
                    item,
                }
            }
            Err(error) => {
                warn!(url = %fetch_link, error = %error, "page fetch failed");
                StoredRecord {
                    full_content: Some(unavailable_content(&item.link)),
                    content_fetched_at: None,
                    item,
                }
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        policy: &EnrichmentPolicy,
    ) -> Result<String, PageFetchError> {
        let mut attempt = 0_u32;
        loop {
            let error = match self.fetcher.fetch_page(url).await {
                Ok(page) if !page.trim().is_empty() => return Ok(page),
                Ok(_) => PageFetchError::EmptyPage,
                Err(error) => error,
            };
            if attempt >= policy.max_retries {
                return Err(error);
            }
            attempt += 1;
            let delay = policy.retry_delay(attempt);
            warn!(
                url,
                attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "page fetch failed, retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Canonical `/post/<id>` form of an Indie Hackers link, if it points at a post.
pub fn normalize_indiehackers_link(link: &str) -> Option<String> {
    if let Some(id) = INDIE_HACKERS_POST_PARAM
        .captures(link)
        .and_then(|caps| caps.get(1))
    {
        return Some(format!("https://www.indiehackers.com/post/{}", id.as_str()));
    }
    if link.contains("/post/") {
        if link.starts_with("http") {
            return Some(link.to_string());
        }
        return Some(format!("https://www.indiehackers.com{link}"));
    }
    None
}
