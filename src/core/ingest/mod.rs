use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::core::config::FeedSource;
use crate::core::dedup::filter_new;
use crate::core::error::{ErrorKind, IngestError};
use crate::core::feed::digest::explode_digest;
use crate::core::feed::parser::parse_feed;
use crate::core::feed::types::{FeedKind, ParsedFeed};
use crate::core::AppServices;

/// Outcome of one feed within a run.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedReport {
    pub name: String,
    pub fetched: usize,
    pub new_items: usize,
    pub inserted: usize,
    pub products: usize,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub success: bool,
    pub feeds_processed: usize,
    pub items_inserted: usize,
    pub errors: Vec<String>,
    pub feeds: Vec<FeedReport>,
}

impl RunSummary {
    fn push(&mut self, report: FeedReport) {
        match &report.error {
            Some(message) => self.errors.push(format!("{}: {message}", report.name)),
            None => self.feeds_processed += 1,
        }
        self.items_inserted += report.inserted;
        self.feeds.push(report);
        self.success = self.errors.is_empty();
    }
}

pub struct Ingestor {
    services: AppServices,
}

impl Ingestor {
    pub fn new(services: AppServices) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &AppServices {
        &self.services
    }

    /// Ingests each feed in order. A failing feed is recorded in the summary
    /// and the run moves on.
    pub async fn run(&self, feeds: &[FeedSource]) -> RunSummary {
        let mut summary = RunSummary {
            success: true,
            ..RunSummary::default()
        };
        for source in feeds {
            summary.push(self.ingest_feed(source).await);
        }
        info!(
            feeds_processed = summary.feeds_processed,
            items_inserted = summary.items_inserted,
            errors = summary.errors.len(),
            "ingestion run finished"
        );
        summary
    }

    /// Runs a single configured feed by name.
    pub async fn run_named(&self, feeds: &[FeedSource], name: &str) -> RunSummary {
        match feeds.iter().find(|feed| feed.name == name) {
            Some(source) => self.run(std::slice::from_ref(source)).await,
            None => {
                let error = IngestError::UnknownFeed(name.to_string());
                warn!(feed = name, "requested feed is not configured");
                RunSummary {
                    success: false,
                    errors: vec![error.to_string()],
                    ..RunSummary::default()
                }
            }
        }
    }

    async fn ingest_feed(&self, source: &FeedSource) -> FeedReport {
        let mut report = FeedReport {
            name: source.name.clone(),
            ..FeedReport::default()
        };
        if let Err(err) = self.try_ingest(source, &mut report).await {
            error!(feed = %source.name, kind = ?err.kind(), error = %err, "feed ingestion failed");
            report.error_kind = Some(err.kind());
            report.error = Some(err.to_string());
        }
        report
    }

    async fn try_ingest(&self, source: &FeedSource, report: &mut FeedReport) -> Result<(), IngestError> {
        let repository = &self.services.repository;
        let existing = repository.existing_guids(source.kind).await?;

        let mut parsed = self.load_feed(source).await?;
        report.fetched = parsed.items.len();
        if let Some(feed_type) = &source.feed_type {
            for item in &mut parsed.items {
                item.feed_type = Some(feed_type.clone());
            }
        }

        let fresh = filter_new(&existing, parsed.items);
        report.new_items = fresh.len();
        info!(
            feed = %source.name,
            fetched = report.fetched,
            new_items = report.new_items,
            "feed loaded"
        );
        if fresh.is_empty() {
            return Ok(());
        }

        let records = self.services.enricher.enrich(fresh, source.kind).await;

        // Products go first: once the digest row exists it is filtered out as
        // seen and would never be exploded again.
        if source.kind == FeedKind::Decohack {
            let now = Utc::now();
            let products: Vec<_> = records
                .iter()
                .flat_map(|record| explode_digest(record, now))
                .collect();
            report.products = repository.upsert_products(&products).await?;
        }
        report.inserted = repository.upsert_records(source.kind, &records).await?;
        Ok(())
    }

    /// Fetches and parses the primary URL; on any failure tries the mirror
    /// once when one is configured for it.
    pub async fn load_feed(&self, source: &FeedSource) -> Result<ParsedFeed, IngestError> {
        let primary = self.fetch_and_parse(&source.url, source.kind).await;
        let err = match primary {
            Ok(parsed) => return Ok(parsed),
            Err(err) => err,
        };
        let Some(mirror) = self.services.feed_fetcher.mirror_for(&source.url) else {
            return Err(err);
        };
        warn!(feed = %source.name, url = %mirror, error = %err, "primary feed failed, trying mirror");
        self.fetch_and_parse(&mirror, source.kind).await
    }

    async fn fetch_and_parse(&self, url: &str, kind: FeedKind) -> Result<ParsedFeed, IngestError> {
        let fetched = self.services.feed_fetcher.fetch(url).await?;
        let parsed = parse_feed(&fetched.body, kind)?;
        if parsed.repaired {
            info!(url, "feed parsed after markup repair");
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::core::enrich::page::{PageFetchError, PageFetcher};
    use crate::core::enrich::{ContentEnricher, EnrichmentPolicy};
    use crate::core::feed::fetcher::{FeedFetcher, MirrorRule};
    use crate::core::feed::types::StoredRecord;
    use crate::core::storage::{FeedRepository, PRODUCTS_TABLE};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use sqlx::Row;

    struct StaticPage;

    #[async_trait]
    impl PageFetcher for StaticPage {
        async fn fetch_page(&self, url: &str) -> Result<String, PageFetchError> {
            Ok(format!("Menu\n\n# Full article\n\nBody of {url}\n"))
        }
    }

    async fn spawn_test_server() -> (String, tokio::task::JoinHandle<()>) {
        let app = Router::new()
            .route(
                "/verge.xml",
                get(|| async { include_str!("../../../fixtures/feeds/rss_basic.xml") }),
            )
            .route(
                "/primary/ih.xml",
                get(|| async { StatusCode::BAD_GATEWAY }),
            )
            .route(
                "/mirror/ih.xml",
                get(|| async { include_str!("../../../fixtures/feeds/rss_malformed.xml") }),
            )
            .route(
                "/decohack.xml",
                get(|| async { include_str!("../../../fixtures/feeds/decohack_digest.xml") }),
            )
            .route("/garbage.xml", get(|| async { "<html><body>not a feed</body></html>" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let address = listener.local_addr().expect("local addr should exist");
        let join_handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server should run");
        });
        (format!("http://{address}"), join_handle)
    }

    async fn ingestor(base: &str) -> Ingestor {
        let repository = FeedRepository::connect("sqlite::memory:", 1)
            .await
            .expect("connect must succeed");
        repository.migrate().await.expect("migrate must succeed");
        let quick = EnrichmentPolicy {
            batch_size: 2,
            batch_delay: Duration::ZERO,
            concurrency: 2,
            max_retries: 0,
            base_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        };
        let enricher =
            ContentEnricher::new(Arc::new(StaticPage)).with_policy(FeedKind::IndieHackers, quick);
        let fetcher = FeedFetcher::new(
            reqwest::Client::new(),
            vec![MirrorRule::new(format!("{base}/primary"), format!("{base}/mirror"))],
        );
        Ingestor::new(AppServices::new(fetcher, enricher, repository))
    }

    #[tokio::test]
    async fn fresh_ingest_stores_pending_rows_once() {
        let (base, server_task) = spawn_test_server().await;
        let ingestor = ingestor(&base).await;
        let feeds = vec![FeedSource::new("theverge", &format!("{base}/verge.xml"), FeedKind::TheVerge)];

        let first = ingestor.run(&feeds).await;
        assert!(first.success, "{:?}", first.errors);
        assert_eq!(first.feeds_processed, 1);
        assert_eq!(first.items_inserted, 3);

        let repository = &ingestor.services().repository;
        let counts = repository.status_counts("rss_theverge").await.expect("counts");
        assert_eq!(counts.get("pending"), Some(&3));

        let second = ingestor.run(&feeds).await;
        assert!(second.success);
        assert_eq!(second.items_inserted, 0);
        assert_eq!(second.feeds[0].fetched, 3);
        assert_eq!(second.feeds[0].new_items, 0);
        assert_eq!(repository.count_rows("rss_theverge").await.expect("count"), 3);

        server_task.abort();
    }

    #[tokio::test]
    async fn mirror_rescues_a_failing_primary_and_items_get_enriched() {
        let (base, server_task) = spawn_test_server().await;
        let ingestor = ingestor(&base).await;
        let feeds = vec![FeedSource::new(
            "indiehackers_week",
            &format!("{base}/primary/ih.xml"),
            FeedKind::IndieHackers,
        )];

        let summary = ingestor.run(&feeds).await;
        assert!(summary.success, "{:?}", summary.errors);
        assert_eq!(summary.items_inserted, 2);

        let rows = sqlx::query(
            "SELECT link, full_content, feed_type FROM rss_indiehackers ORDER BY id",
        )
        .fetch_all(ingestor.services().repository.pool())
        .await
        .expect("rows");
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.get::<Option<String>, _>("feed_type").as_deref(), Some("week"));
            let content = row.get::<Option<String>, _>("full_content").unwrap_or_default();
            assert!(content.starts_with("# Full article"), "{content}");
        }

        server_task.abort();
    }

    #[tokio::test]
    async fn one_broken_feed_does_not_stop_the_run() {
        let (base, server_task) = spawn_test_server().await;
        let ingestor = ingestor(&base).await;
        let feeds = vec![
            FeedSource::new("betalist", &format!("{base}/garbage.xml"), FeedKind::Betalist),
            FeedSource::new("ycombinator", &format!("{base}/missing.xml"), FeedKind::YCombinator),
            FeedSource::new("theverge", &format!("{base}/verge.xml"), FeedKind::TheVerge),
        ];

        let summary = ingestor.run(&feeds).await;
        assert!(!summary.success);
        assert_eq!(summary.feeds_processed, 1);
        assert_eq!(summary.items_inserted, 3);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(summary.feeds[0].error_kind, Some(ErrorKind::Parse));
        assert_eq!(summary.feeds[1].error_kind, Some(ErrorKind::Transport));
        assert_eq!(summary.feeds[2].error, None);

        server_task.abort();
    }

    #[tokio::test]
    async fn digests_are_stored_and_exploded() {
        let (base, server_task) = spawn_test_server().await;
        let ingestor = ingestor(&base).await;
        let feeds = vec![FeedSource::new("decohack", &format!("{base}/decohack.xml"), FeedKind::Decohack)];

        let summary = ingestor.run(&feeds).await;
        assert!(summary.success, "{:?}", summary.errors);
        assert_eq!(summary.feeds[0].products, 2);

        let repository = &ingestor.services().repository;
        assert_eq!(repository.count_rows("rss_decohack").await.expect("count"), 1);
        assert_eq!(repository.count_rows(PRODUCTS_TABLE).await.expect("count"), 2);

        server_task.abort();
    }

    #[tokio::test]
    async fn failed_product_write_is_retried_on_the_next_run() {
        let (base, server_task) = spawn_test_server().await;
        let ingestor = ingestor(&base).await;
        let repository = &ingestor.services().repository;
        let feeds = vec![FeedSource::new("decohack", &format!("{base}/decohack.xml"), FeedKind::Decohack)];

        sqlx::query(&format!("DROP TABLE {PRODUCTS_TABLE}"))
            .execute(repository.pool())
            .await
            .expect("drop products table");
        let failed = ingestor.run(&feeds).await;
        assert!(!failed.success);
        assert_eq!(failed.feeds[0].error_kind, Some(ErrorKind::Storage));
        assert_eq!(repository.count_rows("rss_decohack").await.expect("count"), 0);

        repository.migrate().await.expect("re-migrate");
        let retried = ingestor.run(&feeds).await;
        assert!(retried.success, "{:?}", retried.errors);
        assert_eq!(retried.feeds[0].products, 2);
        assert_eq!(repository.count_rows(PRODUCTS_TABLE).await.expect("count"), 2);
        assert_eq!(repository.count_rows("rss_decohack").await.expect("count"), 1);

        server_task.abort();
    }

    #[tokio::test]
    async fn partial_duplicates_insert_only_the_new_item() {
        let (base, server_task) = spawn_test_server().await;
        let ingestor = ingestor(&base).await;
        let repository = &ingestor.services().repository;

        let parsed = parse_feed(
            include_bytes!("../../../fixtures/feeds/rss_basic.xml"),
            FeedKind::TheVerge,
        )
        .expect("fixture should parse");
        let stored: Vec<StoredRecord> = parsed.items[..2]
            .iter()
            .map(|item| StoredRecord {
                item: item.clone(),
                full_content: Some(format!("kept {}", item.guid)),
                content_fetched_at: Some(Utc::now()),
            })
            .collect();
        repository
            .upsert_records(FeedKind::TheVerge, &stored)
            .await
            .expect("seed two items");

        let feeds = vec![FeedSource::new("theverge", &format!("{base}/verge.xml"), FeedKind::TheVerge)];
        let summary = ingestor.run(&feeds).await;
        assert!(summary.success, "{:?}", summary.errors);
        assert_eq!(summary.feeds[0].fetched, 3);
        assert_eq!(summary.feeds[0].new_items, 1);
        assert_eq!(summary.items_inserted, 1);
        assert_eq!(repository.count_rows("rss_theverge").await.expect("count"), 3);

        for record in &stored {
            let row = sqlx::query("SELECT full_content FROM rss_theverge WHERE guid = ?")
                .bind(record.item.guid.clone())
                .fetch_one(repository.pool())
                .await
                .expect("seeded row");
            assert_eq!(
                row.get::<Option<String>, _>("full_content"),
                record.full_content
            );
        }

        server_task.abort();
    }

    #[tokio::test]
    async fn unknown_feed_names_fail_the_summary() {
        let ingestor = ingestor("http://127.0.0.1:9").await;
        let summary = ingestor.run_named(&[], "nope").await;
        assert!(!summary.success);
        assert_eq!(summary.feeds_processed, 0);
        assert_eq!(summary.errors, vec!["feed `nope` is not configured".to_string()]);

        let json = serde_json::to_value(&summary).expect("summary serialises");
        assert!(json.get("feedsProcessed").is_some());
        assert!(json.get("itemsInserted").is_some());
    }
}
