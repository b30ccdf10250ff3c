pub mod config;
pub mod dedup;
pub mod enrich;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod maintenance;
pub mod storage;

use std::sync::Arc;

use config::IngestConfig;
use enrich::page::{BrowserlessFetcher, DirectFetcher, PageFetcher};
use enrich::ContentEnricher;
use error::IngestError;
use feed::fetcher::{FeedFetcher, FetchError};
use storage::FeedRepository;
use tracing::info;

/// Long-lived collaborators, built once at startup and shared by every run.
pub struct AppServices {
    pub feed_fetcher: FeedFetcher,
    pub enricher: ContentEnricher,
    pub repository: FeedRepository,
}

impl AppServices {
    pub fn new(feed_fetcher: FeedFetcher, enricher: ContentEnricher, repository: FeedRepository) -> Self {
        Self {
            feed_fetcher,
            enricher,
            repository,
        }
    }

    pub async fn from_config(config: &IngestConfig) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.feed_timeout)
            .build()
            .map_err(FetchError::from)?;

        let page_fetcher: Arc<dyn PageFetcher> = match &config.browserless_url {
            Some(base_url) => {
                info!(base_url = %base_url, "enrichment renders pages through browserless");
                Arc::new(BrowserlessFetcher::new(
                    client.clone(),
                    base_url,
                    config.browserless_token.as_deref(),
                ))
            }
            None => {
                info!("enrichment fetches pages directly");
                Arc::new(DirectFetcher::new(client.clone()))
            }
        };

        let repository =
            FeedRepository::connect(&config.database_url, config.database_max_connections).await?;

        Ok(Self::new(
            FeedFetcher::new(client, config.mirrors.clone()),
            ContentEnricher::new(page_fetcher),
            repository,
        ))
    }
}
