use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::debug;

const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml, text/xml, */*";

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub url: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status code: {0}")]
    HttpStatus(u16),
    #[error("feed responded with an empty body")]
    EmptyBody,
    #[error("feed host is rate limiting requests")]
    RateLimited,
}

/// Rewrites URLs under a primary host prefix onto an alternate mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRule {
    pub primary: String,
    pub fallback: String,
}

impl MirrorRule {
    pub fn new(primary: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            primary: primary.into().trim_end_matches('/').to_string(),
            fallback: fallback.into().trim_end_matches('/').to_string(),
        }
    }

    fn rewrite(&self, url: &str) -> Option<String> {
        let rest = url.strip_prefix(&self.primary)?;
        if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('?')) {
            return None;
        }
        Some(format!("{}{rest}", self.fallback))
    }
}

#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    mirrors: Vec<MirrorRule>,
}

impl FeedFetcher {
    pub fn new(client: reqwest::Client, mirrors: Vec<MirrorRule>) -> Self {
        Self { client, mirrors }
    }

    /// One GET, no retries. Timeouts come from the shared client.
    pub async fn fetch(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        debug!(url, "fetching feed");
        let response = self
            .client
            .get(url)
            .header(ACCEPT, FEED_ACCEPT)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let body = response.bytes().await?.to_vec();
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(FetchError::EmptyBody);
        }

        Ok(FetchedFeed {
            url: url.to_string(),
            body,
            content_type,
        })
    }

    /// The alternate URL to try once when `url` fails, if it sits under a known mirror.
    pub fn mirror_for(&self, url: &str) -> Option<String> {
        self.mirrors.iter().find_map(|rule| rule.rewrite(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;

    async fn feed_handler() -> Response {
        (
            [(CONTENT_TYPE, "application/atom+xml")],
            include_str!("../../../fixtures/feeds/atom_basic.xml"),
        )
            .into_response()
    }

    async fn spawn_test_server() -> (String, tokio::task::JoinHandle<()>) {
        let app = Router::new()
            .route("/feed.xml", get(feed_handler))
            .route("/broken.xml", get(|| async { AxumStatus::BAD_GATEWAY }))
            .route("/busy.xml", get(|| async { AxumStatus::TOO_MANY_REQUESTS }))
            .route("/blank.xml", get(|| async { "  \n " }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let address = listener.local_addr().expect("local addr should exist");
        let join_handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server should run");
        });
        (format!("http://{address}"), join_handle)
    }

    #[tokio::test]
    async fn fetch_returns_body_and_content_type() {
        let (base, server_task) = spawn_test_server().await;
        let fetcher = FeedFetcher::new(reqwest::Client::new(), Vec::new());

        let fetched = fetcher
            .fetch(&format!("{base}/feed.xml"))
            .await
            .expect("fetch should succeed");
        assert!(fetched.body.starts_with(b"<?xml"));
        assert_eq!(fetched.content_type.as_deref(), Some("application/atom+xml"));

        server_task.abort();
    }

    #[tokio::test]
    async fn fetch_classifies_failures() {
        let (base, server_task) = spawn_test_server().await;
        let fetcher = FeedFetcher::new(reqwest::Client::new(), Vec::new());

        let broken = fetcher.fetch(&format!("{base}/broken.xml")).await;
        let busy = fetcher.fetch(&format!("{base}/busy.xml")).await;
        let blank = fetcher.fetch(&format!("{base}/blank.xml")).await;

        assert!(matches!(broken, Err(FetchError::HttpStatus(502))));
        assert!(matches!(busy, Err(FetchError::RateLimited)));
        assert!(matches!(blank, Err(FetchError::EmptyBody)));

        server_task.abort();
    }

    #[test]
    fn mirror_rewrites_only_matching_prefixes() {
        let fetcher = FeedFetcher::new(
            reqwest::Client::new(),
            vec![MirrorRule::new(
                "https://rsshub.app/",
                "https://rsshub.rssforever.com",
            )],
        );

        assert_eq!(
            fetcher.mirror_for("https://rsshub.app/hackernews"),
            Some("https://rsshub.rssforever.com/hackernews".to_string())
        );
        assert_eq!(fetcher.mirror_for("https://rsshub.application.io/x"), None);
        assert_eq!(fetcher.mirror_for("https://ihrss.io/top/week"), None);
    }
}
