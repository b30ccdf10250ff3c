use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::debug;

/// Bodies served by the CDN when it throttles us. Matched case-insensitively.
const RATE_LIMIT_SIGNATURES: [&str; 3] = [
    "error code: 1015",
    "error 1015",
    "you are being rate limited",
];

/// Markup only present on the CDN's generated error pages.
const CDN_ERROR_PAGE_MARKERS: [&str; 3] = ["cf-error-details", "cf-wrapper", "Cloudflare Ray ID"];

const TEXT_WIDTH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum PageFetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("page request failed (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("page came back empty")]
    EmptyPage,
}

impl From<reqwest::Error> for PageFetchError {
    fn from(err: reqwest::Error) -> Self {
        PageFetchError::Network(err.to_string())
    }
}

/// Turns a URL into readable text of the rendered page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, PageFetchError>;
}

/// Renders pages through a Browserless `/content` endpoint.
#[derive(Debug, Clone)]
pub struct BrowserlessFetcher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessFetcher {
    pub fn new(client: reqwest::Client, base_url: &str, token: Option<&str>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        }
    }
}

#[async_trait]
impl PageFetcher for BrowserlessFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, PageFetchError> {
        let mut endpoint = format!("{}/content", self.base_url);
        if let Some(token) = &self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        debug!(url, fetcher = "browserless", "fetching page");

        let response = self
            .client
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await?;
        read_page(response).await
    }
}

/// Plain GET of the page, for deployments without a rendering service.
#[derive(Debug, Clone)]
pub struct DirectFetcher {
    client: reqwest::Client,
}

impl DirectFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for DirectFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, PageFetchError> {
        debug!(url, fetcher = "direct", "fetching page");
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/html,application/xhtml+xml")
            .send()
            .await?;
        read_page(response).await
    }
}

async fn read_page(response: reqwest::Response) -> Result<String, PageFetchError> {
    let status = response.status();
    let body = response.text().await?;
    // A 2xx body only counts as throttled when it is the CDN's own error page,
    // which a rendering proxy relays with its own 200.
    if !status.is_success() || is_cdn_error_page(&body) {
        if let Some(signature) = rate_limit_signature(&body) {
            return Err(PageFetchError::RateLimited(signature.to_string()));
        }
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(PageFetchError::RateLimited(format!("http {}", status.as_u16())));
    }
    if !status.is_success() {
        return Err(PageFetchError::Api {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        });
    }
    Ok(html_to_text(&body))
}

pub fn rate_limit_signature(body: &str) -> Option<&'static str> {
    let lowered = body.to_lowercase();
    RATE_LIMIT_SIGNATURES
        .into_iter()
        .find(|signature| lowered.contains(signature))
}

fn is_cdn_error_page(body: &str) -> bool {
    CDN_ERROR_PAGE_MARKERS
        .iter()
        .any(|marker| body.contains(marker))
}

/// Markdown-flavoured text of an HTML page.
pub fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), TEXT_WIDTH).unwrap_or_else(|_| html.to_string())
}
