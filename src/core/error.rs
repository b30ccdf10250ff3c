use serde::Serialize;

use super::config::ConfigError;
use super::enrich::page::PageFetchError;
use super::feed::fetcher::FetchError;
use super::feed::parser::FeedParseError;
use super::storage::repository::StorageError;

/// Recovery class of a failure, independent of which component raised it.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Parse,
    RateLimit,
    Storage,
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] FeedParseError),
    #[error(transparent)]
    Page(#[from] PageFetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("feed `{0}` is not configured")]
    UnknownFeed(String),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Fetch(FetchError::RateLimited) => ErrorKind::RateLimit,
            IngestError::Fetch(_) => ErrorKind::Transport,
            IngestError::Parse(_) => ErrorKind::Parse,
            IngestError::Page(PageFetchError::RateLimited(_)) => ErrorKind::RateLimit,
            IngestError::Page(_) => ErrorKind::Transport,
            IngestError::Storage(_) => ErrorKind::Storage,
            IngestError::Config(_) | IngestError::UnknownFeed(_) => ErrorKind::Config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_failing_component() {
        assert_eq!(
            IngestError::from(FetchError::HttpStatus(502)).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            IngestError::from(FetchError::RateLimited).kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            IngestError::from(FeedParseError::EmptyPayload).kind(),
            ErrorKind::Parse
        );
        assert_eq!(
            IngestError::from(PageFetchError::RateLimited("error code: 1015".to_string())).kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            IngestError::from(StorageError::InvalidTable("x;y".to_string())).kind(),
            ErrorKind::Storage
        );
        assert_eq!(
            IngestError::from(ConfigError::Missing("DATABASE_URL")).kind(),
            ErrorKind::Config
        );
    }
}
