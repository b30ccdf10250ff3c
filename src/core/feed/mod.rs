pub mod digest;
pub mod entities;
pub mod fetcher;
pub mod parser;
pub mod repair;
pub mod types;

pub use digest::explode_digest;
pub use fetcher::{FeedFetcher, FetchError, FetchedFeed, MirrorRule};
pub use parser::{parse_feed, FeedParseError};
pub use types::{DecohackProduct, DocumentKind, FeedItem, FeedKind, ParsedFeed, StoredRecord};
