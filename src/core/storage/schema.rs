use crate::core::feed::types::{FeedKind, StoredRecord};

use super::models::format_timestamp;
use super::repository::StorageError;

pub const PRODUCTS_TABLE: &str = "rss_decohack_products";

// MySQL TEXT and MEDIUMTEXT limits are in bytes; utf8mb4 needs up to four per char.
const MYSQL_TEXT_CHARS: usize = 65_535 / 4;
const MYSQL_MEDIUMTEXT_CHARS: usize = 16_777_215 / 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self, StorageError> {
        let scheme = url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "sqlite" => Ok(Dialect::Sqlite),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            _ => Err(StorageError::UnsupportedDatabase(scheme)),
        }
    }
}

/// Rejects anything that is not a plain identifier before it is spliced into SQL.
pub fn validate_table(name: &str) -> Result<&str, StorageError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(name)
    } else {
        Err(StorageError::InvalidTable(name.to_string()))
    }
}

/// Payload columns of a feed table. `guid` is the upsert key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Title,
    Link,
    Guid,
    Summary,
    Author,
    Category,
    PublishedAt,
    ImageUrl,
    VisitUrl,
    CoverImageUrl,
    RawHtml,
    FeedType,
    FullContent,
    ContentFetchedAt,
}

impl Column {
    pub fn name(&self) -> &'static str {
        match self {
            Column::Title => "title",
            Column::Link => "link",
            Column::Guid => "guid",
            Column::Summary => "summary",
            Column::Author => "author",
            Column::Category => "category",
            Column::PublishedAt => "published_at",
            Column::ImageUrl => "image_url",
            Column::VisitUrl => "visit_url",
            Column::CoverImageUrl => "cover_image_url",
            Column::RawHtml => "raw_html",
            Column::FeedType => "feed_type",
            Column::FullContent => "full_content",
            Column::ContentFetchedAt => "content_fetched_at",
        }
    }

    fn sql_type(&self, dialect: Dialect) -> &'static str {
        match (dialect, self) {
            (Dialect::Sqlite, Column::Title | Column::Link | Column::Guid) => "TEXT NOT NULL",
            (Dialect::Sqlite, _) => "TEXT",
            (Dialect::MySql, Column::Title) => "VARCHAR(512) NOT NULL",
            (Dialect::MySql, Column::Link) => "VARCHAR(1024) NOT NULL",
            (Dialect::MySql, Column::Guid) => "VARCHAR(255) NOT NULL",
            (Dialect::MySql, Column::Summary) => "TEXT",
            (Dialect::MySql, Column::FullContent | Column::RawHtml) => "MEDIUMTEXT",
            (Dialect::MySql, Column::PublishedAt | Column::ContentFetchedAt) => "VARCHAR(32)",
            (Dialect::MySql, Column::Author | Column::Category | Column::FeedType) => {
                "VARCHAR(255)"
            }
            (Dialect::MySql, _) => "VARCHAR(1024)",
        }
    }

    /// Type used when the column is added to an existing table.
    fn added_type(&self, dialect: Dialect) -> &'static str {
        match (dialect, self) {
            (Dialect::Sqlite, _) => "TEXT",
            (Dialect::MySql, Column::Title | Column::Guid) => "VARCHAR(512)",
            (Dialect::MySql, Column::Link) => "VARCHAR(1024)",
            _ => self.sql_type(dialect),
        }
    }

    /// Longest value the column accepts, in characters. SQLite is unbounded.
    pub fn max_chars(&self, dialect: Dialect) -> Option<usize> {
        match (dialect, self) {
            (Dialect::Sqlite, _) => None,
            (Dialect::MySql, Column::Title) => Some(512),
            (Dialect::MySql, Column::Link) => Some(1024),
            (Dialect::MySql, Column::Summary) => Some(MYSQL_TEXT_CHARS),
            (Dialect::MySql, Column::FullContent | Column::RawHtml) => Some(MYSQL_MEDIUMTEXT_CHARS),
            (Dialect::MySql, Column::PublishedAt | Column::ContentFetchedAt) => Some(32),
            (
                Dialect::MySql,
                Column::Guid | Column::Author | Column::Category | Column::FeedType,
            ) => Some(255),
            (Dialect::MySql, _) => Some(1024),
        }
    }

    /// The value to bind for this column, cut to fit it.
    pub fn bound_value(&self, record: &StoredRecord, dialect: Dialect) -> Option<String> {
        self.value(record)
            .map(|value| truncate_chars(value, self.max_chars(dialect)))
    }

    /// Whether a conflicting re-insert may overwrite the stored value.
    pub fn keeps_existing_when_null(&self) -> bool {
        matches!(self, Column::FullContent | Column::ContentFetchedAt)
    }

    pub fn value(&self, record: &StoredRecord) -> Option<String> {
        let item = &record.item;
        match self {
            Column::Title => Some(item.title.clone()),
            Column::Link => Some(item.link.clone()),
            Column::Guid => Some(item.guid.clone()),
            Column::Summary => Some(item.summary.clone()),
            Column::Author => item.author.clone(),
            Column::Category => item.category.clone(),
            Column::PublishedAt => item.published_at.map(format_timestamp),
            Column::ImageUrl => item.image_url.clone(),
            Column::VisitUrl => item.visit_url.clone(),
            Column::CoverImageUrl => item.cover_image_url.clone(),
            Column::RawHtml => item.raw_html.clone(),
            Column::FeedType => item.feed_type.clone(),
            Column::FullContent => record.full_content.clone(),
            Column::ContentFetchedAt => record.content_fetched_at.map(format_timestamp),
        }
    }
}

const BASE_COLUMNS: [Column; 7] = [
    Column::Title,
    Column::Link,
    Column::Guid,
    Column::Summary,
    Column::PublishedAt,
    Column::FullContent,
    Column::ContentFetchedAt,
];

/// The explicit column set stored for each feed family.
pub fn columns_for(kind: FeedKind) -> Vec<Column> {
    let extra: &[Column] = match kind {
        FeedKind::Betalist => &[Column::VisitUrl, Column::ImageUrl],
        FeedKind::TheVerge => &[Column::Author, Column::ImageUrl],
        FeedKind::IndieHackers => &[Column::Category, Column::FeedType],
        FeedKind::TechCrunch => &[Column::Author, Column::Category, Column::ImageUrl],
        FeedKind::YCombinator => &[Column::Author],
        FeedKind::Decohack => &[Column::ImageUrl, Column::CoverImageUrl, Column::RawHtml],
    };
    BASE_COLUMNS.iter().chain(extra).copied().collect()
}

const BOOKKEEPING_SQLITE: [(&str, &str); 3] = [
    ("processing_status", "TEXT NOT NULL DEFAULT 'pending'"),
    ("created_at", "TEXT"),
    ("updated_at", "TEXT"),
];
const BOOKKEEPING_MYSQL: [(&str, &str); 3] = [
    ("processing_status", "VARCHAR(16) NOT NULL DEFAULT 'pending'"),
    ("created_at", "VARCHAR(32)"),
    ("updated_at", "VARCHAR(32)"),
];

fn bookkeeping(dialect: Dialect) -> &'static [(&'static str, &'static str)] {
    match dialect {
        Dialect::Sqlite => &BOOKKEEPING_SQLITE,
        Dialect::MySql => &BOOKKEEPING_MYSQL,
    }
}

/// Statements that create a feed table and its claim index if missing.
pub fn create_feed_table(kind: FeedKind, dialect: Dialect) -> Vec<String> {
    let table = kind.table_name();
    let columns: Vec<(String, &str)> = columns_for(kind)
        .iter()
        .map(|column| (column.name().to_string(), column.sql_type(dialect)))
        .collect();
    create_table(table, &columns, "guid", dialect)
}

pub fn create_products_table(dialect: Dialect) -> Vec<String> {
    let columns: Vec<(String, &str)> = product_columns(dialect)
        .iter()
        .map(|(name, sql_type)| (name.to_string(), *sql_type))
        .collect();
    create_table(PRODUCTS_TABLE, &columns, "product_name, ph_publish_date", dialect)
}

fn create_table(
    table: &str,
    columns: &[(String, &str)],
    unique_key: &str,
    dialect: Dialect,
) -> Vec<String> {
    let mut definitions: Vec<String> = columns
        .iter()
        .map(|(name, sql_type)| format!("{name} {sql_type}"))
        .collect();
    definitions.extend(
        bookkeeping(dialect)
            .iter()
            .map(|(name, sql_type)| format!("{name} {sql_type}")),
    );
    definitions.push(format!("UNIQUE ({unique_key})"));

    match dialect {
        Dialect::Sqlite => vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (id INTEGER PRIMARY KEY AUTOINCREMENT, {})",
                definitions.join(", ")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_claim ON {table} (processing_status, created_at, id)"
            ),
        ],
        Dialect::MySql => {
            definitions.push("INDEX idx_claim (processing_status, created_at, id)".to_string());
            vec![format!(
                "CREATE TABLE IF NOT EXISTS {table} (id BIGINT AUTO_INCREMENT PRIMARY KEY, {}) \
                 ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
                definitions.join(", ")
            )]
        }
    }
}

pub fn product_columns(dialect: Dialect) -> [(&'static str, &'static str); 7] {
    match dialect {
        Dialect::Sqlite => [
            ("product_name", "TEXT NOT NULL"),
            ("tagline", "TEXT"),
            ("description", "TEXT"),
            ("product_url", "TEXT"),
            ("image_url", "TEXT"),
            ("ph_publish_date", "TEXT NOT NULL"),
            ("source_guid", "TEXT NOT NULL"),
        ],
        Dialect::MySql => [
            ("product_name", "VARCHAR(255) NOT NULL"),
            ("tagline", "VARCHAR(1024)"),
            ("description", "TEXT"),
            ("product_url", "VARCHAR(1024)"),
            ("image_url", "VARCHAR(1024)"),
            ("ph_publish_date", "VARCHAR(10) NOT NULL"),
            ("source_guid", "VARCHAR(255) NOT NULL"),
        ],
    }
}

/// Character limit of a products column.
pub fn product_max_chars(column: &str, dialect: Dialect) -> Option<usize> {
    match (dialect, column) {
        (Dialect::Sqlite, _) => None,
        (Dialect::MySql, "product_name" | "source_guid") => Some(255),
        (Dialect::MySql, "ph_publish_date") => Some(10),
        (Dialect::MySql, "description") => Some(MYSQL_TEXT_CHARS),
        (Dialect::MySql, _) => Some(1024),
    }
}

/// Cuts `value` to at most `max` characters, on a char boundary.
pub fn truncate_chars(mut value: String, max: Option<usize>) -> String {
    if let Some((cut, _)) = max.and_then(|max| value.char_indices().nth(max)) {
        value.truncate(cut);
    }
    value
}

/// Every column a feed table should have, with the type to add it with.
pub fn expected_feed_columns(kind: FeedKind, dialect: Dialect) -> Vec<(String, String)> {
    columns_for(kind)
        .iter()
        .map(|column| (column.name().to_string(), column.added_type(dialect).to_string()))
        .chain(bookkeeping(dialect).iter().map(addable))
        .collect()
}

pub fn expected_product_columns(dialect: Dialect) -> Vec<(String, String)> {
    product_columns(dialect)
        .iter()
        .map(|(name, sql_type)| (name.to_string(), sql_type.replace(" NOT NULL", "")))
        .chain(bookkeeping(dialect).iter().map(addable))
        .collect()
}

fn addable((name, sql_type): &(&str, &str)) -> (String, String) {
    (name.to_string(), sql_type.to_string())
}
