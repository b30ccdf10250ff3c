use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, QueryBuilder, Row};
use tracing::{debug, info};

use super::models::{format_timestamp, TableStats};
use super::schema::{
    columns_for, create_feed_table, create_products_table, expected_feed_columns,
    expected_product_columns, product_max_chars, truncate_chars, validate_table, Column, Dialect,
    PRODUCTS_TABLE,
};
use crate::core::feed::types::{DecohackProduct, FeedKind, StoredRecord};

const UPSERT_CHUNK: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid table name `{0}`")]
    InvalidTable(String),
    #[error("unsupported database scheme `{0}`")]
    UnsupportedDatabase(String),
}

#[derive(Debug, Clone)]
pub struct FeedRepository {
    pool: AnyPool,
    dialect: Dialect,
}

impl FeedRepository {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let dialect = Dialect::from_url(database_url)?;
        sqlx::any::install_default_drivers();
        // Every connection to an in-memory SQLite URL opens a fresh database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool, dialect })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Creates missing tables, then adds any column an older table lacks.
    /// Never drops or rewrites existing columns.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for kind in FeedKind::ALL {
            self.ensure_table(
                kind.table_name(),
                create_feed_table(kind, self.dialect),
                &expected_feed_columns(kind, self.dialect),
            )
            .await?;
        }
        self.ensure_table(
            PRODUCTS_TABLE,
            create_products_table(self.dialect),
            &expected_product_columns(self.dialect),
        )
        .await
    }

    // Indexes come after the column backfill since older tables may lack
    // the indexed columns.
    async fn ensure_table(
        &self,
        table: &str,
        statements: Vec<String>,
        expected: &[(String, String)],
    ) -> Result<(), StorageError> {
        let Some((create, indexes)) = statements.split_first() else {
            return Ok(());
        };
        sqlx::query(create).execute(&self.pool).await?;
        self.add_missing_columns(table, expected).await?;
        // Rows older than the `created_at` column would otherwise never decode
        // as claimable.
        let backfilled = sqlx::query(&format!(
            "UPDATE {table} SET created_at = ? WHERE created_at IS NULL"
        ))
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?
        .rows_affected();
        if backfilled > 0 {
            info!(table, backfilled, "backfilled missing created_at");
        }
        for statement in indexes {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn add_missing_columns(
        &self,
        table: &str,
        expected: &[(String, String)],
    ) -> Result<(), StorageError> {
        let existing = self.column_names(table).await?;
        for (name, sql_type) in expected {
            if existing.contains(name) {
                continue;
            }
            info!(table, column = name.as_str(), "adding missing column");
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {name} {sql_type}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn column_names(&self, table: &str) -> Result<HashSet<String>, StorageError> {
        let table = validate_table(table)?;
        let rows = match self.dialect {
            Dialect::Sqlite => {
                sqlx::query(&format!("SELECT name FROM pragma_table_info('{table}')"))
                    .fetch_all(&self.pool)
                    .await?
            }
            Dialect::MySql => {
                sqlx::query(
                    r#"
                    SELECT CAST(COLUMN_NAME AS CHAR) AS name
                    FROM information_schema.COLUMNS
                    WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
                    "#,
                )
                .bind(table.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()
            .map_err(StorageError::from)
    }

    pub async fn existing_guids(&self, kind: FeedKind) -> Result<HashSet<String>, StorageError> {
        let rows = sqlx::query(&format!("SELECT guid FROM {}", kind.table_name()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("guid"))
            .collect::<Result<_, _>>()
            .map_err(StorageError::from)
    }

    /// Inserts new rows as `pending`; on a guid conflict refreshes the payload
    /// but never touches `created_at` or `processing_status`, and never
    /// replaces stored content with NULL. Returns the number of rows submitted.
    pub async fn upsert_records(
        &self,
        kind: FeedKind,
        records: &[StoredRecord],
    ) -> Result<usize, StorageError> {
        let mut seen = HashSet::new();
        let unique: Vec<&StoredRecord> = records
            .iter()
            .filter(|record| seen.insert(record.item.guid.as_str()))
            .collect();
        if unique.is_empty() {
            return Ok(0);
        }

        let table = kind.table_name();
        let columns = columns_for(kind);
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        for chunk in unique.chunks(UPSERT_CHUNK) {
            let mut query = QueryBuilder::<Any>::new(format!("INSERT INTO {table} ("));
            for column in &columns {
                query.push(column.name()).push(", ");
            }
            query.push("processing_status, created_at, updated_at) ");
            query.push_values(chunk, |mut row, record| {
                for column in &columns {
                    row.push_bind(column.bound_value(record, self.dialect));
                }
                row.push("'pending'")
                    .push_bind(now.clone())
                    .push_bind(now.clone());
            });
            push_conflict_clause(&mut query, table, &columns, self.dialect);
            query.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(table, rows = unique.len(), "upserted feed records");
        Ok(unique.len())
    }

    /// Upserts digest products keyed by `(product_name, ph_publish_date)`.
    pub async fn upsert_products(&self, products: &[DecohackProduct]) -> Result<usize, StorageError> {
        let mut seen = HashSet::new();
        let unique: Vec<&DecohackProduct> = products
            .iter()
            .filter(|product| {
                seen.insert((product.product_name.as_str(), product.ph_publish_date.as_str()))
            })
            .collect();
        if unique.is_empty() {
            return Ok(0);
        }

        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        for chunk in unique.chunks(UPSERT_CHUNK) {
            let mut query = QueryBuilder::<Any>::new(format!(
                "INSERT INTO {PRODUCTS_TABLE} (product_name, tagline, description, product_url, \
                 image_url, ph_publish_date, source_guid, processing_status, created_at, updated_at) "
            ));
            let dialect = self.dialect;
            let fit = |column: &str, value: &str| {
                truncate_chars(value.to_string(), product_max_chars(column, dialect))
            };
            let fit_optional =
                |column: &str, value: &Option<String>| value.as_deref().map(|value| fit(column, value));
            query.push_values(chunk, |mut row, product| {
                row.push_bind(fit("product_name", &product.product_name))
                    .push_bind(fit_optional("tagline", &product.tagline))
                    .push_bind(fit_optional("description", &product.description))
                    .push_bind(fit_optional("product_url", &product.product_url))
                    .push_bind(fit_optional("image_url", &product.image_url))
                    .push_bind(fit("ph_publish_date", &product.ph_publish_date))
                    .push_bind(fit("source_guid", &product.source_guid))
                    .push("'pending'")
                    .push_bind(now.clone())
                    .push_bind(now.clone());
            });
            let refreshed = ["tagline", "description", "product_url", "image_url", "source_guid", "updated_at"];
            match self.dialect {
                Dialect::Sqlite => {
                    query.push(" ON CONFLICT(product_name, ph_publish_date) DO UPDATE SET ");
                    let assignments: Vec<String> = refreshed
                        .iter()
                        .map(|name| format!("{name} = excluded.{name}"))
                        .collect();
                    query.push(assignments.join(", "));
                }
                Dialect::MySql => {
                    query.push(" ON DUPLICATE KEY UPDATE ");
                    let assignments: Vec<String> = refreshed
                        .iter()
                        .map(|name| format!("{name} = VALUES({name})"))
                        .collect();
                    query.push(assignments.join(", "));
                }
            }
            query.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(rows = unique.len(), "upserted digest products");
        Ok(unique.len())
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64, StorageError> {
        let table = validate_table(table)?;
        let row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("total")?)
    }

    pub async fn status_counts(&self, table: &str) -> Result<BTreeMap<String, i64>, StorageError> {
        let table = validate_table(table)?;
        let rows = sqlx::query(&format!(
            "SELECT processing_status, COUNT(*) AS total FROM {table} GROUP BY processing_status"
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            counts.insert(
                row.try_get::<String, _>("processing_status")?,
                row.try_get::<i64, _>("total")?,
            );
        }
        Ok(counts)
    }

    pub async fn delete_created_before(
        &self,
        table: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let table = validate_table(table)?;
        let affected = sqlx::query(&format!("DELETE FROM {table} WHERE created_at < ?"))
            .bind(format_timestamp(cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    pub async fn table_stats(
        &self,
        table: &str,
        day_start: DateTime<Utc>,
    ) -> Result<TableStats, StorageError> {
        let table = validate_table(table)?;
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS total, MAX(created_at) AS latest FROM {table}"
        ))
        .fetch_one(&self.pool)
        .await?;
        let today = sqlx::query(&format!(
            "SELECT COUNT(*) AS total FROM {table} WHERE created_at >= ?"
        ))
        .bind(format_timestamp(day_start))
        .fetch_one(&self.pool)
        .await?;
        let counts = self.status_counts(table).await?;
        let count_of = |status: &str| counts.get(status).copied().unwrap_or_default();

        Ok(TableStats {
            table: table.to_string(),
            total: row.try_get::<i64, _>("total")?,
            today: today.try_get::<i64, _>("total")?,
            latest_created_at: row.try_get::<Option<String>, _>("latest")?,
            pending: count_of("pending"),
            processing: count_of("processing"),
            success: count_of("success"),
            failed: count_of("failed"),
        })
    }
}

fn push_conflict_clause(
    query: &mut QueryBuilder<'_, Any>,
    table: &str,
    columns: &[Column],
    dialect: Dialect,
) {
    let refreshed = columns.iter().filter(|column| **column != Column::Guid);
    let assignments: Vec<String> = match dialect {
        Dialect::Sqlite => refreshed
            .map(|column| {
                let name = column.name();
                if column.keeps_existing_when_null() {
                    format!("{name} = COALESCE(excluded.{name}, {table}.{name})")
                } else {
                    format!("{name} = excluded.{name}")
                }
            })
            .chain(std::iter::once("updated_at = excluded.updated_at".to_string()))
            .collect(),
        Dialect::MySql => refreshed
            .map(|column| {
                let name = column.name();
                if column.keeps_existing_when_null() {
                    format!("{name} = COALESCE(VALUES({name}), {name})")
                } else {
                    format!("{name} = VALUES({name})")
                }
            })
            .chain(std::iter::once("updated_at = VALUES(updated_at)".to_string()))
            .collect(),
    };
    match dialect {
        Dialect::Sqlite => query.push(" ON CONFLICT(guid) DO UPDATE SET "),
        Dialect::MySql => query.push(" ON DUPLICATE KEY UPDATE "),
    };
    query.push(assignments.join(", "));
}
