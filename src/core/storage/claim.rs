use chrono::Utc;
use sqlx::any::AnyRow;
use sqlx::{Any, AnyPool, FromRow, QueryBuilder, Row};
use tracing::debug;

use super::models::{format_timestamp, ClaimedProduct, ClaimedRecord, Outcome};
use super::repository::{FeedRepository, StorageError};
use super::schema::{validate_table, Dialect};

const DEFAULT_FINALIZE_CHUNK: usize = 50;

/// A row type the queue can hand out. `COLUMNS` is the select list used
/// once rows are claimed.
pub trait Claimable: for<'r> FromRow<'r, AnyRow> + Send + Unpin {
    const COLUMNS: &'static str;
}

impl Claimable for ClaimedRecord {
    const COLUMNS: &'static str = "id, title, link, guid, summary, published_at, full_content, \
                                   content_fetched_at, processing_status, created_at";
}

impl Claimable for ClaimedProduct {
    const COLUMNS: &'static str = "id, product_name, tagline, description, product_url, \
                                   image_url, ph_publish_date, source_guid, processing_status, \
                                   created_at";
}

/// Hands out `pending` rows to concurrent consumers. A row is moved to
/// `processing` and returned to exactly one claimant; rows left in
/// `processing` by a crashed consumer stay there.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    pool: AnyPool,
    dialect: Dialect,
    finalize_chunk: usize,
}

impl WorkQueue {
    pub fn new(repository: &FeedRepository) -> Self {
        Self {
            pool: repository.pool().clone(),
            dialect: repository.dialect(),
            finalize_chunk: DEFAULT_FINALIZE_CHUNK,
        }
    }

    pub fn with_finalize_chunk(mut self, chunk: usize) -> Self {
        self.finalize_chunk = chunk.max(1);
        self
    }

    /// Claims up to `limit` of the oldest pending rows, ordered by
    /// `created_at` then `id`.
    pub async fn claim<T: Claimable>(&self, table: &str, limit: usize) -> Result<Vec<T>, StorageError> {
        let table = validate_table(table)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = match self.dialect {
            // The write comes first so the transaction takes SQLite's write
            // lock before it reads anything.
            Dialect::Sqlite => {
                let rows = sqlx::query(&format!(
                    r#"
                    UPDATE {table}
                    SET processing_status = 'processing', updated_at = ?
                    WHERE id IN (
                        SELECT id FROM {table}
                        WHERE processing_status = 'pending'
                        ORDER BY created_at, id
                        LIMIT ?
                    )
                    RETURNING id
                    "#
                ))
                .bind(now)
                .bind(limit as i64)
                .fetch_all(&mut *tx)
                .await?;
                rows.iter()
                    .map(|row| row.try_get::<i64, _>("id"))
                    .collect::<Result<_, _>>()?
            }
            Dialect::MySql => {
                let rows = sqlx::query(&format!(
                    r#"
                    SELECT id FROM {table}
                    WHERE processing_status = 'pending'
                    ORDER BY created_at, id
                    LIMIT ?
                    FOR UPDATE
                    "#
                ))
                .bind(limit as i64)
                .fetch_all(&mut *tx)
                .await?;
                let ids: Vec<i64> = rows
                    .iter()
                    .map(|row| row.try_get::<i64, _>("id"))
                    .collect::<Result<_, _>>()?;
                if !ids.is_empty() {
                    let mut update = QueryBuilder::<Any>::new(format!(
                        "UPDATE {table} SET processing_status = 'processing', updated_at = "
                    ));
                    update.push_bind(now);
                    update.push(" WHERE id IN ");
                    push_id_list(&mut update, &ids);
                    update.build().execute(&mut *tx).await?;
                }
                ids
            }
        };

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut select =
            QueryBuilder::<Any>::new(format!("SELECT {} FROM {table} WHERE id IN ", T::COLUMNS));
        push_id_list(&mut select, &ids);
        select.push(" ORDER BY created_at, id");
        let claimed = select.build_query_as::<T>().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        debug!(table, claimed = claimed.len(), "claimed pending rows");
        Ok(claimed)
    }

    /// Moves claimed rows to their terminal state. Rows that are not
    /// currently `processing` are left alone. Returns the rows updated.
    pub async fn finalize(&self, table: &str, ids: &[i64], outcome: Outcome) -> Result<u64, StorageError> {
        let table = validate_table(table)?;
        let now = format_timestamp(Utc::now());
        let mut updated = 0;
        for chunk in ids.chunks(self.finalize_chunk) {
            let mut query = QueryBuilder::<Any>::new(format!("UPDATE {table} SET processing_status = "));
            query.push_bind(outcome.status().as_str().to_string());
            query.push(", updated_at = ");
            query.push_bind(now.clone());
            query.push(" WHERE processing_status = 'processing' AND id IN ");
            push_id_list(&mut query, chunk);
            updated += query.build().execute(&self.pool).await?.rows_affected();
        }
        debug!(table, updated, status = outcome.status().as_str(), "finalized rows");
        Ok(updated)
    }
}

fn push_id_list(query: &mut QueryBuilder<'_, Any>, ids: &[i64]) {
    query.push("(");
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::core::feed::types::{FeedItem, FeedKind, StoredRecord};

    fn record(guid: &str) -> StoredRecord {
        StoredRecord {
            item: FeedItem {
                title: format!("Title {guid}"),
                link: format!("https://example.com/{guid}"),
                guid: guid.to_string(),
                summary: String::new(),
                author: None,
                category: None,
                published_at: None,
                image_url: None,
                visit_url: None,
                cover_image_url: None,
                raw_html: None,
                feed_type: None,
            },
            full_content: Some(format!("content {guid}")),
            content_fetched_at: None,
        }
    }

    async fn file_repository(dir: &tempfile::TempDir, rows: usize) -> FeedRepository {
        let path = dir.path().join("queue.db");
        let repository = FeedRepository::connect(&format!("sqlite://{}?mode=rwc", path.display()), 4)
            .await
            .expect("connect must succeed");
        repository.migrate().await.expect("migrate must succeed");
        let records: Vec<StoredRecord> = (0..rows).map(|index| record(&format!("g{index:03}"))).collect();
        repository
            .upsert_records(FeedKind::TechCrunch, &records)
            .await
            .expect("seed rows");
        repository
    }

    #[tokio::test]
    async fn concurrent_claimants_get_disjoint_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repository = file_repository(&dir, 20).await;
        let queue = WorkQueue::new(&repository);
        let table = FeedKind::TechCrunch.table_name();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.claim::<ClaimedRecord>(table, 5).await })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let claimed = handle.await.expect("task").expect("claim must succeed");
            for row in claimed {
                assert_eq!(row.processing_status, "processing");
                assert!(seen.insert(row.id), "row {} claimed twice", row.id);
            }
        }
        assert_eq!(seen.len(), 20);

        let empty = queue
            .claim::<ClaimedRecord>(table, 5)
            .await
            .expect("claim on drained table");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn claims_come_out_oldest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repository = file_repository(&dir, 3).await;
        let table = FeedKind::TechCrunch.table_name();
        sqlx::query(&format!(
            "UPDATE {table} SET created_at = '2020-01-01 00:00:00' WHERE guid = 'g002'"
        ))
        .execute(repository.pool())
        .await
        .expect("backdate row");

        let claimed = WorkQueue::new(&repository)
            .claim::<ClaimedRecord>(table, 2)
            .await
            .expect("claim");
        let guids: Vec<&str> = claimed.iter().map(|row| row.guid.as_str()).collect();
        assert_eq!(guids, vec!["g002", "g000"]);
        assert_eq!(claimed[0].full_content.as_deref(), Some("content g002"));
    }

    #[tokio::test]
    async fn abandoned_claims_stay_in_processing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repository = file_repository(&dir, 3).await;
        let table = FeedKind::TechCrunch.table_name();
        let queue = WorkQueue::new(&repository);

        let first = queue.claim::<ClaimedRecord>(table, 2).await.expect("claim");
        // The consumer goes away without finalizing.
        drop(first);

        let second = queue.claim::<ClaimedRecord>(table, 10).await.expect("claim");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].guid, "g002");

        let counts = repository.status_counts(table).await.expect("counts");
        assert_eq!(counts.get("processing"), Some(&3));
    }

    #[tokio::test]
    async fn finalize_only_moves_processing_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repository = file_repository(&dir, 5).await;
        let table = FeedKind::TechCrunch.table_name();
        let queue = WorkQueue::new(&repository).with_finalize_chunk(2);

        let claimed = queue.claim::<ClaimedRecord>(table, 3).await.expect("claim");
        let mut ids: Vec<i64> = claimed.iter().map(|row| row.id).collect();
        let pending_id: i64 = sqlx::query(&format!(
            "SELECT id FROM {table} WHERE processing_status = 'pending' ORDER BY id LIMIT 1"
        ))
        .fetch_one(repository.pool())
        .await
        .expect("pending row")
        .get("id");
        ids.push(pending_id);

        let updated = queue
            .finalize(table, &ids, Outcome::Success)
            .await
            .expect("finalize");
        assert_eq!(updated, 3);

        let again = queue
            .finalize(table, &ids, Outcome::Failed)
            .await
            .expect("second finalize");
        assert_eq!(again, 0);

        let counts = repository.status_counts(table).await.expect("counts");
        assert_eq!(counts.get("success"), Some(&3));
        assert_eq!(counts.get("pending"), Some(&2));
        assert_eq!(counts.get("failed"), None);
    }

    #[tokio::test]
    async fn rows_from_tables_without_created_at_are_claimable_after_migrate() {
        let repository = FeedRepository::connect("sqlite::memory:", 1)
            .await
            .expect("connect");
        sqlx::query(
            "CREATE TABLE rss_ycombinator (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT NOT NULL, \
             link TEXT NOT NULL, guid TEXT NOT NULL UNIQUE)",
        )
        .execute(repository.pool())
        .await
        .expect("legacy table");
        sqlx::query(
            "INSERT INTO rss_ycombinator (title, link, guid) VALUES ('old', 'https://x/old', 'old')",
        )
        .execute(repository.pool())
        .await
        .expect("legacy row");

        repository.migrate().await.expect("migrate");

        let claimed = WorkQueue::new(&repository)
            .claim::<ClaimedRecord>("rss_ycombinator", 10)
            .await
            .expect("claim on a migrated table");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].guid, "old");
        assert!(!claimed[0].created_at.is_empty());
    }

    #[tokio::test]
    async fn products_are_claimable_too() {
        let repository = FeedRepository::connect("sqlite::memory:", 1)
            .await
            .expect("connect");
        repository.migrate().await.expect("migrate");
        repository
            .upsert_products(&[crate::core::feed::types::DecohackProduct {
                product_name: "Acme".to_string(),
                tagline: Some("Rockets".to_string()),
                description: None,
                product_url: None,
                image_url: None,
                ph_publish_date: "2024-05-02".to_string(),
                source_guid: "digest".to_string(),
            }])
            .await
            .expect("seed product");

        let claimed = WorkQueue::new(&repository)
            .claim::<ClaimedProduct>(super::super::schema::PRODUCTS_TABLE, 10)
            .await
            .expect("claim products");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].product_name, "Acme");
        assert_eq!(claimed[0].tagline.as_deref(), Some("Rockets"));
    }
}
