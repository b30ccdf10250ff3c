use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use tracing::{error, info};

use crate::core::feed::types::FeedKind;
use crate::core::storage::{FeedRepository, StorageError, TableStats, PRODUCTS_TABLE};

fn managed_tables() -> impl Iterator<Item = &'static str> {
    FeedKind::ALL
        .into_iter()
        .map(|kind| kind.table_name())
        .chain(std::iter::once(PRODUCTS_TABLE))
}

/// Deletes rows created more than `days` days ago. Returns deleted counts per table.
pub async fn cleanup_old_data(
    repository: &FeedRepository,
    days: i64,
) -> Result<BTreeMap<String, u64>, StorageError> {
    let cutoff = Utc::now() - Duration::days(days.max(0));
    let mut deleted = BTreeMap::new();
    for table in managed_tables() {
        let removed = repository.delete_created_before(table, cutoff).await?;
        if removed > 0 {
            info!(table, removed, days, "removed expired rows");
        }
        deleted.insert(table.to_string(), removed);
    }
    Ok(deleted)
}

/// Row counts per table. `today` counts rows created since UTC midnight.
pub async fn collect_stats(repository: &FeedRepository) -> Result<Vec<TableStats>, StorageError> {
    let day_start = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or_else(Utc::now);
    let mut stats = Vec::new();
    for table in managed_tables() {
        stats.push(repository.table_stats(table, day_start).await?);
    }
    Ok(stats)
}

/// Result of the post-run housekeeping. Failures are kept as messages so a
/// finished ingestion run is still reported.
#[derive(Debug, Default)]
pub struct Housekeeping {
    pub deleted: u64,
    pub stats: Vec<TableStats>,
    pub errors: Vec<String>,
}

/// Retention cleanup followed by stats collection. Never fails.
pub async fn housekeeping(repository: &FeedRepository, retention_days: i64) -> Housekeeping {
    let mut report = Housekeeping::default();
    match cleanup_old_data(repository, retention_days).await {
        Ok(deleted) => report.deleted = deleted.values().sum(),
        Err(err) => {
            error!(error = %err, "retention cleanup failed");
            report.errors.push(format!("cleanup: {err}"));
        }
    }
    match collect_stats(repository).await {
        Ok(stats) => report.stats = stats,
        Err(err) => {
            error!(error = %err, "collecting table stats failed");
            report.errors.push(format!("stats: {err}"));
        }
    }
    report
}
