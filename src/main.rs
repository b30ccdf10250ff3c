use rssr_ingest::core::maintenance::housekeeping;
use rssr_ingest::{init_tracing, AppServices, IngestConfig, IngestError, Ingestor};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), IngestError> {
    init_tracing();

    let config = IngestConfig::from_env()?;
    let services = AppServices::from_config(&config).await?;
    services.repository.migrate().await?;
    info!(feeds = config.feeds.len(), "starting ingestion run");

    let ingestor = Ingestor::new(services);
    let summary = ingestor.run(&config.feeds).await;

    let report = housekeeping(&ingestor.services().repository, config.retention_days).await;
    info!(
        deleted = report.deleted,
        retention_days = config.retention_days,
        errors = report.errors.len(),
        "housekeeping finished"
    );
    for stats in &report.stats {
        info!(
            table = %stats.table,
            total = stats.total,
            today = stats.today,
            pending = stats.pending,
            "table stats"
        );
    }

    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(err) => error!(error = %err, "failed to serialise run summary"),
    }
    Ok(())
}
