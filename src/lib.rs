pub mod core;

pub use crate::core::config::{FeedSource, IngestConfig};
pub use crate::core::error::{ErrorKind, IngestError};
pub use crate::core::ingest::{FeedReport, Ingestor, RunSummary};
pub use crate::core::storage::{FeedRepository, Outcome, WorkQueue};
pub use crate::core::AppServices;

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` overrides the default filter;
/// `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rssr_ingest=info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
