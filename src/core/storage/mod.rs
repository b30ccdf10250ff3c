pub mod claim;
pub mod models;
pub mod repository;
pub mod schema;

pub use claim::{Claimable, WorkQueue};
pub use models::{ClaimedProduct, ClaimedRecord, Outcome, ProcessingStatus, TableStats};
pub use repository::{FeedRepository, StorageError};
pub use schema::{Dialect, PRODUCTS_TABLE};
