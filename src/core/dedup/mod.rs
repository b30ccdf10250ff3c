use std::collections::HashSet;

use crate::core::feed::types::FeedItem;

/// Keeps the items whose guid is neither stored already nor repeated earlier
/// in the same batch. Input order is preserved.
pub fn filter_new(existing: &HashSet<String>, items: Vec<FeedItem>) -> Vec<FeedItem> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| !existing.contains(&item.guid) && seen.insert(item.guid.clone()))
        .collect()
}
