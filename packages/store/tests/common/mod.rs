use std::time::Duration;

use store::{JobStore, StoreConfig, StoreError};

pub const LONG_TTL: Duration = Duration::from_secs(60);

/// One instance of every backend, each empty.
pub async fn stores(ttl: Duration) -> Result<Vec<JobStore>, StoreError> {
    Ok(vec![
        JobStore::memory(ttl),
        JobStore::open(&StoreConfig::surreal_memory(), ttl).await?,
    ])
}
