use std::time::Duration;

use tracing::info;

use crate::observability::COMPACTIONS_TOTAL;
use crate::store::MemoryStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(store: MemoryStore, threshold: u64) {
    run_compactor_every(store, threshold, CHECK_INTERVAL).await
}

async fn run_compactor_every(store: MemoryStore, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Returns true when a compaction ran and succeeded.
pub async fn compact_if_due(store: &MemoryStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => {
            info!("WAL compacted after {appends} appends");
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "error").increment(1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resource;
    use crate::store::Catalog;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn add_resources(store: &MemoryStore, n: usize) {
        for _ in 0..n {
            store
                .create_resource(Resource {
                    id: Ulid::new(),
                    name: None,
                    is_bookable: true,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = MemoryStore::open(&path).unwrap();

        add_resources(&store, 3).await;
        assert!(!compact_if_due(&store, 5).await);
        assert_eq!(store.wal_appends_since_compact().await, 3);

        add_resources(&store, 2).await;
        assert!(compact_if_due(&store, 5).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);

        drop(store);
        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.resource_count(), 5);
    }

    #[tokio::test]
    async fn volatile_store_never_compacts() {
        let store = MemoryStore::new();
        add_resources(&store, 3).await;
        assert!(!compact_if_due(&store, 1).await);
    }

    #[tokio::test]
    async fn background_loop_compacts() {
        let path = test_wal_path("loop.wal");
        let store = MemoryStore::open(&path).unwrap();
        add_resources(&store, 4).await;

        let handle = tokio::spawn(run_compactor_every(store.clone(), 2, Duration::from_millis(10)));
        let mut compacted = false;
        for _ in 0..100 {
            if store.wal_appends_since_compact().await == 0 {
                compacted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(compacted);
    }
}
