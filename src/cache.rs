use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::{SnapshotStore, StoreError};

// One cached game state. The sequence breaks timestamp ties so eviction
// order stays deterministic within a single millisecond.
#[derive(Debug, Clone)]
struct Snapshot {
    blob: Vec<u8>,
    saved_at_ms: u64,
    seq: u64,
}

/// Bounded in-memory layer over the persistent store: recently saved game
/// states stay hot; the oldest write is flushed out when the bound is hit.
pub struct SnapshotCache {
    capacity: usize,
    store: Arc<dyn SnapshotStore>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Snapshot>,
    next_seq: u64,
}

impl SnapshotCache {
    pub fn new(capacity: usize, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            capacity,
            store,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Saves a snapshot, overwriting any previous entry for the code. When
    /// the cache outgrows its bound, the entry with the oldest write is
    /// flushed to the store in the background and dropped.
    pub async fn save(&self, code: &str, blob: Vec<u8>) {
        let evicted = {
            let mut inner = self.inner.lock().await;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.entries.insert(
                code.to_string(),
                Snapshot {
                    blob,
                    saved_at_ms: epoch_millis(),
                    seq,
                },
            );
            self.evict_if_over_bound(&mut inner)
        };

        if let Some((evicted_code, evicted_blob)) = evicted {
            debug!(code = %evicted_code, "snapshot cache full; flushing oldest entry");
            let store = self.store.clone();
            tokio::spawn(async move {
                // An upsert failure is logged but the entry is not re-inserted.
                if let Err(e) = store.upsert(&evicted_code, &evicted_blob).await {
                    warn!(code = %evicted_code, error = %e, "failed to flush evicted snapshot");
                }
            });
        }
    }

    /// Returns the snapshot for a code. On a cache miss the store is
    /// consulted, and a hit re-populates the cache so a restored lobby can
    /// be flushed again later. The read is non-destructive either way.
    pub async fn load(&self, code: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(blob) = {
            let inner = self.inner.lock().await;
            inner.entries.get(code).map(|s| s.blob.clone())
        } {
            return Ok(Some(blob));
        }

        // The store read completes before re-caching, so concurrent restores
        // of the same code settle on one blob.
        match self.store.load(code).await? {
            Some(blob) => {
                self.save(code, blob.clone()).await;
                Ok(Some(blob))
            }
            None => Ok(None),
        }
    }

    /// Cache-only membership test.
    pub async fn has(&self, code: &str) -> bool {
        self.inner.lock().await.entries.contains_key(code)
    }

    /// Clones every cached entry, for the periodic bulk flush.
    pub async fn snapshot_all(&self) -> Vec<(String, Vec<u8>)> {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .map(|(code, snapshot)| (code.clone(), snapshot.blob.clone()))
            .collect()
    }

    fn evict_if_over_bound(&self, inner: &mut Inner) -> Option<(String, Vec<u8>)> {
        if inner.entries.len() <= self.capacity {
            return None;
        }
        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, s)| (s.saved_at_ms, s.seq))
            .map(|(code, _)| code.clone())?;
        inner
            .entries
            .remove(&oldest)
            .map(|snapshot| (oldest, snapshot.blob))
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
