use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::db;

// Resilience envelope: every query gets QUERY_ATTEMPTS total tries; a
// transient failure poisons the pool and triggers a deduplicated recreation.
const QUERY_ATTEMPTS: u32 = 4;
const PROBE_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const QUERY_BACKOFF_CAP: Duration = Duration::from_secs(5);
const PROBE_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Failures surfaced by the persistent store client.
#[derive(Debug)]
pub enum StoreError {
    /// The query failed and was not worth retrying (or retries ran out).
    Query(sqlx::Error),
    /// The connection pool could not be recreated after repeated probes.
    Unavailable,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Query(e) => write!(f, "store query failed: {e}"),
            StoreError::Unavailable => write!(f, "store pool cannot be recreated"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Port for snapshot persistence: `(code → blob)` with last-write-wins.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn upsert(&self, code: &str, blob: &[u8]) -> Result<(), StoreError>;
    async fn upsert_batch(&self, entries: &[(String, Vec<u8>)]) -> Result<(), StoreError>;
    async fn load(&self, code: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Port for persisting the lobby-code counter between process lifetimes.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn load_counter(&self) -> Result<u64, StoreError>;
    async fn save_counter(&self, value: u64) -> Result<(), StoreError>;
}

// One retryable unit of work against the sessions schema.
enum Query<'a> {
    Upsert { code: &'a str, blob: &'a [u8] },
    UpsertBatch { entries: &'a [(String, Vec<u8>)] },
    Load { code: &'a str },
    LoadCounter,
    SaveCounter { value: u64 },
}

impl Query<'_> {
    fn label(&self) -> &'static str {
        match self {
            Query::Upsert { .. } => "upsert",
            Query::UpsertBatch { .. } => "upsert_batch",
            Query::Load { .. } => "load",
            Query::LoadCounter => "load_counter",
            Query::SaveCounter { .. } => "save_counter",
        }
    }
}

enum QueryOutput {
    Done,
    Blob(Option<Vec<u8>>),
    Counter(u64),
}

/// Postgres-backed store client with transparent retry and pool healing.
pub struct PgSessionStore {
    database_url: String,
    pool: RwLock<PgPool>,
    // Bumped on every successful recreation; callers that observed an older
    // generation know someone else already healed the pool.
    generation: AtomicU64,
    heal_lock: Mutex<()>,
}

impl PgSessionStore {
    pub fn new(database_url: String, pool: PgPool) -> Self {
        Self {
            database_url,
            pool: RwLock::new(pool),
            generation: AtomicU64::new(0),
            heal_lock: Mutex::new(()),
        }
    }

    async fn run(&self, query: Query<'_>) -> Result<QueryOutput, StoreError> {
        let mut attempt = 1u32;
        loop {
            let generation = self.generation.load(Ordering::Acquire);
            let pool = self.pool.read().await.clone();

            match self.execute(&pool, &query).await {
                Ok(output) => return Ok(output),
                Err(e) if is_transient(&e) && attempt < QUERY_ATTEMPTS => {
                    warn!(
                        query = query.label(),
                        attempt,
                        error = %e,
                        "transient store failure; healing pool"
                    );
                    if let Err(heal_err) = self.heal(generation).await {
                        warn!(error = %heal_err, "pool recreation failed");
                    }
                    tokio::time::sleep(backoff(attempt, QUERY_BACKOFF_CAP)).await;
                    attempt += 1;
                }
                Err(e) => return Err(StoreError::Query(e)),
            }
        }
    }

    async fn execute(&self, pool: &PgPool, query: &Query<'_>) -> Result<QueryOutput, sqlx::Error> {
        match query {
            Query::Upsert { code, blob } => {
                upsert_session(pool, code, blob).await?;
                Ok(QueryOutput::Done)
            }
            Query::UpsertBatch { entries } => {
                // Atomic batch: either every row lands or none do.
                let mut tx = pool.begin().await?;
                for (code, blob) in entries.iter() {
                    sqlx::query(UPSERT_SESSION)
                        .bind(code)
                        .bind(blob.as_slice())
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(QueryOutput::Done)
            }
            Query::Load { code } => {
                let blob: Option<Vec<u8>> =
                    sqlx::query_scalar("SELECT save_state FROM sessions WHERE code = $1")
                        .bind(code)
                        .fetch_optional(pool)
                        .await?;
                Ok(QueryOutput::Blob(blob))
            }
            Query::LoadCounter => {
                let value: Option<i64> =
                    sqlx::query_scalar("SELECT next_value FROM lobby_counter WHERE id = 0")
                        .fetch_optional(pool)
                        .await?;
                Ok(QueryOutput::Counter(value.unwrap_or(0).max(0) as u64))
            }
            Query::SaveCounter { value } => {
                sqlx::query(
                    r#"
                    INSERT INTO lobby_counter (id, next_value)
                    VALUES (0, $1)
                    ON CONFLICT (id) DO UPDATE SET
                        next_value = EXCLUDED.next_value
                    "#,
                )
                .bind(*value as i64)
                .execute(pool)
                .await?;
                Ok(QueryOutput::Done)
            }
        }
    }

    // Recreate the pool once, no matter how many callers hit the failure.
    async fn heal(&self, observed_generation: u64) -> Result<(), StoreError> {
        let _guard = self.heal_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != observed_generation {
            // Another caller already swapped in a fresh pool.
            return Ok(());
        }

        let poisoned = self.pool.read().await.clone();
        poisoned.close().await;

        for probe in 1..=PROBE_ATTEMPTS {
            match db::connect_pool(&self.database_url).await {
                Ok(pool) => match pool.acquire().await {
                    Ok(conn) => {
                        drop(conn);
                        *self.pool.write().await = pool;
                        self.generation.fetch_add(1, Ordering::Release);
                        info!("store pool recreated");
                        return Ok(());
                    }
                    Err(e) => warn!(probe, error = %e, "pool probe failed"),
                },
                Err(e) => warn!(probe, error = %e, "pool connect failed"),
            }
            if probe < PROBE_ATTEMPTS {
                tokio::time::sleep(backoff(probe, PROBE_BACKOFF_CAP)).await;
            }
        }

        Err(StoreError::Unavailable)
    }
}

const UPSERT_SESSION: &str = r#"
    INSERT INTO sessions (code, save_state, updated_at)
    VALUES ($1, $2, NOW())
    ON CONFLICT (code) DO UPDATE SET
        save_state = EXCLUDED.save_state,
        updated_at = NOW()
"#;

async fn upsert_session(pool: &PgPool, code: &str, blob: &[u8]) -> Result<(), sqlx::Error> {
    sqlx::query(UPSERT_SESSION)
        .bind(code)
        .bind(blob)
        .execute(pool)
        .await?;
    Ok(())
}

#[async_trait]
impl SnapshotStore for PgSessionStore {
    async fn upsert(&self, code: &str, blob: &[u8]) -> Result<(), StoreError> {
        self.run(Query::Upsert { code, blob }).await.map(|_| ())
    }

    async fn upsert_batch(&self, entries: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.run(Query::UpsertBatch { entries }).await.map(|_| ())
    }

    async fn load(&self, code: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.run(Query::Load { code }).await? {
            QueryOutput::Blob(blob) => Ok(blob),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl CounterStore for PgSessionStore {
    async fn load_counter(&self) -> Result<u64, StoreError> {
        match self.run(Query::LoadCounter).await? {
            QueryOutput::Counter(value) => Ok(value),
            _ => Ok(0),
        }
    }

    async fn save_counter(&self, value: u64) -> Result<(), StoreError> {
        self.run(Query::SaveCounter { value }).await.map(|_| ())
    }
}

// A failure is transient when the driver lost its connection or the pool is
// saturated; anything else propagates unchanged.
fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // Class 08: connection exception; 53300: too_many_connections;
            // 57P01..57P03: server shutdown / cannot connect now.
            Some(code) => {
                code.starts_with("08")
                    || code == "53300"
                    || code == "57P01"
                    || code == "57P02"
                    || code == "57P03"
            }
            None => false,
        },
        _ => false,
    }
}

fn backoff(attempt: u32, cap: Duration) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << (attempt - 1).min(16));
    exp.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_the_driver_reports_io_or_pool_failures_then_they_classify_as_transient() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_transient(&io));
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::PoolClosed));
        assert!(is_transient(&sqlx::Error::WorkerCrashed));
    }

    #[test]
    fn when_the_failure_is_not_connection_shaped_then_it_is_not_transient() {
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(!is_transient(&sqlx::Error::ColumnNotFound("code".into())));
    }

    #[test]
    fn backoff_doubles_from_the_base_and_respects_the_cap() {
        assert_eq!(backoff(1, QUERY_BACKOFF_CAP), Duration::from_millis(200));
        assert_eq!(backoff(2, QUERY_BACKOFF_CAP), Duration::from_millis(400));
        assert_eq!(backoff(3, QUERY_BACKOFF_CAP), Duration::from_millis(800));
        assert_eq!(backoff(10, QUERY_BACKOFF_CAP), QUERY_BACKOFF_CAP);
        assert_eq!(backoff(10, PROBE_BACKOFF_CAP), PROBE_BACKOFF_CAP);
    }
}
