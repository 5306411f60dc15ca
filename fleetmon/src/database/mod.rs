//! SQLite persistence for usage history.
//!
//! Two pools share one database file: a read pool sized to the host for the
//! aggregation queries, and a single-connection write pool so writers queue
//! on acquire instead of fighting over the file lock. WAL mode keeps reads
//! unblocked while the usage aggregator appends.

pub mod usage;

use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};

/// Read pool alias.
pub type DbPool = Pool<Sqlite>;
/// Single-connection pool reserved for writes.
pub type WritePool = Pool<Sqlite>;

/// Cap for the read pool; SQLite readers gain little beyond this.
const MAX_READ_POOL_SIZE: u32 = 10;

/// How long a connection waits on SQLite locks before erroring.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Page cache size; negative means KB, so this is 64MB.
const DEFAULT_CACHE_SIZE_KB: i32 = -64000;

/// WAL auto-checkpoint threshold in pages (~4MB at the default page size).
const DEFAULT_WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

/// Limit WAL size growth (bytes).
const DEFAULT_JOURNAL_SIZE_LIMIT_BYTES: i64 = 64 * 1024 * 1024; // 64MB

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        // WAL keeps aggregation reads unblocked during appends.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true))
}

async fn apply_per_connection_pragmas(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    // Keep the WAL from growing without bound between checkpoints.
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {DEFAULT_WAL_AUTOCHECKPOINT_PAGES}"
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "PRAGMA journal_size_limit = {DEFAULT_JOURNAL_SIZE_LIMIT_BYTES}"
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!("PRAGMA cache_size = {DEFAULT_CACHE_SIZE_KB}"))
        .execute(&mut *conn)
        .await?;

    sqlx::query("PRAGMA mmap_size = 268435456") // 256MB
        .execute(&mut *conn)
        .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn ensure_wal_mode(pool: &DbPool, pool_name: &str) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?;
    let mode: String = row.get(0);
    // In-memory databases report "memory" and cannot switch to WAL.
    if mode != "wal" && mode != "memory" {
        tracing::warn!("{pool_name} journal_mode was '{mode}', expected 'wal'; re-setting");
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Read pool size derived from the CPU count, capped where SQLite stops
/// benefiting.
pub fn default_read_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(MAX_READ_POOL_SIZE)
}

/// Initialize the read pool with the default size.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, default_read_pool_size()).await
}

/// Initialize the read pool with WAL mode and the per-connection pragmas.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    ensure_wal_mode(&pool, "read_pool").await?;

    tracing::info!("read pool initialized with {max_connections} max connections");

    Ok(pool)
}

/// Initialize the serialized write pool (`max_connections = 1`).
///
/// All writes that use `BEGIN IMMEDIATE` go through this pool, so only one
/// connection ever attempts to take the SQLite write lock and contention
/// becomes queueing on acquire.
pub async fn init_write_pool(database_url: &str) -> Result<WritePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(60))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    ensure_wal_mode(&pool, "write_pool").await?;

    // Fold whatever WAL a previous run left behind back into the main file
    // without blocking readers.
    {
        let mut conn = pool.acquire().await?;
        let row: (i32, i32, i32) = sqlx::query_as("PRAGMA wal_checkpoint(PASSIVE)")
            .fetch_one(&mut *conn)
            .await?;
        tracing::debug!(
            "write pool startup WAL checkpoint: busy={}, checkpointed={}, total={}",
            row.0,
            row.1,
            row.2
        );
    }

    tracing::info!("write pool initialized with 1 max connection");

    Ok(pool)
}

/// Create the usage history schema if missing. Idempotent; runs on the
/// write pool at startup, before any poll loop spawns.
pub async fn ensure_schema(pool: &WritePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS usages (
            name TEXT NOT NULL,
            mem_mb INTEGER NOT NULL,
            observed_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_usages_observed_at ON usages (observed_at)")
        .execute(pool)
        .await?;
    Ok(())
}

/// Start a write transaction that takes SQLite's reserved lock up front, so
/// contention surfaces at BEGIN (under busy_timeout) rather than at COMMIT.
pub async fn begin_immediate(pool: &WritePool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE;").execute(&mut *conn).await?;
    Ok(ImmediateTransaction {
        conn,
        finished: false,
    })
}

/// A `BEGIN IMMEDIATE` transaction on a pooled connection.
///
/// Must be finished with [`commit`](Self::commit) or
/// [`rollback`](Self::rollback); a transaction dropped mid-flight closes
/// its connection, which makes SQLite roll the work back.
pub struct ImmediateTransaction {
    conn: PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT;").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK;").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl Deref for ImmediateTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            // A connection returned to the pool mid-transaction would poison
            // later writes; closing it forces the rollback.
            self.conn.close_on_drop();
        }
    }
}
