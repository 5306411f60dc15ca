//! Usage history rows and queries.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::DbPool;

/// Conversion from stored megabyte-samples to gigabyte-hours. Samples land
/// roughly once a minute, which leaves about 59 usable samples per hour,
/// and 1024 MB make a GB.
pub const GB_HOURS_PER_MB_SAMPLE: f64 = 1.0 / 59.0 / 1024.0;

/// One user's GPU memory on one host at one sampling instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageObservation {
    pub name: String,
    pub mem_mb: i64,
}

/// Aggregated usage for one user over a trailing window.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UsageSum {
    pub name: String,
    pub gb_hours: f64,
}

/// Static query helpers over the `usages` table.
pub struct UsageOps;

impl UsageOps {
    /// Append one row per observation, all stamped `observed_at`. Runs on a
    /// caller-supplied connection so one poll cycle is a single write
    /// transaction.
    pub async fn append(
        conn: &mut SqliteConnection,
        observed_at: DateTime<Utc>,
        observations: &[UsageObservation],
    ) -> Result<(), sqlx::Error> {
        for observation in observations {
            sqlx::query("INSERT INTO usages (name, mem_mb, observed_at) VALUES (?, ?, ?)")
                .bind(&observation.name)
                .bind(observation.mem_mb)
                .bind(observed_at.timestamp())
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Per-user GB-hour sums over observations newer than `cutoff`,
    /// largest first.
    pub async fn sum_since(
        pool: &DbPool,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<UsageSum>, sqlx::Error> {
        sqlx::query_as::<_, UsageSum>(
            "SELECT name, SUM(mem_mb * ?) AS gb_hours \
             FROM usages WHERE observed_at > ? \
             GROUP BY name ORDER BY gb_hours DESC",
        )
        .bind(GB_HOURS_PER_MB_SAMPLE)
        .bind(cutoff.timestamp())
        .fetch_all(pool)
        .await
    }
}
