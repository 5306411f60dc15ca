//! Usage aggregation: an in-process source that folds the host payloads
//! into per-user GB-hour totals.
//!
//! Each cycle reads the trailing windows out of the database, then samples
//! the current per-user GPU memory from every fresh host record and appends
//! the samples in one immediate transaction. Database trouble is a
//! transient failure like any other; the last good payload stays visible.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tracing::debug;

use crate::cache::StatusCache;
use crate::database::usage::{UsageObservation, UsageOps};
use crate::database::{self, DbPool, WritePool};
use crate::poll::{PollError, SourceTask};
use crate::utils::strip_ansi;

/// Trailing aggregation windows, label to hours.
pub const TRAILING_WINDOWS: [(&str, i64); 4] = [("1h", 1), ("24h", 24), ("3d", 72), ("7d", 168)];

/// Per-user GPU memory in a host payload: ` alice(1234M)`.
static USAGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s([a-zA-Z]+)\(([0-9]+)M\)").unwrap());

/// Extract per-user megabytes from one host payload, summing a user's
/// allocations across GPUs.
pub fn extract_usage(payload: &str) -> BTreeMap<String, i64> {
    let clean = strip_ansi(payload);
    let mut totals = BTreeMap::new();
    for captures in USAGE_PATTERN.captures_iter(&clean) {
        let name = captures[1].to_owned();
        if let Ok(mem_mb) = captures[2].parse::<i64>() {
            *totals.entry(name).or_insert(0) += mem_mb;
        }
    }
    totals
}

/// The aggregation source. Reads the cache like any other consumer; never
/// waits on a host poll.
pub struct UsageAggregator {
    cache: Arc<StatusCache>,
    read_pool: DbPool,
    write_pool: WritePool,
    host_keys: Vec<String>,
    staleness: Duration,
}

impl UsageAggregator {
    pub fn new(
        cache: Arc<StatusCache>,
        read_pool: DbPool,
        write_pool: WritePool,
        host_keys: Vec<String>,
        staleness: Duration,
    ) -> Self {
        Self {
            cache,
            read_pool,
            write_pool,
            host_keys,
            staleness,
        }
    }

    /// One line per trailing window, largest consumer first.
    async fn read_windows(&self) -> crate::Result<Vec<String>> {
        let mut lines = Vec::with_capacity(TRAILING_WINDOWS.len());
        for (label, hours) in TRAILING_WINDOWS {
            let cutoff = Utc::now() - chrono::Duration::hours(hours);
            let sums = UsageOps::sum_since(&self.read_pool, cutoff).await?;
            let rendered = if sums.is_empty() {
                "(none)".to_owned()
            } else {
                sums.iter()
                    .map(|sum| format!("{} {:.2}", sum.name, sum.gb_hours))
                    .collect::<Vec<_>>()
                    .join(" | ")
            };
            lines.push(format!("last {label}: {rendered}"));
        }
        Ok(lines)
    }

    /// Sample fresh host records and append their usage in one transaction.
    /// Returns the hosts that contributed.
    async fn record_current(&self) -> crate::Result<Vec<String>> {
        let now = Utc::now();
        let staleness_secs = self.staleness.as_secs() as i64;
        let mut contributed = Vec::new();
        let mut totals: BTreeMap<String, i64> = BTreeMap::new();

        for key in &self.host_keys {
            let record = self.cache.get(key);
            if !record.is_success {
                continue;
            }
            let Some(observed_at) = record.observed_at else {
                continue;
            };
            if now.signed_duration_since(observed_at).num_seconds() > staleness_secs {
                continue;
            }
            contributed.push(key.clone());
            for (name, mem_mb) in extract_usage(&record.payload) {
                *totals.entry(name).or_insert(0) += mem_mb;
            }
        }

        if !totals.is_empty() {
            let observations: Vec<UsageObservation> = totals
                .into_iter()
                .map(|(name, mem_mb)| UsageObservation { name, mem_mb })
                .collect();
            let mut tx = database::begin_immediate(&self.write_pool).await?;
            UsageOps::append(&mut tx, now, &observations).await?;
            tx.commit().await?;
            debug!("appended {} usage observations", observations.len());
        }

        Ok(contributed)
    }
}

#[async_trait]
impl SourceTask for UsageAggregator {
    async fn run(&self) -> Result<String, PollError> {
        let (mut lines, read_error) = match self.read_windows().await {
            Ok(lines) => (lines, None),
            Err(err) => (Vec::new(), Some(err.to_string())),
        };
        let (hosts, write_error) = match self.record_current().await {
            Ok(hosts) => (hosts, None),
            Err(err) => (Vec::new(), Some(err.to_string())),
        };

        if read_error.is_some() || write_error.is_some() {
            return Err(PollError::transient(format!(
                "db error: <read> {} <write> {}",
                read_error.as_deref().unwrap_or("ok"),
                write_error.as_deref().unwrap_or("ok"),
            )));
        }

        lines.push(format!(
            "hosts: {}",
            if hosts.is_empty() {
                "(none)".to_owned()
            } else {
                hosts.join(" ")
            }
        ));
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ensure_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn extracts_and_sums_per_user_memory() {
        let payload = "gpu7  driver 535  cpu 3.3%\n\
            [0] A100 | 34C | alice(1234M) bob(500M)\n\
            [1] A100 | 31C | alice(766M)";

        let totals = extract_usage(payload);

        assert_eq!(totals.len(), 2);
        assert_eq!(totals["alice"], 2000);
        assert_eq!(totals["bob"], 500);
    }

    #[test]
    fn extraction_sees_through_ansi_colors() {
        let payload = " \x1b[36malice\x1b[m(\x1b[33m1234M\x1b[m)";

        let totals = extract_usage(payload);

        assert_eq!(totals["alice"], 1234);
    }

    #[test]
    fn extraction_ignores_non_matching_text() {
        assert!(extract_usage("cpu 3.3%  mem 47G/251G  cuda 12.1").is_empty());
        // Missing leading whitespace does not match.
        assert!(extract_usage("alice(1234M)").is_empty());
    }

    async fn setup_pool() -> DbPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ensure_schema(&pool).await.unwrap();
        pool
    }

    fn aggregator(cache: Arc<StatusCache>, pool: &DbPool, hosts: &[&str]) -> UsageAggregator {
        UsageAggregator::new(
            cache,
            pool.clone(),
            pool.clone(),
            hosts.iter().map(|h| (*h).to_owned()).collect(),
            Duration::from_secs(100),
        )
    }

    #[tokio::test]
    async fn fresh_hosts_contribute_and_windows_fill_up() {
        let pool = setup_pool().await;
        let cache = Arc::new(StatusCache::new());
        cache.update_success("db15", "[0] A100 | alice(590M)");
        let task = aggregator(cache, &pool, &["db15"]);

        let first = task.run().await.unwrap();
        // The windows are read before the new sample lands.
        assert!(first.contains("last 1h: (none)"), "{first}");
        assert!(first.contains("hosts: db15"), "{first}");

        let second = task.run().await.unwrap();
        assert!(second.contains("last 1h: alice"), "{second}");

        let sums = UsageOps::sum_since(&pool, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums[0].name, "alice");
    }

    #[tokio::test]
    async fn failed_hosts_are_left_out() {
        let pool = setup_pool().await;
        let cache = Arc::new(StatusCache::new());
        cache.update_failure("db15", "timed out");
        let task = aggregator(cache, &pool, &["db15"]);

        let payload = task.run().await.unwrap();

        assert!(payload.contains("hosts: (none)"), "{payload}");
        let sums = UsageOps::sum_since(&pool, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(sums.is_empty());
    }

    #[tokio::test]
    async fn hosts_without_users_still_count_as_fresh() {
        let pool = setup_pool().await;
        let cache = Arc::new(StatusCache::new());
        cache.update_success("db15", "[0] A100 | 34C | idle");
        let task = aggregator(cache, &pool, &["db15"]);

        let payload = task.run().await.unwrap();

        assert!(payload.contains("hosts: db15"), "{payload}");
    }

    #[tokio::test]
    async fn database_trouble_is_a_transient_error() {
        let pool = setup_pool().await;
        sqlx::query("DROP TABLE usages").execute(&pool).await.unwrap();
        let cache = Arc::new(StatusCache::new());
        cache.update_success("db15", "[0] A100 | alice(590M)");
        let task = aggregator(cache, &pool, &["db15"]);

        let err = task.run().await.unwrap_err();

        assert!(!err.is_fatal());
        assert!(err.message().contains("db error"), "{err}");
    }
}
