//! Logging setup: console output plus daily-rotated files with retention.

use std::io::Write;
use std::path::Path;

use chrono::{Local, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "fleetmon=info,sqlx=warn";

/// Log file prefix; daily rotation appends the date.
pub const LOG_FILE_PREFIX: &str = "fleetmon.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

/// One timestamp format everywhere, so crash records line up with the
/// surrounding log lines.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Timestamps in the server's local timezone, easier to line up with the
/// shells of the hosts being polled.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format(TIMESTAMP_FORMAT))
    }
}

/// Initialize console and file logging.
///
/// Returns the appender guard; keep it alive for the process lifetime so
/// buffered file output still flushes at shutdown.
pub fn init_logging(log_dir: &Path) -> crate::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| crate::Error::other(format!("failed to set global subscriber: {e}")))?;

    Ok(guard)
}

/// Append a crash record to today's log file, bypassing the non-blocking
/// writer. Called from the panic hook, where there is nowhere left to
/// report a failure, so errors are swallowed.
pub(crate) fn append_crash_record(log_dir: &Path, record: &str) {
    let now = Local::now();
    let path = log_dir.join(format!("{LOG_FILE_PREFIX}.{}", now.format("%Y-%m-%d")));
    let _ = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{} {record}", now.format(TIMESTAMP_FORMAT)));
}

/// Start the daily log retention sweep; stops when the token cancels.
pub fn start_retention_cleanup(log_dir: &Path, cancel_token: CancellationToken) {
    let log_dir = log_dir.to_path_buf();

    tokio::spawn(async move {
        let cleanup_interval = std::time::Duration::from_secs(24 * 60 * 60);

        // First sweep right away; a long-idle deployment can have a backlog.
        if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
            warn!("failed to clean up old logs: {e}");
        }

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("log retention sweep shutting down");
                    break;
                }
                _ = tokio::time::sleep(cleanup_interval) => {
                    if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                        warn!("failed to clean up old logs: {e}");
                    }
                }
            }
        }
    });
}

/// Delete rotated log files older than `retention_days`.
async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<()> {
    let cutoff_ts = (Utc::now() - chrono::Duration::days(retention_days)).timestamp();
    let dated_prefix = format!("{LOG_FILE_PREFIX}.");

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(&dated_prefix))
        else {
            continue;
        };

        if let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
            let file_ts = file_date
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp())
                .unwrap_or(0);

            if file_ts < cutoff_ts {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("failed to delete old log file {}: {e}", path.display());
                } else {
                    deleted_count += 1;
                    debug!("deleted old log file {}", path.display());
                }
            }
        }
    }

    if deleted_count > 0 {
        info!("cleaned up {deleted_count} old log files");
    }

    Ok(())
}
