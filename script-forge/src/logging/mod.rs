//! Tracing setup for the service.
//!
//! Events go to the console and to a daily file under the configured log
//! directory. The filter can be swapped at runtime through [`LoggingConfig`],
//! and files past the retention window are swept in the background.

use chrono::{Local, NaiveDate, SecondsFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, format::Writer, time::FormatTime};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, reload};

use crate::error::{Error, Result};

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "script_forge=info,tower_http=info";

/// File name stem; the appender adds a `.YYYY-MM-DD` suffix.
const LOG_FILE_PREFIX: &str = "script-forge.log";

const KEEP_DAYS: u64 = 7;
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// RFC 3339 timestamps with milliseconds, in local time.
#[derive(Debug, Clone, Copy)]
struct LocalClock;

impl FormatTime for LocalClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        w.write_str(&Local::now().to_rfc3339_opts(SecondsFormat::Millis, false))
    }
}

type ReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Runtime handle over the installed subscriber.
pub struct LoggingConfig {
    filter: ReloadHandle,
    directory: PathBuf,
}

impl LoggingConfig {
    fn new(filter: ReloadHandle, directory: PathBuf) -> Self {
        Self { filter, directory }
    }

    /// The active filter, rendered as directives.
    pub fn get_filter(&self) -> String {
        self.filter
            .with_current(ToString::to_string)
            .unwrap_or_default()
    }

    /// Replace the active filter, e.g. with `script_forge=debug`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let parsed: EnvFilter = directive
            .parse()
            .map_err(|e| Error::config(format!("invalid log filter '{}': {}", directive, e)))?;

        self.filter
            .modify(|current| *current = parsed)
            .map_err(|e| Error::Other(format!("log filter could not be swapped: {}", e)))?;

        info!(filter = %directive, "Log filter changed");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.directory
    }

    /// Sweep expired log files now and then daily until `shutdown`.
    pub fn start_retention_cleanup(self: &Arc<Self>, shutdown: CancellationToken) {
        let directory = self.directory.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while shutdown.run_until_cancelled(ticker.tick()).await.is_some() {
                let cutoff = Local::now().date_naive() - chrono::Days::new(KEEP_DAYS);
                match sweep_expired_logs(&directory, cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Expired log files removed"),
                    Err(e) => warn!(dir = %directory.display(), error = %e, "Log sweep failed"),
                }
            }
            debug!("Log retention sweeper stopped");
        });
    }
}

/// Date stamped on a rolled log file, if `file_name` is one.
fn rolled_file_date(file_name: &str) -> Option<NaiveDate> {
    let stamp = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}

/// Remove rolled log files dated before `cutoff`. Other files in the
/// directory are left alone. Returns how many were removed.
async fn sweep_expired_logs(directory: &Path, cutoff: NaiveDate) -> std::io::Result<usize> {
    let mut expired = Vec::new();
    let mut entries = tokio::fs::read_dir(directory).await?;
    while let Some(entry) = entries.next_entry().await? {
        let is_expired = entry
            .file_name()
            .to_str()
            .and_then(rolled_file_date)
            .is_some_and(|date| date < cutoff);
        if is_expired && entry.file_type().await?.is_file() {
            expired.push(entry.path());
        }
    }

    let mut removed = 0;
    for path in expired {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Could not remove expired log file");
            continue;
        }
        debug!(path = %path.display(), "Removed expired log file");
        removed += 1;
    }
    Ok(removed)
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; hold it until exit.
pub fn init_logging(log_dir: impl AsRef<Path>) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    let directory = log_dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&directory)?;

    let starting_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|raw| raw.parse::<EnvFilter>().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter, handle) = reload::Layer::new(starting_filter);

    let appender = tracing_appender::rolling::daily(&directory, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let console = fmt::layer().with_timer(LocalClock);
    let file = fmt::layer()
        .with_ansi(false)
        .with_timer(LocalClock)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Other(format!("tracing subscriber already installed: {}", e)))?;

    Ok((Arc::new(LoggingConfig::new(handle, directory)), guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("script_forge=info"));
    }

    #[test]
    fn test_filter_reload() {
        let (_layer, handle): (_, ReloadHandle) = reload::Layer::new(EnvFilter::new("info"));
        let config = LoggingConfig::new(handle, PathBuf::from("logs"));

        config.set_filter("script_forge=debug").unwrap();
        assert_eq!(config.get_filter(), "script_forge=debug");
        assert!(matches!(
            config.set_filter("script_forge=loudest"),
            Err(Error::Configuration(_))
        ));
        assert_eq!(config.get_filter(), "script_forge=debug");
    }

    #[test]
    fn test_rolled_file_date() {
        assert_eq!(
            rolled_file_date("script-forge.log.2024-03-09"),
            NaiveDate::from_ymd_opt(2024, 3, 9)
        );
        assert_eq!(rolled_file_date("script-forge.log"), None);
        assert_eq!(rolled_file_date("script-forge.log.latest"), None);
        assert_eq!(rolled_file_date("other.log.2024-03-09"), None);
    }

    #[tokio::test]
    async fn test_sweep_expired_logs() {
        let dir = tempfile::tempdir().unwrap();
        let today = Local::now().date_naive();
        let old = dir.path().join("script-forge.log.2000-01-01");
        let fresh = dir
            .path()
            .join(format!("script-forge.log.{}", today.format("%Y-%m-%d")));
        let other = dir.path().join("notes.txt");
        for path in [&old, &fresh, &other] {
            std::fs::write(path, "x").unwrap();
        }

        let cutoff = today - chrono::Days::new(KEEP_DAYS);
        let removed = sweep_expired_logs(dir.path(), cutoff).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }
}
