//! Environment-driven configuration.
//!
//! Values come from the process environment after `.env` has been loaded.
//! Unset or unparsable variables fall back to the documented defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

use crate::pipeline::EngineConfig;
use crate::queue::{HttpBackendConfig, PollBudget, QueueClientConfig};

/// Read `name` and parse it, falling back to `default`.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, "Ignoring unparsable environment variable");
                default
            }
        },
        _ => default,
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub backend: HttpBackendConfig,
    pub queue: QueueClientConfig,
    pub engine: EngineConfig,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// Directory the file sink writes results to.
    pub output_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: HttpBackendConfig::default(),
            queue: QueueClientConfig::default(),
            engine: EngineConfig::default(),
            log_dir: PathBuf::from("./logs"),
            output_dir: PathBuf::from("./output"),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GENERATION_API_KEY` (or `FAL_KEY`): backend credential
    /// - `GENERATION_BASE_URL`: queue base URL (default: https://queue.fal.run)
    /// - `GENERATION_APP`: application path (default: fal-ai/any-llm)
    /// - `GENERATION_TIMEOUT_SECS`: per-request HTTP timeout (default: 30)
    /// - `LOG_DIR`: log directory (default: ./logs)
    /// - `OUTPUT_DIR`: result directory (default: ./output)
    /// - `PIPELINE_MAX_ATTEMPTS`: attempts per work item (default: 3)
    /// - `PIPELINE_ITEM_CONCURRENCY`: items processed at once (default: 1)
    /// - `QUEUE_BATCH_SIZE`: status checks per batch (default: 10)
    /// - `QUEUE_BATCH_DELAY_MS`: pause between status batches (default: 200)
    /// - `QUEUE_POLL_INTERVAL_MS`: delay between polls (default: 2000)
    /// - `QUEUE_MAX_POLL_ATTEMPTS`: polls per step before timing out (default: 150)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let backend = HttpBackendConfig {
            base_url: env_string("GENERATION_BASE_URL").unwrap_or(defaults.backend.base_url),
            app: env_string("GENERATION_APP").unwrap_or(defaults.backend.app),
            api_key: env_string("GENERATION_API_KEY").or_else(|| env_string("FAL_KEY")),
            timeout_secs: env_or("GENERATION_TIMEOUT_SECS", defaults.backend.timeout_secs),
        };

        let interval_ms = env_or("QUEUE_POLL_INTERVAL_MS", defaults.queue.poll.interval_ms);
        let max_polls = env_or("QUEUE_MAX_POLL_ATTEMPTS", defaults.queue.poll.max_attempts);
        let poll = PollBudget::new(max_polls, interval_ms);

        let queue = QueueClientConfig {
            batch_size: env_or("QUEUE_BATCH_SIZE", defaults.queue.batch_size).max(1),
            batch_delay_ms: env_or("QUEUE_BATCH_DELAY_MS", defaults.queue.batch_delay_ms),
            poll,
        };

        // The prerequisite step gets twice the budget of an ordinary step.
        let engine = EngineConfig {
            max_attempts: env_or("PIPELINE_MAX_ATTEMPTS", defaults.engine.max_attempts).max(1),
            item_concurrency: env_or(
                "PIPELINE_ITEM_CONCURRENCY",
                defaults.engine.item_concurrency,
            )
            .max(1),
            step_poll: poll,
            prerequisite_poll: PollBudget::new(max_polls.saturating_mul(2), interval_ms),
            fan_out_poll: poll,
            ..defaults.engine
        };

        Self {
            backend,
            queue,
            engine,
            log_dir: env_string("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            output_dir: env_string("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.backend.api_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.batch_delay_ms, 200);
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.output_dir, PathBuf::from("./output"));
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_env_or_falls_back() {
        assert_eq!(env_or("SCRIPT_FORGE_TEST_UNSET_VARIABLE", 7u32), 7);
        assert!(env_string("SCRIPT_FORGE_TEST_UNSET_VARIABLE").is_none());
    }
}
