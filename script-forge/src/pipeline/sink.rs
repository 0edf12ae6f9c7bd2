//! Result persistence.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::utils::filename::{numbered_filename, slugify};
use crate::{Error, Result};

const COUNTER_FILE: &str = ".counter";

/// Where a result ended up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedResult {
    /// Sequence number assigned by the sink.
    pub number: u64,
    pub filename: String,
    /// Full path or other sink-specific location.
    pub location: String,
}

/// Destination for finished work item results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist `result` under the next sequence number.
    async fn save(&self, slug: &str, result: &Value) -> Result<SavedResult>;

    fn name(&self) -> &'static str;
}

/// Writes each result as a pretty-printed JSON file named
/// `{number:04}_{slug}.json`.
///
/// The sequence counter lives in a `.counter` file next to the results so
/// numbering continues across restarts.
pub struct FileResultSink {
    dir: PathBuf,
    counter: AsyncMutex<Option<u64>>,
}

impl FileResultSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: AsyncMutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Last number handed out. A missing counter starts at 0; an unreadable
    /// one is an error, never a reset.
    async fn load_counter(&self) -> Result<u64> {
        let path = self.dir.join(COUNTER_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => content.trim().parse::<u64>().map_err(|e| {
                Error::config(format!("corrupt result counter {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ResultSink for FileResultSink {
    async fn save(&self, slug: &str, result: &Value) -> Result<SavedResult> {
        let mut counter = self.counter.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;

        let last = match *counter {
            Some(n) => n,
            None => self.load_counter().await?,
        };
        let number = last + 1;
        let filename = numbered_filename(number, &slugify(slug));
        let path = self.dir.join(&filename);

        tokio::fs::write(&path, serde_json::to_vec_pretty(result)?).await?;
        tokio::fs::write(self.dir.join(COUNTER_FILE), number.to_string()).await?;
        *counter = Some(number);

        info!(path = %path.display(), number, "Saved result");
        Ok(SavedResult {
            number,
            filename,
            location: path.display().to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Keeps results in memory.
#[derive(Default)]
pub struct MemoryResultSink {
    saved: Mutex<Vec<(SavedResult, Value)>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything saved so far, in save order.
    pub fn results(&self) -> Vec<Value> {
        self.saved.lock().iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn saved(&self) -> Vec<SavedResult> {
        self.saved.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.saved.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.lock().is_empty()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn save(&self, slug: &str, result: &Value) -> Result<SavedResult> {
        let mut saved = self.saved.lock();
        let number = saved.len() as u64 + 1;
        let filename = numbered_filename(number, &slugify(slug));
        let entry = SavedResult {
            number,
            location: format!("memory://{}", filename),
            filename,
        };
        debug!(number, "Stored result in memory");
        saved.push((entry.clone(), result.clone()));
        Ok(entry)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_sink_numbers_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileResultSink::new(dir.path().join("out"));

        let first = sink.save("Neon Hearts", &json!({"a": 1})).await.unwrap();
        let second = sink.save("Neon Hearts", &json!({"a": 2})).await.unwrap();

        assert_eq!(first.number, 1);
        assert_eq!(first.filename, "0001_neon-hearts.json");
        assert_eq!(second.number, 2);

        let content = std::fs::read_to_string(&second.location).unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["a"], 2);
    }

    #[tokio::test]
    async fn test_file_sink_counter_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        FileResultSink::new(dir.path())
            .save("one", &json!({}))
            .await
            .unwrap();

        let saved = FileResultSink::new(dir.path())
            .save("two", &json!({}))
            .await
            .unwrap();
        assert_eq!(saved.number, 2);
        assert_eq!(saved.filename, "0002_two.json");
    }

    #[tokio::test]
    async fn test_file_sink_refuses_corrupt_counter() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileResultSink::new(dir.path())
            .save("song", &json!({"v": "first"}))
            .await
            .unwrap();
        std::fs::write(dir.path().join(COUNTER_FILE), "garbage").unwrap();

        let err = FileResultSink::new(dir.path())
            .save("song", &json!({"v": "second"}))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        let content = std::fs::read_to_string(&first.location).unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["v"], "first");
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemoryResultSink::new();
        assert!(sink.is_empty());
        sink.save("x", &json!({"k": "v"})).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.results()[0]["k"], "v");
        assert_eq!(sink.saved()[0].number, 1);
    }
}
