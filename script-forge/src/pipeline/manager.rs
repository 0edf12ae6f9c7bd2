//! Pipeline run manager.
//!
//! Accepts batches from the trigger interface, assigns each run a request
//! ID and drives it in the background. Progress flows through the
//! [`LogHub`]; every run ends with exactly one completion notice.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::definition::PipelineOptions;
use super::engine::{BatchSummary, PipelineEngine, WorkItem};
use crate::hub::{LogHub, RunReporter};
use crate::{Error, Result};

/// Finished runs retained for status queries.
const MAX_RETAINED_RUNS: usize = 100;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Finished,
    Cancelled,
}

/// Status of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub request_id: String,
    pub state: RunState,
    pub items: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<BatchSummary>,
}

/// Pipeline statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Runs still in progress.
    pub active_runs: usize,
    /// Finished or cancelled runs still retained.
    pub finished_runs: usize,
    /// Jobs currently held by the request tracker.
    pub tracked_jobs: usize,
    /// (work item, step) pairs with a job in flight.
    pub in_flight_steps: usize,
    /// Live log subscribers.
    pub subscribers: usize,
}

/// Starts and tracks pipeline runs.
pub struct PipelineManager {
    engine: Arc<PipelineEngine>,
    hub: LogHub,
    runs: Arc<DashMap<String, RunStatus>>,
    tasks: parking_lot::Mutex<JoinSet<()>>,
    cancellation_token: CancellationToken,
}

impl PipelineManager {
    pub fn new(engine: Arc<PipelineEngine>, hub: LogHub) -> Self {
        Self {
            engine,
            hub,
            runs: Arc::new(DashMap::new()),
            tasks: parking_lot::Mutex::new(JoinSet::new()),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    pub fn engine(&self) -> &Arc<PipelineEngine> {
        &self.engine
    }

    /// Validate a batch and start it in the background.
    ///
    /// Returns the new request ID immediately.
    pub fn start(&self, items: Vec<WorkItem>, options: PipelineOptions) -> Result<String> {
        validate_items(&items)?;
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Other("pipeline manager is shutting down".to_string()));
        }

        let request_id = Uuid::new_v4().to_string();
        self.runs.insert(
            request_id.clone(),
            RunStatus {
                request_id: request_id.clone(),
                state: RunState::Running,
                items: items.len(),
                started_at: Utc::now(),
                finished_at: None,
                summary: None,
            },
        );
        self.evict_finished();

        let engine = self.engine.clone();
        let runs = self.runs.clone();
        let token = self.cancellation_token.child_token();
        let reporter = RunReporter::new(self.hub.clone(), request_id.clone());
        info!(
            request_id = %request_id,
            items = items.len(),
            variant = %options.variant,
            "Starting pipeline run"
        );

        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let outcome = tokio::select! {
                summary = engine.run_batch(&reporter, items, &options) => Some(summary),
                _ = token.cancelled() => None,
            };

            let (state, message) = match &outcome {
                Some(summary) => (RunState::Finished, summary.message()),
                None => (RunState::Cancelled, "Pipeline cancelled".to_string()),
            };
            if let Some(mut run) = runs.get_mut(reporter.request_id()) {
                run.state = state;
                run.finished_at = Some(Utc::now());
                run.summary = outcome;
            }
            reporter.complete(message);
        });

        Ok(request_id)
    }

    /// Status of a run, if still retained.
    pub fn run_status(&self, request_id: &str) -> Option<RunStatus> {
        self.runs.get(request_id).map(|run| run.clone())
    }

    pub fn stats(&self) -> PipelineStats {
        let active_runs = self
            .runs
            .iter()
            .filter(|run| run.state == RunState::Running)
            .count();
        let tracker = self.engine.client().tracker();
        PipelineStats {
            active_runs,
            finished_runs: self.runs.len() - active_runs,
            tracked_jobs: tracker.len(),
            in_flight_steps: tracker.in_flight_count(),
            subscribers: self.hub.subscriber_count(),
        }
    }

    /// Cancel every run and wait for the tasks to wind down.
    ///
    /// Jobs already submitted keep running on the backend.
    pub async fn stop(&self) {
        info!("Stopping pipeline manager");
        self.cancellation_token.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while tasks.join_next().await.is_some() {}
        info!("Pipeline manager stopped");
    }

    /// Drop the oldest finished runs beyond the retention limit.
    fn evict_finished(&self) {
        let mut finished: Vec<(DateTime<Utc>, String)> = self
            .runs
            .iter()
            .filter(|run| run.state != RunState::Running)
            .map(|run| (run.started_at, run.request_id.clone()))
            .collect();
        if finished.len() <= MAX_RETAINED_RUNS {
            return;
        }
        finished.sort();
        let excess = finished.len() - MAX_RETAINED_RUNS;
        for (_, request_id) in finished.into_iter().take(excess) {
            debug!(request_id = %request_id, "Evicting finished run");
            self.runs.remove(&request_id);
        }
    }
}

fn validate_items(items: &[WorkItem]) -> Result<()> {
    if items.is_empty() {
        return Err(Error::invalid_request("at least one item is required"));
    }
    for (index, item) in items.iter().enumerate() {
        if item.topic.trim().is_empty() {
            return Err(Error::invalid_request(format!("item {} has no topic", index)));
        }
        if item.lines.iter().all(|line| line.trim().is_empty()) {
            warn!(index, topic = %item.topic, "Rejecting item without lines");
            return Err(Error::invalid_request(format!(
                "item {} ('{}') has no lines",
                index, item.topic
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_items() {
        assert!(validate_items(&[]).is_err());
        assert!(validate_items(&[WorkItem::new("a", vec![" ".into()])]).is_err());
        assert!(validate_items(&[WorkItem::new(" ", vec!["x".into()])]).is_err());
        assert!(validate_items(&[WorkItem::new("a", vec!["x".into()])]).is_ok());
    }
}
