//! Job queue client: submit, poll, batch-poll and fetch generation jobs.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::GenerationBackend;
use super::tracker::RequestTracker;
use super::types::{
    GenerationJob, GenerationOutput, GenerationRequest, JobStatus, PollBudget, StatusReport,
};
use crate::{Error, Result};

/// Configuration for the job queue client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueClientConfig {
    /// Number of status checks issued in parallel per batch.
    pub batch_size: usize,
    /// Pause between two status batches in milliseconds.
    pub batch_delay_ms: u64,
    /// Default polling budget for `poll_until_done`.
    pub poll: PollBudget,
}

impl Default for QueueClientConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay_ms: 200,
            poll: PollBudget::default(),
        }
    }
}

/// Client for the asynchronous generation queue.
///
/// Holds an explicit reference to the [`RequestTracker`]; tracked
/// submissions are registered there and every poll writes its result back.
pub struct JobQueueClient {
    backend: Arc<dyn GenerationBackend>,
    tracker: Arc<RequestTracker>,
    config: QueueClientConfig,
}

impl JobQueueClient {
    pub fn new(backend: Arc<dyn GenerationBackend>, tracker: Arc<RequestTracker>) -> Self {
        Self::with_config(backend, tracker, QueueClientConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn GenerationBackend>,
        tracker: Arc<RequestTracker>,
        config: QueueClientConfig,
    ) -> Self {
        Self {
            backend,
            tracker,
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &QueueClientConfig {
        &self.config
    }

    /// Submit a request without tracking it.
    pub async fn submit(&self, request: &GenerationRequest) -> Result<String> {
        self.backend.submit(request).await
    }

    /// Submit a request and register it as a `Pending` job.
    ///
    /// Fails with [`Error::StepInFlight`] before anything is sent if the same
    /// step already has a job in flight for this work item.
    pub async fn submit_tracked(
        &self,
        work_item_id: &str,
        request: &GenerationRequest,
    ) -> Result<String> {
        self.tracker.reserve(work_item_id, &request.step)?;

        let job_id = match self.backend.submit(request).await {
            Ok(job_id) => job_id,
            Err(e) => {
                self.tracker.release(work_item_id, &request.step);
                return Err(e);
            }
        };

        if let Err(e) = self
            .tracker
            .register(GenerationJob::new(&job_id, &request.step, work_item_id))
        {
            self.tracker.release(work_item_id, &request.step);
            return Err(e);
        }

        debug!(
            job_id = %job_id,
            step = %request.step,
            work_item_id,
            backend = self.backend.name(),
            "Submitted tracked job"
        );
        Ok(job_id)
    }

    /// Check the status of a single job.
    ///
    /// Transport failures surface as [`Error::Poll`]; retrying is up to the
    /// caller.
    pub async fn poll_status(&self, job_id: &str) -> Result<StatusReport> {
        let report = self.backend.status(job_id).await.map_err(|e| match e {
            Error::Poll(_) => e,
            other => Error::Poll(other.to_string()),
        })?;
        self.record_status(job_id, &report);
        Ok(report)
    }

    fn record_status(&self, job_id: &str, report: &StatusReport) {
        if !report.logs.is_empty() {
            let seen = self.tracker.observe_log_lines(job_id, report.logs.len());
            for line in &report.logs[seen..] {
                debug!(job_id, "backend: {}", line);
            }
        }
        self.tracker
            .update_status(job_id, report.status, None, report.error.clone());
    }

    /// Check the status of many jobs.
    ///
    /// IDs are processed in chunks of `batch_size`; the checks of one chunk
    /// run concurrently and chunks are separated by `batch_delay_ms`. A
    /// failed check omits that ID from the returned map without affecting
    /// the others.
    pub async fn batch_poll_status(&self, job_ids: &[String]) -> HashMap<String, StatusReport> {
        let batch_size = self.config.batch_size.max(1);
        let delay = Duration::from_millis(self.config.batch_delay_ms);
        let mut statuses = HashMap::with_capacity(job_ids.len());

        for (index, chunk) in job_ids.chunks(batch_size).enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let results = join_all(chunk.iter().map(|id| async move {
                (id, self.poll_status(id).await)
            }))
            .await;

            for (id, result) in results {
                match result {
                    Ok(report) => {
                        statuses.insert(id.clone(), report);
                    }
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "Status check failed; omitting from batch");
                    }
                }
            }
        }

        statuses
    }

    /// Fetch the output of a completed job.
    ///
    /// Fails with [`Error::ResultNotReady`] unless the job's latest known
    /// status is `Completed`. Untracked jobs are polled once first.
    pub async fn fetch_result(&self, job_id: &str) -> Result<GenerationOutput> {
        let status = match self.tracker.status(job_id) {
            Some(status) => status,
            None => self.poll_status(job_id).await?.status,
        };
        if status != JobStatus::Completed {
            return Err(Error::ResultNotReady(job_id.to_string()));
        }

        let output = self.backend.result(job_id).await?;
        self.tracker
            .update_status(job_id, JobStatus::Completed, Some(output.clone()), None);
        Ok(output)
    }

    /// Poll a job at a fixed interval until it reaches a terminal status.
    ///
    /// Returns the output once `Completed`, [`Error::JobFailed`] once
    /// `Failed` and [`Error::Timeout`] after `budget.max_attempts` polls
    /// without a terminal status. Poll transport errors count against the
    /// budget but do not end the wait.
    pub async fn poll_until_done(
        &self,
        job_id: &str,
        budget: PollBudget,
    ) -> Result<GenerationOutput> {
        for attempt in 1..=budget.max_attempts {
            match self.poll_status(job_id).await {
                Ok(report) => match report.status {
                    JobStatus::Completed => return self.fetch_result(job_id).await,
                    JobStatus::Failed => {
                        let reason = report
                            .error
                            .unwrap_or_else(|| "backend reported failure".to_string());
                        info!(job_id, reason = %reason, "Job failed");
                        return Err(Error::job_failed(reason));
                    }
                    status => {
                        debug!(
                            job_id,
                            attempt,
                            status = %status,
                            queue_position = ?report.queue_position,
                            "Job not finished yet"
                        );
                    }
                },
                Err(e) => {
                    warn!(job_id, attempt, error = %e, "Poll failed; will retry");
                }
            }

            if attempt < budget.max_attempts && !budget.interval().is_zero() {
                tokio::time::sleep(budget.interval()).await;
            }
        }

        Err(Error::Timeout(job_id.to_string()))
    }

    /// [`poll_until_done`](Self::poll_until_done) with the configured budget.
    pub async fn wait(&self, job_id: &str) -> Result<GenerationOutput> {
        self.poll_until_done(job_id, self.config.poll).await
    }
}
