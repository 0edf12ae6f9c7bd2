//! In-memory registry of submitted generation jobs.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use tracing::{debug, trace};

use super::types::{GenerationJob, GenerationOutput, JobStatus};
use crate::{Error, Result};

/// Key of the in-flight index.
type StepKey = (String, String);

/// Tracks submitted jobs until the engine has consumed their result.
///
/// Besides the job map, the tracker keeps an index of which
/// (work item, step) pairs currently have a job in flight, so the same step
/// is never submitted twice concurrently for one item.
#[derive(Debug, Default)]
pub struct RequestTracker {
    /// Tracked jobs by job ID.
    jobs: DashMap<String, GenerationJob>,
    /// (work item, step) -> job ID. An empty job ID marks a reservation
    /// whose submission has not returned yet.
    in_flight: DashMap<StepKey, String>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(work_item_id: &str, step_name: &str) -> StepKey {
        (work_item_id.to_string(), step_name.to_string())
    }

    /// Reserve the (work item, step) slot ahead of a submission.
    pub fn reserve(&self, work_item_id: &str, step_name: &str) -> Result<()> {
        match self.in_flight.entry(Self::key(work_item_id, step_name)) {
            Entry::Occupied(_) => Err(Error::StepInFlight {
                work_item_id: work_item_id.to_string(),
                step: step_name.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(String::new());
                Ok(())
            }
        }
    }

    /// Drop a reservation whose submission failed.
    pub fn release(&self, work_item_id: &str, step_name: &str) {
        self.in_flight
            .remove_if(&Self::key(work_item_id, step_name), |_, job_id| {
                job_id.is_empty()
            });
    }

    /// Register a freshly submitted job in `Pending` state.
    ///
    /// Fills a prior reservation for the same (work item, step) if one exists.
    pub fn register(&self, job: GenerationJob) -> Result<()> {
        let key = Self::key(&job.work_item_id, &job.step_name);
        match self.in_flight.entry(key) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_empty() && slot.get() != &job.job_id {
                    return Err(Error::StepInFlight {
                        work_item_id: job.work_item_id,
                        step: job.step_name,
                    });
                }
                slot.insert(job.job_id.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(job.job_id.clone());
            }
        }

        if self.jobs.contains_key(&job.job_id) {
            return Err(Error::Other(format!("job {} already tracked", job.job_id)));
        }

        debug!(
            job_id = %job.job_id,
            step = %job.step_name,
            work_item_id = %job.work_item_id,
            "Tracking job"
        );
        self.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    /// Update the status of a tracked job. Returns false for unknown IDs.
    pub fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<GenerationOutput>,
        error: Option<String>,
    ) -> bool {
        let released = {
            let Some(mut job) = self.jobs.get_mut(job_id) else {
                return false;
            };
            if job.status != status {
                trace!(job_id, from = %job.status, to = %status, "Job status changed");
                job.updated_at = Utc::now();
            }
            job.status = status;
            if result.is_some() {
                job.result = result;
            }
            if error.is_some() {
                job.error = error;
            }
            status
                .is_terminal()
                .then(|| Self::key(&job.work_item_id, &job.step_name))
        };

        // The job map guard is dropped before touching the index.
        if let Some(key) = released {
            self.in_flight.remove_if(&key, |_, id| id == job_id);
        }
        true
    }

    /// Record the backend's cumulative log length for a job.
    ///
    /// Returns how many of those lines had already been seen, so callers
    /// can surface only the new tail. Unknown jobs have seen nothing.
    pub fn observe_log_lines(&self, job_id: &str, total: usize) -> usize {
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return 0;
        };
        let seen = job.log_lines.min(total);
        job.log_lines = job.log_lines.max(total);
        seen
    }

    /// Snapshot of a tracked job.
    pub fn get(&self, job_id: &str) -> Option<GenerationJob> {
        self.jobs.get(job_id).map(|job| job.clone())
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|job| job.status)
    }

    /// Status lookup for several jobs; unknown IDs are omitted.
    pub fn statuses(&self, job_ids: &[String]) -> HashMap<String, JobStatus> {
        job_ids
            .iter()
            .filter_map(|id| self.status(id).map(|status| (id.clone(), status)))
            .collect()
    }

    /// Remove a job once its result has been consumed.
    pub fn remove(&self, job_id: &str) -> Option<GenerationJob> {
        let (_, job) = self.jobs.remove(job_id)?;
        self.in_flight
            .remove_if(&Self::key(&job.work_item_id, &job.step_name), |_, id| {
                id == job_id
            });
        Some(job)
    }

    /// All tracked jobs of one work item.
    pub fn jobs_for_item(&self, work_item_id: &str) -> Vec<GenerationJob> {
        self.jobs
            .iter()
            .filter(|job| job.work_item_id == work_item_id)
            .map(|job| job.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of (work item, step) pairs with a job in flight or reserved.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let tracker = RequestTracker::new();
        tracker
            .register(GenerationJob::new("job-1", "TITLE", "item-1"))
            .unwrap();

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.status("job-1"), Some(JobStatus::Pending));
        assert_eq!(tracker.in_flight_count(), 1);

        let removed = tracker.remove("job-1").unwrap();
        assert_eq!(removed.step_name, "TITLE");
        assert!(tracker.is_empty());
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn test_second_submission_for_same_step_is_rejected() {
        let tracker = RequestTracker::new();
        tracker
            .register(GenerationJob::new("job-1", "TITLE", "item-1"))
            .unwrap();

        let err = tracker.reserve("item-1", "TITLE").unwrap_err();
        assert!(matches!(err, Error::StepInFlight { .. }));

        let err = tracker
            .register(GenerationJob::new("job-2", "TITLE", "item-1"))
            .unwrap_err();
        assert!(matches!(err, Error::StepInFlight { .. }));

        // Different item or different step is fine.
        tracker.reserve("item-2", "TITLE").unwrap();
        tracker.reserve("item-1", "TAGS").unwrap();
    }

    #[test]
    fn test_terminal_status_frees_the_step() {
        let tracker = RequestTracker::new();
        tracker
            .register(GenerationJob::new("job-1", "TITLE", "item-1"))
            .unwrap();

        assert!(tracker.update_status("job-1", JobStatus::Processing, None, None));
        assert!(tracker.reserve("item-1", "TITLE").is_err());

        assert!(tracker.update_status(
            "job-1",
            JobStatus::Completed,
            Some(GenerationOutput::new("done")),
            None
        ));
        let job = tracker.get("job-1").unwrap();
        assert_eq!(job.result.unwrap().output, "done");
        assert_eq!(tracker.in_flight_count(), 0);

        tracker.reserve("item-1", "TITLE").unwrap();
    }

    #[test]
    fn test_reservation_filled_by_register_and_released_on_failure() {
        let tracker = RequestTracker::new();
        tracker.reserve("item-1", "TAGS").unwrap();
        assert_eq!(tracker.in_flight_count(), 1);

        tracker.release("item-1", "TAGS");
        assert_eq!(tracker.in_flight_count(), 0);

        tracker.reserve("item-1", "TAGS").unwrap();
        tracker
            .register(GenerationJob::new("job-9", "TAGS", "item-1"))
            .unwrap();
        // A filled slot is not released by a stale release call.
        tracker.release("item-1", "TAGS");
        assert!(matches!(
            tracker.reserve("item-1", "TAGS"),
            Err(Error::StepInFlight { .. })
        ));
    }

    #[test]
    fn test_observe_log_lines_counts_only_new_lines() {
        let tracker = RequestTracker::new();
        tracker
            .register(GenerationJob::new("job-1", "TITLE", "item-1"))
            .unwrap();

        assert_eq!(tracker.observe_log_lines("job-1", 2), 0);
        assert_eq!(tracker.observe_log_lines("job-1", 2), 2);
        assert_eq!(tracker.observe_log_lines("job-1", 5), 2);
        assert_eq!(tracker.get("job-1").unwrap().log_lines, 5);
        assert_eq!(tracker.observe_log_lines("unknown", 4), 0);
    }

    #[test]
    fn test_update_unknown_job() {
        let tracker = RequestTracker::new();
        assert!(!tracker.update_status("missing", JobStatus::Failed, None, None));
        assert!(tracker.remove("missing").is_none());
    }

    #[test]
    fn test_statuses_omit_unknown_ids() {
        let tracker = RequestTracker::new();
        tracker
            .register(GenerationJob::new("a", "S1", "item"))
            .unwrap();
        tracker
            .register(GenerationJob::new("b", "S2", "item"))
            .unwrap();
        tracker.update_status("b", JobStatus::Failed, None, Some("boom".into()));

        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let statuses = tracker.statuses(&ids);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["a"], JobStatus::Pending);
        assert_eq!(statuses["b"], JobStatus::Failed);
        assert_eq!(tracker.jobs_for_item("item").len(), 2);
    }
}
