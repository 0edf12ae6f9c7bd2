//! Single step invocations.
//!
//! A step renders its prompt, submits a tracked job, waits for it and parses
//! the output. The job is always removed from the tracker once the step is
//! done with it, whatever the outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::definition::StepConfig;
use super::prompts::{PromptTemplates, PromptVars};
use crate::queue::{GenerationJob, GenerationRequest, JobQueueClient, JobStatus, PollBudget};
use crate::{Error, Result};

/// Audit entry for one submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub step: String,
    pub attempt: u32,
    pub submitted_at: DateTime<Utc>,
    /// Set once the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last status observed before the job was released.
    pub status: JobStatus,
}

impl JobRecord {
    fn from_job(job: &GenerationJob, attempt: u32) -> Self {
        Self {
            job_id: job.job_id.clone(),
            step: job.step_name.clone(),
            attempt,
            submitted_at: job.submitted_at,
            completed_at: job.status.is_terminal().then_some(job.updated_at),
            status: job.status,
        }
    }
}

/// One full pass of the step sequence for one work item.
///
/// Discarded when the attempt fails; its jobs become part of the persisted
/// result when it succeeds.
#[derive(Debug, Clone)]
pub struct PipelineAttempt {
    pub attempt_number: u32,
    pub work_item_id: String,
    pub jobs: Vec<JobRecord>,
}

impl PipelineAttempt {
    pub fn new(attempt_number: u32, work_item_id: impl Into<String>) -> Self {
        Self {
            attempt_number,
            work_item_id: work_item_id.into(),
            jobs: Vec::new(),
        }
    }

    fn record_release(&mut self, job_id: &str, step: &str, job: Option<GenerationJob>) {
        let record = match job {
            Some(job) => JobRecord::from_job(&job, self.attempt_number),
            None => JobRecord {
                job_id: job_id.to_string(),
                step: step.to_string(),
                attempt: self.attempt_number,
                submitted_at: Utc::now(),
                completed_at: None,
                status: JobStatus::Pending,
            },
        };
        self.jobs.push(record);
    }
}

/// A fan-out step that has been submitted but not yet consumed.
#[derive(Debug)]
pub struct PendingStep {
    pub job_id: String,
    pub step: StepConfig,
}

/// Executes steps against the job queue.
pub struct StepRunner {
    client: Arc<JobQueueClient>,
    templates: Arc<PromptTemplates>,
}

impl StepRunner {
    pub fn new(client: Arc<JobQueueClient>, templates: Arc<PromptTemplates>) -> Self {
        Self { client, templates }
    }

    pub fn client(&self) -> &Arc<JobQueueClient> {
        &self.client
    }

    fn request(&self, step: &StepConfig, vars: &PromptVars) -> Result<GenerationRequest> {
        let prompt = self.templates.render(&step.template, vars)?;
        Ok(GenerationRequest::new(&step.name, &step.model, prompt.user)
            .with_system_prompt(prompt.system)
            .with_temperature(step.temperature))
    }

    fn parse(step: &StepConfig, raw: &str) -> Result<Vec<String>> {
        let records = step.format.parse(raw)?;
        let records = match step.post_process {
            Some(post) => post.apply(records),
            None => records,
        };
        if records.is_empty() {
            return Err(Error::parse(format!("{} produced no usable records", step.name)));
        }
        Ok(records)
    }

    /// Run a step to completion, waiting with `budget`.
    pub async fn run(
        &self,
        attempt: &mut PipelineAttempt,
        step: &StepConfig,
        vars: &PromptVars,
        budget: PollBudget,
    ) -> Result<Vec<String>> {
        let pending = self.submit(attempt, step, vars).await?;
        let outcome = self.client.poll_until_done(&pending.job_id, budget).await;
        self.release(attempt, &pending);

        let output = outcome?;
        Self::parse(step, &output.output)
    }

    /// Submit a step without waiting for it.
    pub async fn submit(
        &self,
        attempt: &PipelineAttempt,
        step: &StepConfig,
        vars: &PromptVars,
    ) -> Result<PendingStep> {
        let request = self.request(step, vars)?;
        let job_id = self
            .client
            .submit_tracked(&attempt.work_item_id, &request)
            .await?;
        debug!(
            job_id = %job_id,
            step = %step.name,
            work_item_id = %attempt.work_item_id,
            attempt = attempt.attempt_number,
            "Step submitted"
        );
        Ok(PendingStep {
            job_id,
            step: step.clone(),
        })
    }

    /// Consume a pending step whose job has completed.
    pub async fn finish(
        &self,
        attempt: &mut PipelineAttempt,
        pending: PendingStep,
    ) -> Result<Vec<String>> {
        let outcome = self.client.fetch_result(&pending.job_id).await;
        self.release(attempt, &pending);

        let output = outcome?;
        Self::parse(&pending.step, &output.output)
    }

    /// Stop waiting for a pending step. The backend job keeps running.
    pub fn abandon(&self, attempt: &mut PipelineAttempt, pending: PendingStep) {
        debug!(job_id = %pending.job_id, step = %pending.step.name, "Abandoning step");
        self.release(attempt, &pending);
    }

    fn release(&self, attempt: &mut PipelineAttempt, pending: &PendingStep) {
        let job = self.client.tracker().remove(&pending.job_id);
        attempt.record_release(&pending.job_id, &pending.step.name, job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::parser::{OutputFormat, PostProcess};
    use crate::queue::{
        GenerationBackend, GenerationOutput, QueueClientConfig, RequestTracker, StatusReport,
    };
    use async_trait::async_trait;

    /// Completes every job immediately with a fixed output.
    struct EchoBackend {
        output: String,
        fail: bool,
    }

    #[async_trait]
    impl GenerationBackend for EchoBackend {
        async fn submit(&self, request: &GenerationRequest) -> Result<String> {
            Ok(format!("job-{}", request.step))
        }

        async fn status(&self, _job_id: &str) -> Result<StatusReport> {
            if self.fail {
                Ok(StatusReport::failed("model overloaded"))
            } else {
                Ok(StatusReport::new(JobStatus::Completed))
            }
        }

        async fn result(&self, _job_id: &str) -> Result<GenerationOutput> {
            Ok(GenerationOutput::new(self.output.clone()))
        }

        fn name(&self) -> &'static str {
            "echo"
        }
    }

    fn runner(output: &str, fail: bool) -> StepRunner {
        let backend = Arc::new(EchoBackend {
            output: output.to_string(),
            fail,
        });
        let client = JobQueueClient::with_config(
            backend,
            Arc::new(RequestTracker::new()),
            QueueClientConfig {
                batch_delay_ms: 0,
                poll: PollBudget::new(3, 0),
                ..Default::default()
            },
        );
        StepRunner::new(Arc::new(client), Arc::new(PromptTemplates::default()))
    }

    fn title_step() -> StepConfig {
        StepConfig::new("TITLE", "m", 0.5, OutputFormat::PlainText)
            .with_post_process(PostProcess::StripQuotes)
    }

    fn title_vars() -> PromptVars {
        PromptVars::new().set("topic", "t").set("segment", "1. a")
    }

    #[tokio::test]
    async fn test_run_parses_and_releases() {
        let runner = runner("\"Neon Hearts\"", false);
        let mut attempt = PipelineAttempt::new(1, "req:0");

        let records = runner
            .run(&mut attempt, &title_step(), &title_vars(), PollBudget::new(3, 0))
            .await
            .unwrap();

        assert_eq!(records, vec!["Neon Hearts"]);
        assert!(runner.client().tracker().is_empty());
        assert_eq!(attempt.jobs.len(), 1);
        assert_eq!(attempt.jobs[0].status, JobStatus::Completed);
        assert!(attempt.jobs[0].completed_at.is_some());
        assert_eq!(attempt.jobs[0].step, "TITLE");
    }

    #[tokio::test]
    async fn test_failed_job_is_released() {
        let runner = runner("unused", true);
        let mut attempt = PipelineAttempt::new(2, "req:0");

        let err = runner
            .run(&mut attempt, &title_step(), &title_vars(), PollBudget::new(3, 0))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::JobFailed { .. }));
        assert!(runner.client().tracker().is_empty());
        assert_eq!(attempt.jobs[0].status, JobStatus::Failed);
        assert_eq!(attempt.jobs[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_missing_template_var_never_submits() {
        let runner = runner("x", false);
        let mut attempt = PipelineAttempt::new(1, "req:0");

        let err = runner
            .run(&mut attempt, &title_step(), &PromptVars::new(), PollBudget::new(3, 0))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert!(attempt.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_abandon_releases_in_flight_slot() {
        let runner = runner("x", false);
        let mut attempt = PipelineAttempt::new(1, "req:0");

        let pending = runner
            .submit(&attempt, &title_step(), &title_vars())
            .await
            .unwrap();
        assert_eq!(runner.client().tracker().in_flight_count(), 1);

        runner.abandon(&mut attempt, pending);
        assert_eq!(runner.client().tracker().in_flight_count(), 0);
        assert_eq!(attempt.jobs[0].status, JobStatus::Pending);
    }
}
